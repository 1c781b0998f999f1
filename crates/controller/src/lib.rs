//! Tether controllers.
//!
//! Two loops share one [`Wiring`]: the provider loop watches Services and
//! pushes their values into every Deployment that relates to them, the
//! consumer loop watches Deployments and pulls values from the Services they
//! relate to. Either side converges on its own; the patch is empty once the
//! values are in place.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use tether_core::model::deployment_spec;
use tether_core::{
    InterfaceTable, Layout, LookupError, MutationPolicy, ObjectLister, Patcher, ReconcileKey, RelationIntent,
    RelationResolver, RelationStrategy, Role,
};
use tether_kubehub::{ClusterContext, KubeLister, KubePatcher};
use tether_patch::PatchBuilder;
use tether_reconcile::{Backoff, Controller, Handler, HandlerError, LoopConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything both loops need to compute and submit a consumer patch.
pub struct Wiring<L, P> {
    resolver: RelationResolver<L>,
    table: InterfaceTable,
    policy: MutationPolicy,
    patcher: P,
}

impl<L, P> Wiring<L, P>
where
    L: ObjectLister<Deployment> + ObjectLister<Service>,
    P: Patcher<Deployment>,
{
    pub fn new(resolver: RelationResolver<L>, table: InterfaceTable, policy: MutationPolicy, patcher: P) -> Self {
        Self { resolver, table, policy, patcher }
    }

    /// Patch `consumer` so every container and init step carries `env`.
    /// Returns whether a patch was submitted.
    async fn wire(
        &self,
        namespace: &str,
        consumer: &Deployment,
        env: &BTreeMap<String, String>,
    ) -> Result<bool, HandlerError> {
        let Some(name) = consumer.metadata.name.as_deref() else { return Ok(false) };
        let mut b = PatchBuilder::new(deployment_spec(consumer), Layout::DEPLOYMENT);
        b.guard_resource_version(consumer.metadata.resource_version.as_deref());
        b.set_env(env);
        let patch = b.finish();
        if patch.is_empty() {
            debug!(ns = %namespace, consumer = %name, "consumer already wired");
            return Ok(false);
        }
        self.patcher.apply(namespace, name, patch.ops()).await?;
        counter!("consumer_patches", 1u64);
        info!(ns = %namespace, consumer = %name, vars = env.len(), "consumer wired");
        Ok(true)
    }

    /// Namespace and intent of `role`, when the policy places the object on
    /// that side.
    fn intent<'k>(
        &self,
        key: &'k ReconcileKey,
        meta: &ObjectMeta,
        role: Role,
    ) -> Option<(&'k str, RelationIntent)> {
        let ns = key.namespace.as_deref()?;
        match self.policy.intent(ns, meta, role) {
            Some(intent) => Some((ns, intent)),
            None => {
                debug!(key = %key, ?role, "not in scope for this side; skipping");
                None
            }
        }
    }
}

/// Service side: push the provider's values into its consumers.
pub struct ProviderHandler<L, P> {
    wiring: Arc<Wiring<L, P>>,
}

impl<L, P> ProviderHandler<L, P> {
    pub fn new(wiring: Arc<Wiring<L, P>>) -> Self {
        Self { wiring }
    }
}

#[async_trait]
impl<L, P> Handler<Service> for ProviderHandler<L, P>
where
    L: ObjectLister<Deployment> + ObjectLister<Service> + 'static,
    P: Patcher<Deployment> + 'static,
{
    async fn reconcile(&self, key: &ReconcileKey, obj: Option<Arc<Service>>) -> Result<(), HandlerError> {
        let w = &self.wiring;
        let Some(svc) = obj else {
            debug!(key = %key, "provider gone");
            return Ok(());
        };
        let Some((ns, provider)) = w.intent(key, &svc.metadata, Role::Provides) else { return Ok(()) };
        let iface = provider.interface;
        let env = w.table.resolve_env(&iface, &svc);
        if env.is_empty() {
            debug!(key = %key, interface = %iface, "provider offers no values yet");
            return Ok(());
        }

        let consumers: Vec<Deployment> = w.resolver.consumers_of(ns, &key.name).await?;
        debug!(key = %key, consumers = consumers.len(), "provider relations resolved");
        let mut first_err = None;
        for consumer in &consumers {
            match w.policy.intent(ns, &consumer.metadata, Role::Consumes) {
                Some(wanted) if wanted.interface == iface => {}
                other => {
                    let consumes = other.map(|i| i.interface);
                    debug!(key = %key, consumer = ?consumer.metadata.name, ?consumes, "interface mismatch; skipping");
                    continue;
                }
            }
            if let Err(e) = w.wire(ns, consumer, &env).await {
                warn!(key = %key, consumer = ?consumer.metadata.name, error = %e, "wiring consumer failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Deployment side: pull values from the providers the consumer names.
pub struct ConsumerHandler<L, P> {
    wiring: Arc<Wiring<L, P>>,
}

impl<L, P> ConsumerHandler<L, P> {
    pub fn new(wiring: Arc<Wiring<L, P>>) -> Self {
        Self { wiring }
    }
}

#[async_trait]
impl<L, P> Handler<Deployment> for ConsumerHandler<L, P>
where
    L: ObjectLister<Deployment> + ObjectLister<Service> + 'static,
    P: Patcher<Deployment> + 'static,
{
    async fn reconcile(&self, key: &ReconcileKey, obj: Option<Arc<Deployment>>) -> Result<(), HandlerError> {
        let w = &self.wiring;
        let Some(d) = obj else { return Ok(()) };
        let Some((ns, consumer)) = w.intent(key, &d.metadata, Role::Consumes) else { return Ok(()) };
        let providers = w.resolver.providers_for(ns, &consumer).await.map_err(|e: LookupError| {
            counter!("lookup_failures", 1u64, "side" => "consumer");
            e
        })?;
        let env = w.table.env_from(&consumer.interface, &providers);
        if env.is_empty() {
            debug!(key = %key, interface = %consumer.interface, "no provider values available");
            return Ok(());
        }
        w.wire(ns, &d, &env).await?;
        Ok(())
    }
}

/// Knobs shared by both loops.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub resync: Option<Duration>,
    pub strategy: RelationStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 5,
            backoff: Backoff::default(),
            resync: Some(Duration::from_secs(300)),
            strategy: RelationStrategy::default(),
        }
    }
}

impl Settings {
    fn loop_config(&self, name: &'static str) -> LoopConfig {
        LoopConfig {
            name,
            workers: self.workers,
            max_retries: self.max_retries,
            backoff: self.backoff,
            resync: self.resync,
        }
    }
}

/// Run the provider and consumer loops against the cluster until `shutdown`.
pub async fn run(
    ctx: &ClusterContext,
    table: InterfaceTable,
    policy: MutationPolicy,
    settings: Settings,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let resolver = RelationResolver::new(ctx.lister(), ctx.vocab.clone(), settings.strategy);
    let wiring: Arc<Wiring<KubeLister, KubePatcher>> = Arc::new(Wiring::new(resolver, table, policy, ctx.patcher()));
    info!(ns = %ctx.namespace, strategy = %settings.strategy, workers = settings.workers, "starting controllers");

    let providers = Controller::new(
        settings.loop_config("providers"),
        ctx.source::<Service>(),
        ProviderHandler::new(Arc::clone(&wiring)),
    );
    let consumers =
        Controller::new(settings.loop_config("consumers"), ctx.source::<Deployment>(), ConsumerHandler::new(wiring));
    run_pair(providers.run(shutdown.clone()), consumers.run(shutdown.clone()), &shutdown).await
}

/// Await both loops to completion. The first failure cancels `shutdown` so
/// the other loop drains its workers instead of being dropped mid-run.
async fn run_pair<A, B>(a: A, b: B, shutdown: &CancellationToken) -> anyhow::Result<()>
where
    A: Future<Output = anyhow::Result<()>>,
    B: Future<Output = anyhow::Result<()>>,
{
    let stop_on_err = |res: anyhow::Result<()>| {
        if let Err(e) = &res {
            warn!(error = %e, "controller loop failed; stopping the other");
            shutdown.cancel();
        }
        res
    };
    let (a, b) = tokio::join!(async { stop_on_err(a.await) }, async { stop_on_err(b.await) });
    a.and(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn failing_loop_stops_and_awaits_the_other() {
        let token = CancellationToken::new();
        let drained = Arc::new(AtomicBool::new(false));
        let other = {
            let (token, drained) = (token.clone(), Arc::clone(&drained));
            async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                drained.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        };
        let failing = async { Err::<(), _>(anyhow::anyhow!("initial list failed")) };

        let res = tokio::time::timeout(Duration::from_secs(5), run_pair(failing, other, &token)).await;
        assert!(res.expect("both loops return").is_err());
        assert!(token.is_cancelled());
        assert!(drained.load(Ordering::SeqCst));
    }
}
