use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use tether_controller::Settings;
use tether_core::vocab::DEFAULT_DOMAIN;
use tether_core::{
    InjectorConfig, MutationPolicy, ObjectLister, RelationResolver, RelationStrategy, Role, Vocabulary, Workload,
};
use tether_kubehub::ClusterContext;
use tether_reconcile::Backoff;
use tether_webhook::{AdmissionInjector, FailureMode, WebhookState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether: relation wiring for Kubernetes workloads")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", env = "TETHER_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Label/annotation domain, e.g. tether.io -> tether.io/provides
    #[arg(long = "domain", env = "TETHER_DOMAIN", global = true, default_value = DEFAULT_DOMAIN)]
    domain: String,

    /// Injector config (YAML): init steps, extra interfaces, reserved namespaces
    #[arg(long = "config", env = "TETHER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// How consumers of a provider are found: exact (label) or scan (annotation list)
    #[arg(
        long = "relation-strategy",
        env = "TETHER_RELATION_STRATEGY",
        global = true,
        default_value_t = RelationStrategy::Scan
    )]
    strategy: RelationStrategy,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the provider and consumer reconciliation loops
    Controller {
        #[arg(long = "workers", env = "TETHER_WORKERS", default_value_t = 2)]
        workers: usize,
        /// Handler invocations per key before it is dropped
        #[arg(long = "max-retries", env = "TETHER_MAX_RETRIES", default_value_t = 5)]
        max_retries: u32,
        /// Full relist period in seconds; 0 disables
        #[arg(long = "resync-secs", env = "TETHER_RESYNC_SECS", default_value_t = 300)]
        resync_secs: u64,
    },
    /// Serve the mutating admission endpoint
    Webhook {
        #[arg(long = "listen", env = "TETHER_LISTEN", default_value = "0.0.0.0:8443")]
        listen: SocketAddr,
        /// Answer for requests that cannot be processed: open (admit) or closed (deny)
        #[arg(long = "failure-mode", env = "TETHER_FAILURE_MODE", default_value_t = FailureMode::Open)]
        failure_mode: FailureMode,
        /// Do not look up providers; inject gates and markers only
        #[arg(long = "offline", action = ArgAction::SetTrue)]
        offline: bool,
    },
    /// Print the admission patch a manifest would receive (no cluster access)
    Inspect {
        /// Deployment or Pod manifest (YAML or JSON)
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
            t.cancel();
        }
    });
    token
}

fn load_config(path: Option<&Path>) -> Result<InjectorConfig> {
    match path {
        Some(p) => Ok(InjectorConfig::load(p)?),
        None => Ok(InjectorConfig::default()),
    }
}

#[derive(Debug, Serialize)]
struct InspectReport {
    kind: &'static str,
    name: Option<String>,
    namespace: String,
    states: Vec<String>,
    patch: Vec<tether_core::PatchOperation>,
}

fn inspect(
    manifest: &str,
    namespace: Option<&str>,
    policy: MutationPolicy,
    cfg: &InjectorConfig,
) -> Result<InspectReport> {
    let raw: serde_json::Value = serde_yaml::from_str(manifest).context("parsing manifest")?;
    let kind = raw.get("kind").and_then(|k| k.as_str()).ok_or_else(|| anyhow!("manifest has no kind"))?;
    let kind = kind.to_string();
    let workload = Workload::decode(&kind, raw)
        .with_context(|| format!("decoding {kind}"))?
        .ok_or_else(|| anyhow!("unsupported kind {kind} (expect Deployment or Pod)"))?;
    let namespace = namespace.or(workload.meta().namespace.as_deref()).unwrap_or("default").to_string();
    let states = policy.evaluate(&namespace, workload.meta()).iter().map(|s| format!("{s:?}")).collect();
    let intent = policy.intent(&namespace, workload.meta(), Role::Consumes);
    let requires = policy.requires_consumer_injection(&namespace, workload.meta());

    let injector = AdmissionInjector::new(policy, cfg.interface_table(), cfg.init_containers.clone());
    let patch = match intent {
        Some(intent) if requires => {
            injector.build_consumer_patch(&workload, &intent.interface, &Default::default())?.ops().to_vec()
        }
        _ => Vec::new(),
    };
    Ok(InspectReport { kind: workload.kind(), name: workload.meta().name.clone(), namespace, states, patch })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let vocab = Vocabulary::new(&cli.domain);
    let policy = MutationPolicy::new(vocab.clone(), cfg.reserved_namespaces());

    match cli.command {
        Commands::Controller { workers, max_retries, resync_secs } => {
            let ctx = ClusterContext::connect(cli.namespace.as_deref(), vocab).await?;
            let settings = Settings {
                workers,
                max_retries,
                backoff: Backoff::default(),
                resync: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
                strategy: cli.strategy,
            };
            tether_controller::run(&ctx, cfg.interface_table(), policy, settings, shutdown_token()).await?;
        }
        Commands::Webhook { listen, failure_mode, offline } => {
            let mut injector = AdmissionInjector::new(policy, cfg.interface_table(), cfg.init_containers.clone())
                .with_failure_mode(failure_mode);
            if offline {
                info!("offline: provider lookup disabled");
            } else {
                let ctx = ClusterContext::connect(cli.namespace.as_deref(), vocab.clone()).await?;
                let lister: Arc<dyn ObjectLister<Service>> = Arc::new(ctx.lister());
                injector = injector.with_resolver(RelationResolver::new(lister, vocab, cli.strategy));
            }
            tether_webhook::serve(listen, Arc::new(WebhookState { injector }), shutdown_token()).await?;
        }
        Commands::Inspect { file } => {
            let manifest = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let report = inspect(&manifest, cli.namespace.as_deref(), policy, &cfg)?;
            match cli.output {
                Output::Human => {
                    let name = report.name.as_deref().unwrap_or("<unnamed>");
                    println!("{} {}/{} • {}", report.kind, report.namespace, name, report.states.join(", "));
                    if report.patch.is_empty() {
                        println!("(no patch)");
                    } else {
                        println!("{}", serde_json::to_string_pretty(&report.patch)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSUMER: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  labels:
    tether.io/consumes: sse
spec:
  selector:
    matchLabels: { app: web }
  template:
    metadata:
      labels: { app: web }
    spec:
      containers:
        - name: app
          image: web:1
"#;

    fn cfg() -> InjectorConfig {
        InjectorConfig::from_yaml("initContainers:\n  - name: tether-gate\n    image: tether/gate:1.0\n").unwrap()
    }

    #[test]
    fn inspect_prints_gate_and_marker() {
        let report = inspect(CONSUMER, Some("apps"), MutationPolicy::default(), &cfg()).unwrap();
        assert_eq!(report.kind, "Deployment");
        assert_eq!(report.states, vec!["RequiresConsumerInjection"]);
        let paths: Vec<_> = report.patch.iter().map(|o| o.path()).collect();
        assert_eq!(paths[0], "/spec/template/spec/initContainers");
        assert_eq!(paths[1], "/spec/template/spec/initContainers/0");
        assert!(paths.contains(&"/metadata/annotations/tether.io~1status"));
        assert!(paths.contains(&"/spec/template/metadata/annotations/tether.io~1status"));
    }

    #[test]
    fn inspect_reserved_namespace_yields_no_patch() {
        let report = inspect(CONSUMER, Some("kube-system"), MutationPolicy::default(), &cfg()).unwrap();
        assert_eq!(report.states, vec!["Skip"]);
        assert!(report.patch.is_empty());
    }

    #[test]
    fn inspect_rejects_unsupported_kinds() {
        let manifest = "kind: ConfigMap\nmetadata: { name: c }\n";
        let err = inspect(manifest, None, MutationPolicy::default(), &cfg()).unwrap_err();
        assert!(err.to_string().contains("unsupported kind"), "err={err}");
    }

    #[test]
    fn cli_parses_env_style_flags() {
        let cli = Cli::try_parse_from([
            "tetherctl",
            "--relation-strategy",
            "exact",
            "webhook",
            "--failure-mode",
            "closed",
            "--offline",
        ])
        .unwrap();
        assert_eq!(cli.strategy, RelationStrategy::Exact);
        match cli.command {
            Commands::Webhook { failure_mode, offline, .. } => {
                assert_eq!(failure_mode, FailureMode::Closed);
                assert!(offline);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
