use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use k8s_openapi::api::core::v1::{Container, Service};
use serde_json::{json, Value as Json};
use tether_core::{
    InterfaceTable, LookupError, MutationPolicy, ObjectLister, RelationResolver, RelationStrategy, Vocabulary,
};
use tether_webhook::{router, AdmissionInjector, FailureMode, WebhookState};
use tower::ServiceExt;

struct Services(Vec<Service>);

#[async_trait]
impl ObjectLister<Service> for Services {
    async fn list(&self, _namespace: &str, _label_selector: Option<&str>) -> Result<Vec<Service>, LookupError> {
        Ok(self.0.clone())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>, LookupError> {
        Ok(self
            .0
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(name) && s.metadata.namespace.as_deref() == Some(namespace))
            .cloned())
    }
}

struct Broken;

#[async_trait]
impl ObjectLister<Service> for Broken {
    async fn list(&self, namespace: &str, _label_selector: Option<&str>) -> Result<Vec<Service>, LookupError> {
        Err(LookupError::List { kind: "Service", namespace: namespace.into(), message: "down".into() })
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>, LookupError> {
        Err(LookupError::Get {
            kind: "Service",
            namespace: namespace.into(),
            name: name.into(),
            message: "down".into(),
        })
    }
}

fn gate() -> Container {
    Container { name: "tether-gate".into(), image: Some("tether/gate:1.0".into()), ..Default::default() }
}

fn injector(mode: FailureMode) -> AdmissionInjector {
    AdmissionInjector::new(MutationPolicy::default(), InterfaceTable::default(), vec![gate()]).with_failure_mode(mode)
}

fn with_services(services: Vec<Service>) -> AdmissionInjector {
    let lister: Arc<dyn ObjectLister<Service>> = Arc::new(Services(services));
    let resolver = RelationResolver::new(lister, Vocabulary::default(), RelationStrategy::Scan);
    injector(FailureMode::Open).with_resolver(resolver)
}

fn review(kind: &str, object: Json) -> Json {
    let resource = if kind == "Pod" { "pods" } else { "deployments" };
    let group = if kind == "Pod" { "" } else { "apps" };
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "7f0b2d2c-1f7e-4d5e-9c39-0c4d1b0c2a11",
            "kind": { "group": group, "version": "v1", "kind": kind },
            "resource": { "group": group, "version": "v1", "resource": resource },
            "namespace": "apps",
            "operation": "CREATE",
            "userInfo": { "username": "system:admin" },
            "object": object,
            "oldObject": null,
            "dryRun": false
        }
    })
}

fn consumer_pod(annotations: Json) -> Json {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "web",
            "namespace": "apps",
            "labels": { "tether.io/consumes": "sse" },
            "annotations": annotations
        },
        "spec": { "containers": [ { "name": "app", "image": "web:1" } ] }
    })
}

async fn post(state: AdmissionInjector, content_type: &str, body: Vec<u8>) -> (StatusCode, Json) {
    let app = router(Arc::new(WebhookState { injector: state }));
    let req = Request::post("/mutate").header("content-type", content_type).body(Body::from(body)).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, json)
}

/// kube serializes `patch` as raw bytes; the API server's wire form is base64.
fn decoded_patch(review: &Json) -> Json {
    let raw: Vec<u8> = match &review["response"]["patch"] {
        Json::Array(_) => serde_json::from_value(review["response"]["patch"].clone()).unwrap(),
        Json::String(b64) => base64::engine::general_purpose::STANDARD.decode(b64).unwrap(),
        other => panic!("response carries no patch: {other}"),
    };
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn new_consumer_gets_gate_and_marker() {
    let body = serde_json::to_vec(&review("Pod", consumer_pod(json!({})))).unwrap();
    let (status, out) = post(injector(FailureMode::Open), "application/json", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["response"]["allowed"], true);
    assert_eq!(out["response"]["patchType"], "JSONPatch");
    assert_eq!(out["response"]["uid"], "7f0b2d2c-1f7e-4d5e-9c39-0c4d1b0c2a11");

    let patch = decoded_patch(&out);
    let ops = patch.as_array().unwrap();
    let paths: Vec<_> = ops.iter().map(|o| o["path"].as_str().unwrap()).collect();
    assert_eq!(
        paths,
        vec![
            "/spec/initContainers",
            "/spec/initContainers/0",
            "/metadata/annotations",
            "/metadata/annotations/tether.io~1status",
        ]
    );
    assert_eq!(ops[0]["value"], json!([]));
    assert_eq!(ops[1]["value"]["env"], json!([{ "name": "TETHER_REQUIRED_VARS", "value": "BASE_URL" }]));
    assert_eq!(ops[2]["value"], json!({}));
    assert_eq!(ops[3]["value"], "injected");
}

#[tokio::test]
async fn applying_the_patch_makes_the_next_review_a_no_op() {
    let body = serde_json::to_vec(&review("Pod", consumer_pod(json!({})))).unwrap();
    let (_, out) = post(injector(FailureMode::Open), "application/json", body).await;
    let patch: json_patch::Patch = serde_json::from_value(decoded_patch(&out)).unwrap();
    let mut pod = consumer_pod(json!({}));
    json_patch::patch(&mut pod, &patch).unwrap();

    let body = serde_json::to_vec(&review("Pod", pod)).unwrap();
    let (_, out) = post(injector(FailureMode::Open), "application/json", body).await;
    assert_eq!(out["response"]["allowed"], true);
    assert!(out["response"].get("patch").map_or(true, Json::is_null));
}

#[tokio::test]
async fn already_injected_consumer_is_allowed_unchanged() {
    let body = serde_json::to_vec(&review("Pod", consumer_pod(json!({ "tether.io/status": "Injected" })))).unwrap();
    let (_, out) = post(injector(FailureMode::Open), "application/json", body).await;
    assert_eq!(out["response"]["allowed"], true);
    assert!(out["response"].get("patch").map_or(true, Json::is_null));
}

#[tokio::test]
async fn existing_provider_values_are_injected_into_deployments() {
    let svc: Service = serde_json::from_value(json!({
        "metadata": { "name": "events", "namespace": "apps", "labels": { "tether.io/provides": "sse" } },
        "spec": { "type": "ExternalName", "externalName": "events.example.com" }
    }))
    .unwrap();
    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "web",
            "namespace": "apps",
            "labels": { "tether.io/consumes": "sse" },
            "annotations": { "tether.io/relations": "events" }
        },
        "spec": {
            "selector": { "matchLabels": { "app": "web" } },
            "template": {
                "metadata": { "labels": { "app": "web" } },
                "spec": { "containers": [ { "name": "app", "image": "web:1" } ] }
            }
        }
    });
    let body = serde_json::to_vec(&review("Deployment", deployment.clone())).unwrap();
    let (_, out) = post(with_services(vec![svc]), "application/json", body).await;
    let patch: json_patch::Patch = serde_json::from_value(decoded_patch(&out)).unwrap();
    let mut patched = deployment;
    json_patch::patch(&mut patched, &patch).unwrap();

    let pod = &patched["spec"]["template"]["spec"];
    assert_eq!(pod["containers"][0]["env"], json!([{ "name": "BASE_URL", "value": "events.example.com" }]));
    assert_eq!(pod["initContainers"][0]["name"], "tether-gate");
    let gate_env = pod["initContainers"][0]["env"].as_array().unwrap();
    assert!(gate_env.iter().any(|e| e["name"] == "BASE_URL"));
    assert_eq!(patched["spec"]["template"]["metadata"]["annotations"]["tether.io/status"], "injected");
}

#[tokio::test]
async fn lookup_failure_still_injects_the_gate() {
    let lister: Arc<dyn ObjectLister<Service>> = Arc::new(Broken);
    let resolver = RelationResolver::new(lister, Vocabulary::default(), RelationStrategy::Scan);
    let inj = injector(FailureMode::Closed).with_resolver(resolver);
    let body = serde_json::to_vec(&review("Pod", consumer_pod(json!({ "tether.io/relations": "events" })))).unwrap();
    let (_, out) = post(inj, "application/json", body).await;
    assert_eq!(out["response"]["allowed"], true);
    assert_eq!(decoded_patch(&out).as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn reserved_namespace_and_other_kinds_pass_through() {
    let mut pod = consumer_pod(json!({}));
    pod["metadata"]["namespace"] = json!("kube-system");
    let mut r = review("Pod", pod);
    r["request"]["namespace"] = json!("kube-system");
    let (_, out) = post(injector(FailureMode::Open), "application/json", serde_json::to_vec(&r).unwrap()).await;
    assert!(out["response"].get("patch").map_or(true, Json::is_null));

    let cm = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "c", "labels": { "tether.io/consumes": "sse" } }
    });
    let body = serde_json::to_vec(&review("ConfigMap", cm)).unwrap();
    let (_, out) = post(injector(FailureMode::Open), "application/json", body).await;
    assert_eq!(out["response"]["allowed"], true);
    assert!(out["response"].get("patch").map_or(true, Json::is_null));
}

#[tokio::test]
async fn undecodable_object_follows_failure_mode() {
    let mut pod = consumer_pod(json!({}));
    pod["spec"]["containers"] = json!("not-a-list");
    let body = serde_json::to_vec(&review("Pod", pod)).unwrap();

    let (_, open) = post(injector(FailureMode::Open), "application/json", body.clone()).await;
    assert_eq!(open["response"]["allowed"], true);
    assert!(open["response"]["status"]["message"].as_str().unwrap_or("").contains("decoding Pod"));

    let (_, closed) = post(injector(FailureMode::Closed), "application/json", body).await;
    assert_eq!(closed["response"]["allowed"], false);
}

#[tokio::test]
async fn envelope_without_request_follows_failure_mode() {
    let body = serde_json::to_vec(&json!({ "apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview" })).unwrap();
    let (status, out) = post(injector(FailureMode::Open), "application/json", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["response"]["allowed"], true);
    let (_, out) = post(injector(FailureMode::Closed), "application/json", body).await;
    assert_eq!(out["response"]["allowed"], false);
}

#[tokio::test]
async fn rejects_wrong_content_type_and_empty_body() {
    let (status, _) = post(injector(FailureMode::Open), "text/plain", b"{}".to_vec()).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let (status, out) = post(injector(FailureMode::Open), "application/json", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(out["error"], "empty request body");
}

#[tokio::test]
async fn healthz_answers() {
    let app = router(Arc::new(WebhookState { injector: injector(FailureMode::Open) }));
    let resp = app.oneshot(Request::get("/healthz").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
