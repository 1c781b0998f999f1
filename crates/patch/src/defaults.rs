//! Server-side defaults for injected init steps.
//!
//! The API server fills these in on admission anyway. Filling them in before
//! the step is written keeps the stored object equal to what was sent, so a
//! later diff of the same step does not see spurious changes.

use k8s_openapi::api::core::v1::Container;

pub const DEFAULT_TERMINATION_MESSAGE_PATH: &str = "/dev/termination-log";
pub const DEFAULT_TERMINATION_MESSAGE_POLICY: &str = "File";

pub fn apply_container_defaults(c: &mut Container) {
    c.termination_message_path.get_or_insert_with(|| DEFAULT_TERMINATION_MESSAGE_PATH.to_string());
    c.termination_message_policy.get_or_insert_with(|| DEFAULT_TERMINATION_MESSAGE_POLICY.to_string());
    if c.image_pull_policy.is_none() {
        c.image_pull_policy = Some(default_pull_policy(c.image.as_deref()).to_string());
    }
    for port in c.ports.iter_mut().flatten() {
        port.protocol.get_or_insert_with(|| "TCP".to_string());
    }
    for env in c.env.iter_mut().flatten() {
        if let Some(field_ref) = env.value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
            field_ref.api_version.get_or_insert_with(|| "v1".to_string());
        }
    }
}

/// `Always` for untagged or `:latest` images, `IfNotPresent` otherwise.
fn default_pull_policy(image: Option<&str>) -> &'static str {
    let Some(image) = image else { return "IfNotPresent" };
    if image.contains('@') {
        return "IfNotPresent";
    }
    // a colon before the last slash belongs to a registry port
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.rsplit_once(':') {
        Some((_, "latest")) | None => "Always",
        Some(_) => "IfNotPresent",
    }
}
