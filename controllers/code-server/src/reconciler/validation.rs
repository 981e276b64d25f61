//! Spec validation.
//!
//! Failures here are terminal for the generation: the resource is marked
//! `Failed` and left alone until its spec changes.

use super::lxd::instance_name;
use crate::config::Options;
use crate::error::ControllerError;
use crate::request::ResourceKey;
use crds::{CodeServer, Runtime};
use kube::ResourceExt;

/// Longest Kubernetes DNS-1035 label, also the LXD instance name limit.
const MAX_LABEL_LEN: usize = 63;
const MAX_HOST_LEN: usize = 253;

pub fn validate(cs: &CodeServer, options: &Options, lxd_configured: bool) -> Result<(), ControllerError> {
    let invalid = |msg: String| Err(ControllerError::Validation(msg));
    let name = cs.name_any();

    if !is_dns_label(&name) {
        return invalid(format!(
            "name {:?} must be a lowercase DNS label of at most {} characters starting with a letter",
            name, MAX_LABEL_LEN
        ));
    }

    if !is_image_reference(&cs.spec.image) {
        return invalid(format!("image {:?} is not a valid image reference", cs.spec.image));
    }
    if let Some(exporter) = cs.spec.exporter_image.as_ref().filter(|i| !is_image_reference(i)) {
        return invalid(format!("exporterImage {:?} is not a valid image reference", exporter));
    }

    if let Some(cpu) = cs.spec.resources.cpu.as_ref().filter(|q| !is_quantity(q)) {
        return invalid(format!("resources.cpu {:?} is not a valid quantity", cpu));
    }
    if let Some(memory) = cs.spec.resources.memory.as_ref().filter(|q| !is_quantity(q)) {
        return invalid(format!("resources.memory {:?} is not a valid quantity", memory));
    }

    if let Some(bad) = cs.spec.env.keys().find(|k| !is_env_name(k)) {
        return invalid(format!("env name {:?} is not a valid variable name", bad));
    }

    let host_len = name.len() + 1 + options.domain_name.len();
    if cs.spec.public_ingress && options.enable_user_ingress && host_len > MAX_HOST_LEN {
        return invalid(format!(
            "ingress host {}.{} exceeds {} characters",
            name, options.domain_name, MAX_HOST_LEN
        ));
    }

    if cs.spec.runtime == Runtime::Lxd {
        if !lxd_configured {
            return invalid("runtime Lxd requested but the operator has no LXD backend configured".to_string());
        }
        let Some(lxd) = &cs.spec.lxd else {
            return invalid("runtime Lxd requires an lxd block".to_string());
        };
        if lxd.image_alias.trim().is_empty() {
            return invalid("lxd.imageAlias must not be empty".to_string());
        }
        let key = ResourceKey::new(cs.namespace().unwrap_or_default(), name.clone());
        if instance_name(&key).len() > MAX_LABEL_LEN {
            return invalid(format!(
                "LXD instance name {} exceeds {} characters",
                instance_name(&key),
                MAX_LABEL_LEN
            ));
        }
    }

    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_LABEL_LEN
        && bytes[0].is_ascii_lowercase()
        && bytes[bytes.len() - 1] != b'-'
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn is_image_reference(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Kubernetes quantity: decimal number with an optional SI or binary suffix.
fn is_quantity(s: &str) -> bool {
    const SUFFIXES: [&str; 14] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E", "",
    ];
    let number = SUFFIXES
        .iter()
        .filter_map(|suffix| s.strip_suffix(suffix))
        .find(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit() || c == '.'));
    match number {
        Some(n) => n.matches('.').count() <= 1 && n != "." && n.parse::<f64>().is_ok_and(|v| v > 0.0),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_code_server, test_options};
    use crds::LxdInstanceSpec;

    fn check(cs: &CodeServer) -> Result<(), ControllerError> {
        validate(cs, &test_options(), false)
    }

    #[test]
    fn test_minimal_spec_is_valid() {
        assert!(check(&create_test_code_server("dev", "alice")).is_ok());
    }

    #[test]
    fn test_rejects_bad_names_and_images() {
        assert!(check(&create_test_code_server("dev", "Alice")).is_err());
        assert!(check(&create_test_code_server("dev", "1alice")).is_err());
        assert!(check(&create_test_code_server("dev", "alice-")).is_err());

        let mut cs = create_test_code_server("dev", "alice");
        cs.spec.image = String::new();
        assert!(matches!(check(&cs), Err(ControllerError::Validation(_))));

        cs.spec.image = "code server".to_string();
        assert!(check(&cs).is_err());
    }

    #[test]
    fn test_quantities() {
        for good in ["1", "500m", "0.5", "4Gi", "512Mi", "2G"] {
            assert!(is_quantity(good), "{} should be accepted", good);
        }
        for bad in ["", "m", "four", "4GB", "-1", "1..5", "0"] {
            assert!(!is_quantity(bad), "{} should be rejected", bad);
        }

        let mut cs = create_test_code_server("dev", "alice");
        cs.spec.resources.memory = Some("lots".to_string());
        assert!(check(&cs).is_err());
    }

    #[test]
    fn test_env_names() {
        let mut cs = create_test_code_server("dev", "alice");
        cs.spec.env.insert("GIT_AUTHOR".to_string(), "alice".to_string());
        assert!(check(&cs).is_ok());
        cs.spec.env.insert("1BAD".to_string(), "x".to_string());
        assert!(check(&cs).is_err());
    }

    #[test]
    fn test_lxd_runtime_requires_backend_and_block() {
        let mut cs = create_test_code_server("dev", "alice");
        cs.spec.runtime = Runtime::Lxd;
        assert!(validate(&cs, &test_options(), false).is_err(), "no backend configured");
        assert!(validate(&cs, &test_options(), true).is_err(), "missing lxd block");

        cs.spec.lxd = Some(LxdInstanceSpec {
            image_alias: "ubuntu/22.04".to_string(),
            profiles: vec![],
        });
        assert!(validate(&cs, &test_options(), true).is_ok());
    }

    #[test]
    fn test_public_ingress_with_disabled_toggle_is_not_an_error() {
        let mut cs = create_test_code_server("dev", "alice");
        cs.spec.public_ingress = true;
        assert!(check(&cs).is_ok());
    }
}
