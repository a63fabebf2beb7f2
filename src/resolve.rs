//! Dialable targets and caller identities derived from a call context.

use crate::config::SipConfig;
use crate::context::CallContext;

/// Destination fields for a SIP participant request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFields {
    pub sip_call_to: String,
}

/// Strip a `sip:`/`tel:` scheme from a destination. `None` for blank input.
pub fn destination_fields(destination: &str) -> Option<DestinationFields> {
    let dest = destination.trim();
    if dest.is_empty() {
        return None;
    }

    let sip_call_to = strip_scheme(dest).unwrap_or(dest).to_string();
    Some(DestinationFields { sip_call_to })
}

/// Canonical `sip:`/`tel:` URI for a value that may be missing its scheme.
pub fn format_tel_uri(value: &str) -> String {
    let cleaned = value.trim();
    if cleaned.is_empty() || strip_scheme(cleaned).is_some() {
        return cleaned.to_string();
    }

    if cleaned.contains('@') {
        format!("sip:{cleaned}")
    } else if cleaned.starts_with('+') {
        format!("tel:{cleaned}")
    } else {
        format!("tel:+{cleaned}")
    }
}

/// URI to hand the caller off to, or `None` when the target is blank.
pub fn transfer_target_uri(target: &str) -> Option<String> {
    let fields = destination_fields(target)?;
    if fields.sip_call_to.is_empty() {
        return None;
    }
    Some(format_tel_uri(&fields.sip_call_to))
}

/// Number presented as the calling line, if any is known.
pub fn resolve_caller_number(ctx: &CallContext, sip: &SipConfig) -> Option<String> {
    ctx.text("caller_number")
        .or_else(|| ctx.text("caller_cli"))
        .or_else(|| ctx.text("caller_id"))
        .or_else(|| non_empty(&sip.from_number))
        .or_else(|| non_empty(&sip.from_identity))
        .or_else(|| non_empty(&sip.default_caller_id))
}

/// Participant identity for the outbound leg, falling back to `fallback`.
pub fn resolve_caller_identity(ctx: &CallContext, sip: &SipConfig, fallback: &str) -> String {
    ctx.text("participant_identity")
        .or_else(|| ctx.text("caller_identity"))
        .or_else(|| ctx.text("caller_id"))
        .or_else(|| non_empty(&sip.from_identity))
        .or_else(|| non_empty(&sip.default_caller_id))
        .unwrap_or_else(|| fallback.to_string())
}

fn strip_scheme(value: &str) -> Option<&str> {
    let scheme = value.get(..4)?;
    if scheme.eq_ignore_ascii_case("sip:") || scheme.eq_ignore_ascii_case("tel:") {
        Some(&value[4..])
    } else {
        None
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> CallContext {
        CallContext::new(value.as_object().cloned().unwrap())
    }

    #[test]
    fn destination_strips_scheme() {
        assert_eq!(
            destination_fields("sip:alice@example.com").unwrap().sip_call_to,
            "alice@example.com"
        );
        assert_eq!(
            destination_fields("TEL:+61400111222").unwrap().sip_call_to,
            "+61400111222"
        );
        assert_eq!(
            destination_fields("  +61123456789 ").unwrap().sip_call_to,
            "+61123456789"
        );
    }

    #[test]
    fn destination_rejects_blank() {
        assert!(destination_fields("").is_none());
        assert!(destination_fields("   ").is_none());
    }

    #[test]
    fn bare_destination_is_preserved() {
        for dest in ["61402012298", "+61402012298", "alice@example.com", "1234#5"] {
            assert_eq!(destination_fields(dest).unwrap().sip_call_to, dest);
        }
    }

    #[test]
    fn transfer_target_formats_tel() {
        assert_eq!(
            transfer_target_uri("61402012298").as_deref(),
            Some("tel:+61402012298")
        );
        assert_eq!(
            transfer_target_uri("+61402012298").as_deref(),
            Some("tel:+61402012298")
        );
        assert_eq!(
            transfer_target_uri("sip:alice@example.com").as_deref(),
            Some("sip:alice@example.com")
        );
        assert_eq!(transfer_target_uri("tel:+123").as_deref(), Some("tel:+123"));
        assert_eq!(
            transfer_target_uri("bob@pbx.local").as_deref(),
            Some("sip:bob@pbx.local")
        );
    }

    #[test]
    fn transfer_target_rejects_empty() {
        assert!(transfer_target_uri("").is_none());
        assert!(transfer_target_uri("  ").is_none());
        assert!(transfer_target_uri("sip:").is_none());
    }

    #[test]
    fn resolved_destinations_always_yield_uri() {
        for dest in ["61402012298", "+61402012298", "sip:ops@example.com", "tel:555"] {
            let fields = destination_fields(dest).unwrap();
            let uri = transfer_target_uri(&fields.sip_call_to).unwrap();
            assert!(
                uri.starts_with("tel:") || uri.starts_with("sip:"),
                "unexpected uri {uri} for {dest}"
            );
        }
    }

    #[test]
    fn caller_number_priority() {
        let sip = SipConfig {
            from_number: Some("+61999".into()),
            ..SipConfig::default()
        };
        assert_eq!(
            resolve_caller_number(&ctx(json!({"caller_number": "+611", "caller_id": "+612"})), &sip)
                .as_deref(),
            Some("+611")
        );
        assert_eq!(
            resolve_caller_number(&ctx(json!({"caller_cli": "+613"})), &sip).as_deref(),
            Some("+613")
        );
        assert_eq!(
            resolve_caller_number(&ctx(json!({})), &sip).as_deref(),
            Some("+61999")
        );
        assert!(resolve_caller_number(&ctx(json!({})), &SipConfig::default()).is_none());
    }

    #[test]
    fn caller_identity_falls_back() {
        let sip = SipConfig::default();
        assert_eq!(
            resolve_caller_identity(&ctx(json!({})), &sip, "+61123456789"),
            "+61123456789"
        );
        assert_eq!(
            resolve_caller_identity(&ctx(json!({"caller_id": "agent-7"})), &sip, "+61"),
            "agent-7"
        );

        let sip = SipConfig {
            default_caller_id: Some("default-id".into()),
            ..SipConfig::default()
        };
        assert_eq!(
            resolve_caller_identity(&ctx(json!({"caller_identity": ""})), &sip, "+61"),
            "default-id"
        );
    }
}
