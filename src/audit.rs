//! Audit logging for credential lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `key.issued` | An API key is created (key management or token endpoint) |
//! | `key.revoked` | An API key is deleted |
//! | `key.used` | A bearer credential resolves to a user |
//! | `code.issued` | The callback mints an authorization code |
//! | `code.redeemed` | An authorization code is exchanged for an API key |
//! | `auth.denied` | A step of the flow was refused |
//!
//! Raw secrets, codes and upstream tokens never appear in events.

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"key.issued"`).
    pub event: &'static str,
    /// User the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// API key id involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// OAuth client involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// How a bearer was resolved (`api_key` or `federated`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<&'static str>,
    /// Human-readable reason for denials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            owner: None,
            key_id: None,
            client_id: None,
            via: None,
            reason: None,
        }
    }

    /// Construct a `key.issued` event.
    #[must_use]
    pub fn key_issued(owner: &str, key_id: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            key_id: Some(key_id.to_string()),
            ..Self::bare("key.issued")
        }
    }

    /// Construct a `key.revoked` event.
    #[must_use]
    pub fn key_revoked(owner: &str, key_id: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            key_id: Some(key_id.to_string()),
            ..Self::bare("key.revoked")
        }
    }

    /// Construct a `key.used` event.
    #[must_use]
    pub fn key_used(owner: &str, via: &'static str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            via: Some(via),
            ..Self::bare("key.used")
        }
    }

    /// Construct a `code.issued` event.
    #[must_use]
    pub fn code_issued(owner: &str, client_id: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            client_id: Some(client_id.to_string()),
            ..Self::bare("code.issued")
        }
    }

    /// Construct a `code.redeemed` event.
    #[must_use]
    pub fn code_redeemed(owner: &str, client_id: &str, key_id: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            client_id: Some(client_id.to_string()),
            key_id: Some(key_id.to_string()),
            ..Self::bare("code.redeemed")
        }
    }

    /// Construct an `auth.denied` event.
    #[must_use]
    pub fn denied(reason: impl Into<String>, client_id: Option<&str>) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            reason: Some(reason.into()),
            ..Self::bare("auth.denied")
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// The event is serialized as a JSON blob in the `audit` field:
///
/// ```text
/// INFO kartpark_auth::audit audit={"event":"key.issued","owner":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "auth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_event_has_owner_and_key() {
        let event = AuditEvent::key_issued("user-1", "a1b2c3d4");

        assert_eq!(event.event, "key.issued");
        assert_eq!(event.owner.as_deref(), Some("user-1"));
        assert_eq!(event.key_id.as_deref(), Some("a1b2c3d4"));
        assert!(event.reason.is_none());
    }

    #[test]
    fn denied_event_contains_reason() {
        let event = AuditEvent::denied("pkce mismatch", Some("client-1"));

        assert_eq!(event.event, "auth.denied");
        assert_eq!(event.reason.as_deref(), Some("pkce mismatch"));
        assert!(event.owner.is_none());
    }

    #[test]
    fn absent_fields_are_skipped_in_json() {
        let json = serde_json::to_string(&AuditEvent::key_used("user-1", "api_key")).unwrap();

        assert!(json.contains("\"via\":\"api_key\""));
        assert!(!json.contains("client_id"));
        assert!(!json.contains("reason"));
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::code_redeemed("user-1", "client-1", "a1b2c3d4"));
    }
}
