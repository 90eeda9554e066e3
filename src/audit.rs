//! Audit sink interface.
//!
//! The backend is an external collaborator; the host only emits. Logging
//! is best-effort and never converts a successful operation into a
//! failure.

use serde::Serialize;

/// Identity attached to audit events.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
}

impl Principal {
    #[must_use]
    pub fn extension(id: impl Into<String>) -> Self {
        Self {
            kind: "extension",
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub principal: Principal,
    /// What happened, e.g. `network.denied`, `permission.granted`,
    /// `extension.loaded`.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub message: String,
}

pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// Drops everything. The default when the embedding application does not
/// wire a backend.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log(&self, _event: AuditEvent) {}
}
