//! Declared-vs-granted permission checks, consent prompting, and the
//! network allowlist.
//!
//! `ensure` never grants a permission outside the manifest's declared set,
//! and never prompts for a permission that is already persisted as granted.

use crate::error::{Error, Result};
use crate::manifest::Permission;
use crate::permission_store::{GrantRecord, NetworkMode, NetworkPolicy, PermissionStore};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

/// What the host shows the user when consent is required.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub extension_id: String,
    pub display_name: String,
    /// Only the not-yet-granted subset.
    pub permissions: Vec<Permission>,
    /// The `namespace.method` that triggered the prompt.
    pub api_key: String,
    /// Request context (e.g. `{url}` for network calls).
    pub request: Value,
}

/// Host-supplied consent UI. Returning `true` grants the requested subset.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn request(&self, request: PromptRequest) -> bool;
}

/// Identity + declared set of the extension asking for an operation.
#[derive(Debug, Clone, Copy)]
pub struct PermissionSubject<'a> {
    pub extension_id: &'a str,
    pub display_name: &'a str,
    pub declared: &'a BTreeSet<Permission>,
}

pub struct PermissionManager {
    store: PermissionStore,
    prompt: Arc<dyn PermissionPrompt>,
}

impl PermissionManager {
    pub fn new(store: PermissionStore, prompt: Arc<dyn PermissionPrompt>) -> Self {
        Self { store, prompt }
    }

    /// Check (and if necessary prompt for) every permission in `requested`.
    ///
    /// For `network` requests, `url` drives the allowlist: `full` allows
    /// without a prompt, a matching allowlist entry allows without a
    /// prompt, anything else prompts; acceptance adds the URL's hostname
    /// to the allowlist.
    pub async fn ensure(
        &self,
        subject: PermissionSubject<'_>,
        requested: &[Permission],
        api_key: &str,
        url: Option<&Url>,
    ) -> Result<()> {
        for perm in requested {
            if !subject.declared.contains(perm) {
                return Err(Error::permission(format!(
                    "Permission not declared in manifest: {perm} ({})",
                    subject.extension_id
                )));
            }
        }

        let record = self.store.record(subject.extension_id)?;
        let needed: Vec<Permission> = requested
            .iter()
            .copied()
            .filter(|perm| !Self::already_granted(&record, *perm, url))
            .collect();
        if needed.is_empty() {
            return Ok(());
        }

        let request = PromptRequest {
            extension_id: subject.extension_id.to_string(),
            display_name: subject.display_name.to_string(),
            permissions: needed.clone(),
            api_key: api_key.to_string(),
            request: url.map_or_else(
                || json!({ "apiKey": api_key }),
                |url| json!({ "apiKey": api_key, "url": url.as_str() }),
            ),
        };

        if !self.prompt.request(request).await {
            return Err(Error::permission(Self::denied_message(&needed, url)));
        }

        self.store.update(subject.extension_id, |record| {
            for perm in &needed {
                if *perm == Permission::Network {
                    Self::grant_network(record, url);
                } else {
                    record.granted.insert(*perm);
                }
            }
        })?;
        Ok(())
    }

    /// Delete the named grants, or the extension's whole record when
    /// `permissions` is empty.
    pub fn revoke(&self, extension_id: &str, permissions: &[Permission]) -> Result<()> {
        self.store.revoke(extension_id, permissions)
    }

    pub fn reset(&self, extension_id: &str) -> Result<()> {
        self.store.reset(extension_id)
    }

    pub fn reset_all(&self) -> Result<()> {
        self.store.reset_all()
    }

    /// Current grants snapshot (for host UI).
    pub fn record(&self, extension_id: &str) -> Result<GrantRecord> {
        self.store.record(extension_id)
    }

    fn already_granted(record: &GrantRecord, perm: Permission, url: Option<&Url>) -> bool {
        if perm != Permission::Network {
            return record.granted.contains(&perm);
        }
        let Some(policy) = &record.network else {
            return false;
        };
        match policy.mode {
            NetworkMode::Full => true,
            NetworkMode::Deny => false,
            NetworkMode::Allowlist => {
                url.is_some_and(|url| allowlist_matches(policy.hosts.as_deref(), url))
            }
        }
    }

    fn grant_network(record: &mut GrantRecord, url: Option<&Url>) {
        match (&mut record.network, url) {
            // Allowlist stays an allowlist; acceptance adds the hostname.
            (Some(policy), Some(url)) if policy.mode == NetworkMode::Allowlist => {
                if let Some(host) = url.host_str() {
                    policy.insert_host(host);
                }
            }
            // Deny stays deny: consent was one-shot, the next call prompts again.
            (Some(policy), _) if policy.mode == NetworkMode::Deny => {}
            (slot, _) => *slot = Some(NetworkPolicy::full()),
        }
    }

    fn denied_message(needed: &[Permission], url: Option<&Url>) -> String {
        let perms = needed
            .iter()
            .map(|p| {
                if *p == Permission::Network {
                    url.and_then(Url::host_str).map_or_else(
                        || p.as_str().to_string(),
                        |host| format!("network ({host})"),
                    )
                } else {
                    p.as_str().to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("Permission denied: {perms}")
    }
}

/// Match a URL against one allowlist pattern: exact host, `*.host`
/// suffix, or an explicit `scheme://host` origin.
#[must_use]
pub fn host_pattern_matches(pattern: &str, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    if let Some((scheme, pattern_host)) = pattern.split_once("://") {
        return url.scheme() == scheme && host == pattern_host.trim_end_matches('/');
    }
    host == pattern
}

fn allowlist_matches(hosts: Option<&[String]>, url: &Url) -> bool {
    hosts
        .unwrap_or_default()
        .iter()
        .any(|pattern| host_pattern_matches(pattern, url))
}
