//! Caller identity resolved from a bearer credential.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of the caller for one top-level invocation.
///
/// Created by the authenticator from a bearer credential and propagated
/// verbatim across mesh hops; it is never mutated after creation. The raw
/// token is preserved so downstream database handles can forward it for
/// row-level authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (`sub` claim).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Raw bearer token as presented by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// All verified claims, including the extracted ones.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, Value>,
}

impl Identity {
    /// Build a bare identity with only an id. Used by tests and service
    /// principals; real callers go through the authenticator.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            role: None,
            token: None,
            claims: BTreeMap::new(),
        }
    }

    /// Attach a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Attach an arbitrary claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    /// Look up a claim by name.
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }

    /// A claim coerced to a string, if present and a string.
    pub fn claim_str(&self, key: &str) -> Option<&str> {
        self.claims.get(key).and_then(Value::as_str)
    }
}
