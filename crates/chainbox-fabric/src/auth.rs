//! Bearer-token verification producing an [`Identity`].

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use chainbox_types::{FabricError, Identity};

use crate::config::AuthSettings;

/// Verifies signed bearer tokens with a symmetric secret and an allow-list
/// of signature algorithms.
///
/// The raw token is preserved on the resulting identity so database handles
/// can forward it for row-level authorization.
pub struct Authenticator {
    key: Option<DecodingKey>,
    algorithms: Vec<Algorithm>,
    default_role: String,
}

impl Authenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        let algorithms = settings
            .algorithms
            .iter()
            .filter_map(|a| parse_algorithm(a))
            .collect();
        Self {
            key: settings
                .secret
                .as_ref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            algorithms,
            default_role: settings.default_role.clone(),
        }
    }

    /// Verify a bearer token and build the caller identity.
    ///
    /// Fails with `UNAUTHORIZED` on signature mismatch, expiry, disallowed
    /// algorithm, or a malformed token.
    pub fn verify(&self, token: &str) -> Result<Identity, FabricError> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| FabricError::unauthorized("bearer verification is not configured"))?;

        if self.algorithms.is_empty() {
            return Err(FabricError::unauthorized(
                "no signature algorithms are allowed",
            ));
        }

        let mut validation = Validation::new(self.algorithms[0]);
        validation.algorithms = self.algorithms.clone();
        // Expiry is enforced when present; tokens without `exp` are accepted.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;

        let data = decode::<BTreeMap<String, Value>>(token, key, &validation).map_err(|e| {
            debug!(error = %e, "Bearer token rejected");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    FabricError::unauthorized("bearer token expired")
                }
                _ => FabricError::unauthorized("bearer token invalid"),
            }
        })?;

        let claims = data.claims;
        let id = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| FabricError::unauthorized("bearer token missing subject"))?
            .to_string();

        let email = claims
            .get("email")
            .and_then(Value::as_str)
            .map(String::from);
        let role = claims
            .get("role")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| Some(self.default_role.clone()));

        Ok(Identity {
            id,
            email,
            role,
            token: Some(token.to_string()),
            claims,
        })
    }
}

fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "HS256" => Some(Algorithm::HS256),
        "HS384" => Some(Algorithm::HS384),
        "HS512" => Some(Algorithm::HS512),
        _ => None,
    }
}
