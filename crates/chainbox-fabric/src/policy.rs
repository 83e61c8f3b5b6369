//! Role-based admission check run before handler execution.

use tracing::warn;

use chainbox_types::{FabricError, Identity};

use crate::registry::CapabilitySource;

/// Admission policy over a resolved capability.
///
/// When the source declares an allow-set, the caller must present an
/// identity whose role is in the set. Violations are `FORBIDDEN` and never
/// consume retries.
pub struct Policy;

impl Policy {
    pub fn enforce(
        source: &CapabilitySource,
        identity: Option<&Identity>,
        fn_name: &str,
    ) -> Result<(), FabricError> {
        let Some(allow) = &source.allow else {
            return Ok(());
        };

        let Some(identity) = identity else {
            warn!(fn_name = %fn_name, "Anonymous caller rejected by policy");
            return Err(
                FabricError::forbidden(format!("{fn_name} requires an authenticated caller"))
                    .with_function(fn_name),
            );
        };

        let Some(role) = identity.role.as_deref() else {
            warn!(fn_name = %fn_name, identity = %identity.id, "Caller without role rejected by policy");
            return Err(
                FabricError::forbidden(format!("{fn_name} requires a role")).with_function(fn_name),
            );
        };

        if !allow.contains(role) {
            warn!(
                fn_name = %fn_name,
                identity = %identity.id,
                role = %role,
                "Caller role rejected by policy"
            );
            return Err(
                FabricError::forbidden(format!("role {role} is not admitted to {fn_name}"))
                    .with_function(fn_name),
            );
        }

        Ok(())
    }
}
