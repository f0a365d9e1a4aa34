use tenancy_security::TenantId;

/// Errors raised by the isolation store and the context manager.
///
/// Isolation failures always surface; only audit write failures are swallowed,
/// and those never reach this type (see [`crate::audit::AuditWriteFailure`]).
#[derive(thiserror::Error, Debug)]
pub enum TenancyError {
    /// No tenant is bound to the current unit of work.
    #[error("no tenant bound to the current unit of work")]
    MissingTenant,

    /// A write names a tenant other than the bound one.
    #[error("write to '{entity}' targets a tenant other than the bound one")]
    CrossTenantWrite { entity: String },

    /// A tenant-scoped query asked for a tenant other than the bound one.
    #[error("requested tenant {requested} does not match the bound tenant")]
    CrossTenantRead { requested: TenantId },

    /// Attempt to bind a different tenant inside an active binding.
    #[error("unit of work is already bound to another tenant")]
    Rebind,

    /// A pooled session still carried a tenant from a previous occupant.
    #[error("session acquired with a stale tenant binding")]
    StaleSession,

    /// The row does not exist under the bound tenant.
    #[error("{entity} not found")]
    NotFound { entity: String },

    /// The entity is append-only and written by the crate alone.
    #[error("'{entity}' cannot be written directly")]
    AppendOnly { entity: String },

    /// The entity or active model is not usable for an isolated operation.
    #[error("invalid entity: {0}")]
    InvalidEntity(&'static str),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a caller outside the trust boundary is allowed to learn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicOutcome {
    Forbidden,
    NotFound,
    Internal,
}

impl TenancyError {
    /// Map to the externally visible outcome.
    ///
    /// Isolation violations collapse into `Forbidden` and never carry the target row,
    /// so a caller cannot probe whether an id exists under another tenant.
    #[must_use]
    pub fn public_outcome(&self) -> PublicOutcome {
        match self {
            Self::MissingTenant
            | Self::CrossTenantWrite { .. }
            | Self::CrossTenantRead { .. }
            | Self::AppendOnly { .. }
            | Self::Rebind => PublicOutcome::Forbidden,
            Self::NotFound { .. } => PublicOutcome::NotFound,
            Self::StaleSession | Self::InvalidEntity(_) | Self::Db(_) | Self::Serialization(_) => {
                PublicOutcome::Internal
            }
        }
    }

    pub(crate) fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }
}

impl From<tenancy_security::IdError> for TenancyError {
    fn from(_: tenancy_security::IdError) -> Self {
        Self::MissingTenant
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn isolation_errors_are_forbidden() {
        assert_eq!(
            TenancyError::MissingTenant.public_outcome(),
            PublicOutcome::Forbidden
        );
        assert_eq!(
            TenancyError::CrossTenantWrite {
                entity: "clients".to_owned()
            }
            .public_outcome(),
            PublicOutcome::Forbidden
        );
        assert_eq!(TenancyError::Rebind.public_outcome(), PublicOutcome::Forbidden);
        assert_eq!(
            TenancyError::AppendOnly {
                entity: "audit_logs".to_owned()
            }
            .public_outcome(),
            PublicOutcome::Forbidden
        );
    }

    #[test]
    fn not_found_is_uniform() {
        let err = TenancyError::not_found("clients");
        assert_eq!(err.public_outcome(), PublicOutcome::NotFound);
        assert_eq!(err.to_string(), "clients not found");
    }

    #[test]
    fn nil_tenant_maps_to_missing() {
        let err: TenancyError = tenancy_security::TenantId::new(uuid::Uuid::nil())
            .unwrap_err()
            .into();
        assert!(matches!(err, TenancyError::MissingTenant));
    }
}
