use uuid::Uuid;

use crate::{ActorId, IdError, TenantId};

/// `SecurityContext` carries the identity the transport layer resolved for one request.
///
/// The tenant is kept as a raw UUID here; it is validated when the context is bound,
/// so an anonymous context can still be constructed and passed around.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityContext {
    tenant_id: Uuid,
    actor_id: Uuid,
    actor_type: Option<String>,
}

impl SecurityContext {
    #[must_use]
    pub fn builder() -> SecurityContextBuilder {
        SecurityContextBuilder::default()
    }

    /// Context with no tenant and no actor. Binding it always fails.
    #[must_use]
    pub fn anonymous() -> Self {
        SecurityContextBuilder::default().build()
    }

    #[must_use]
    pub fn for_tenant(tenant_id: TenantId, actor_id: ActorId) -> Self {
        Self::builder()
            .tenant_id(tenant_id.as_uuid())
            .actor_id(actor_id.as_uuid())
            .build()
    }

    /// Raw tenant id as resolved upstream; may be nil.
    #[must_use]
    pub fn raw_tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// # Errors
    /// Returns [`IdError::Nil`] when no tenant was resolved.
    pub fn tenant_id(&self) -> Result<TenantId, IdError> {
        TenantId::new(self.tenant_id)
    }

    #[must_use]
    pub fn actor_id(&self) -> ActorId {
        ActorId::new(self.actor_id)
    }

    #[must_use]
    pub fn actor_type(&self) -> Option<&str> {
        self.actor_type.as_deref()
    }
}

#[derive(Default)]
pub struct SecurityContextBuilder {
    tenant_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    actor_type: Option<String>,
}

impl SecurityContextBuilder {
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    #[must_use]
    pub fn actor_id(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    #[must_use]
    pub fn actor_type(mut self, actor_type: &str) -> Self {
        self.actor_type = Some(actor_type.to_owned());
        self
    }

    #[must_use]
    pub fn build(self) -> SecurityContext {
        SecurityContext {
            tenant_id: self.tenant_id.unwrap_or_default(),
            actor_id: self.actor_id.unwrap_or_default(),
            actor_type: self.actor_type,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn builder_full() {
        let tenant_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let actor_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440001").unwrap();

        let ctx = SecurityContext::builder()
            .tenant_id(tenant_id)
            .actor_id(actor_id)
            .actor_type("user")
            .build();

        assert_eq!(ctx.tenant_id().unwrap().as_uuid(), tenant_id);
        assert_eq!(ctx.actor_id().as_uuid(), actor_id);
        assert_eq!(ctx.actor_type(), Some("user"));
    }

    #[test]
    fn anonymous_has_no_tenant() {
        let ctx = SecurityContext::anonymous();

        assert_eq!(ctx.raw_tenant_id(), Uuid::default());
        assert_eq!(ctx.tenant_id(), Err(IdError::Nil("tenant id")));
        assert_eq!(ctx.actor_id(), ActorId::default());
    }
}
