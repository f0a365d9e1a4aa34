#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Identity types shared by every layer that binds or checks a tenant.

pub mod constants;
pub mod context;
pub mod ids;

pub use constants::SYSTEM_ACTOR_ID;
pub use context::{SecurityContext, SecurityContextBuilder};
pub use ids::{ActorId, IdError, TenantId};
