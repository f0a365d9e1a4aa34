//! Isolation predicate store.
//!
//! Everything runtime code can do to an isolated table goes through a
//! [`StoreSession`]: selects are wrapped in [`SecureSelect`] with the tenant predicate
//! already applied, inserts are stamped with the bound tenant, and updates and
//! deletes are restricted by both primary key and tenant.
//!
//! The session-scoped tenant variable is a [`SessionVar`]: readable by anyone,
//! settable only from inside the crate (the context manager).

mod cond;
mod entity;
pub mod policy;
mod select;
mod session_var;
mod store;

pub use cond::{id_condition, tenant_condition};
pub use entity::IsolatedEntity;
pub use policy::IsolationPolicy;
pub use select::SecureSelect;
pub use session_var::{SessionVar, TENANT_SETTING};
pub use store::{IsolationStore, StoreSession};

pub(crate) use entity::entity_name;
pub(crate) use store::{
    delete_isolated, ensure_writable, insert_as, insert_isolated, primary_value, update_isolated,
};
