use uuid::Uuid;
use uuid::uuid;

/// Actor recorded for schema evolution and tenant provisioning.
pub const SYSTEM_ACTOR_ID: Uuid = uuid!("11111111-6a88-4768-9dfc-6bcd5187d9ed");
