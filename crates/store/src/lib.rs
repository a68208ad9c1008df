//! Storage seams for the access control core: session-scoped row
//! filtering, flag definitions and overrides, kill switches, and
//! organization records. The in-memory implementation backs tests and
//! the admin CLI.

pub mod memory;
pub mod records;
pub mod traits;

pub use memory::{ControlState, MemoryControlStore};
pub use records::{
    FeatureFlagDefinition, FlagConditions, KillSwitch, KillSwitchScope, OrganizationFlagOverride,
};
pub use traits::{FlagStore, KillSwitchStore, OrganizationStore, SessionScope};
