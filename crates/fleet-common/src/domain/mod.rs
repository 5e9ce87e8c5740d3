//! Fleet Domain Model
//!
//! - **Value Objects**: PopName, OwnerId, HostId
//! - **Aggregates**: Pop (owns its Hosts)
//! - **Records**: AssignedAddress, AssignedPrefix
//! - **Repositories**: ResourceRegistry

pub mod value_objects;
pub mod aggregates;
pub mod repositories;

pub use value_objects::*;
pub use aggregates::*;
pub use repositories::*;
