//! Atomic key-value store interface for skein.
//!
//! Coordination primitives never talk to a concrete database. They require a
//! store that offers:
//!
//! - string values with TTL, set-if-absent and atomic increment
//! - hash maps
//! - ordered collections keyed by a numeric score, with range-by-score and
//!   removal by rank
//! - execution of a short multi-step procedure ([`AtomicScript`]) as a single
//!   atomic unit
//!
//! [`InMemoryStore`] implements all of it deterministically for tests.

mod command;
mod error;
mod inmemory;
mod traits;
mod types;

pub use command::StoreCommand;
pub use command::StoreResponse;
pub use command::apply_command;
pub use error::StoreError;
pub use inmemory::InMemoryStore;
pub use traits::AtomicScript;
pub use traits::AtomicStore;
pub use traits::Transaction;
pub use types::ScoredMember;
