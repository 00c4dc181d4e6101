//! Core domain types.
//!
//! - key: element addressing (`collection:id`)
//! - batch: change batches on the change-id axis
//! - shutdown: process-wide cancellation flag

pub mod batch;
pub mod key;
pub mod shutdown;

pub use batch::{BatchError, ChangeBatch};
pub use key::{Key, KeyError};
pub use shutdown::Shutdown;

/// Authenticated user id. `0` is the anonymous user.
pub type UserId = u64;

/// Position on the change-id axis.
pub type ChangeId = u64;
