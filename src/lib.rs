#![forbid(unsafe_code)]

pub mod applause;
pub mod apps;
pub mod auth;
pub mod autoupdate;
pub mod cli;
pub mod config;
pub mod configview;
pub mod core;
pub mod datastore;
pub mod error;
pub mod feed;
pub mod permission;
pub mod projector;
pub mod required;
pub mod restrict;
pub mod run;
pub mod server;
pub mod telemetry;
pub mod test_harness;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch.
pub use crate::autoupdate::{AutoupdateLoop, Frame, Sink};
pub use crate::core::{ChangeBatch, ChangeId, Key, Shutdown, UserId};
pub use crate::datastore::{Cache, ChangeNotice, Datastore, KeysChanged, Tick};
pub use crate::feed::{FullData, UpstreamFeed};
pub use crate::restrict::{Restricted, Restricter};
pub use crate::run::{Service, build_service, run_service};
