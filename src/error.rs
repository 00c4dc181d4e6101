use thiserror::Error;

use crate::autoupdate::LoopError;
use crate::config::ConfigFileError;
use crate::datastore::DatastoreError;
use crate::feed::FeedError;
use crate::server::ServerError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-component errors; components keep their own
/// types at the seams.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Autoupdate(#[from] LoopError),

    #[error(transparent)]
    Config(#[from] ConfigFileError),
}
