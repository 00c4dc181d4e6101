//! Per-connection autoupdate pipeline.
//!
//! One loop per client. It turns change-tick notices into restricted,
//! deduplicated delta frames: keys whose restricted bytes the client already
//! holds are dropped, keys that disappear for this viewer become `null`
//! tombstones, and anything that breaks the delta path degrades into a full
//! snapshot instead of an error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::core::{ChangeId, Key, Shutdown, UserId};
use crate::datastore::{BroadcastError, ChangeNotice, Datastore, DatastoreError, Tick};
use crate::restrict::{RestrictError, Restricter};

/// One frame sent to the client.
///
/// `all_data` marks a full snapshot replacing everything the client holds;
/// otherwise `changed` is a delta where `null` removes a key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub change_id: ChangeId,
    pub changed: BTreeMap<Key, Option<Box<RawValue>>>,
    pub all_data: bool,
}

impl Frame {
    /// True if the frame removes `key` from the client's view.
    pub fn tombstones(&self, key: &Key) -> bool {
        matches!(self.changed.get(key), Some(None))
    }
}

/// Where frames go. The server backs this with the client socket; tests use
/// a collecting sink.
pub trait Sink {
    fn emit(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client connection closed")]
    Closed,
    #[error("writing to client: {0}")]
    Io(#[from] std::io::Error),
}

pub struct AutoupdateLoop<S: Sink> {
    datastore: Arc<Datastore>,
    restricter: Arc<Restricter>,
    uid: UserId,
    sink: S,
    /// Restricted bytes last emitted per key.
    last_sent: HashMap<Key, Bytes>,
    last_id: ChangeId,
}

impl<S: Sink> AutoupdateLoop<S> {
    pub fn new(
        datastore: Arc<Datastore>,
        restricter: Arc<Restricter>,
        uid: UserId,
        requested_change_id: ChangeId,
        sink: S,
    ) -> Self {
        Self {
            datastore,
            restricter,
            uid,
            sink,
            last_sent: HashMap::new(),
            last_id: requested_change_id,
        }
    }

    /// Run until shutdown or client disconnect.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<(), LoopError> {
        let subscription = self.datastore.subscribe()?;

        match self.catch_up() {
            Ok(()) => {}
            Err(Reply::Disconnected) => return Ok(()),
            Err(Reply::Fatal(err)) => return Err(err),
        }

        loop {
            match subscription.recv(shutdown) {
                Tick::Shutdown => return Ok(()),
                Tick::Resync => match self.send_full_snapshot() {
                    Ok(()) => {}
                    Err(Reply::Disconnected) => return Ok(()),
                    Err(Reply::Fatal(err)) => return Err(err),
                },
                Tick::Notice(notice) => match self.handle_notice(notice) {
                    Ok(()) => {}
                    Err(Reply::Disconnected) => return Ok(()),
                    Err(Reply::Fatal(err)) => return Err(err),
                },
            }
        }
    }

    /// Bring a (re)connecting client up to the current change id.
    fn catch_up(&mut self) -> Result<(), Reply> {
        let min_id = self.datastore.lowest_id();
        let current_id = self.datastore.current_id();

        if self.last_id == 0 || self.last_id < min_id || self.last_id > current_id {
            return self.send_full_snapshot();
        }
        if self.last_id == current_id {
            // Nothing missed; still seed the dedup state so later permission
            // changes can retract keys the client already holds.
            self.last_sent = self.restricted_full_view()?.1;
            return Ok(());
        }

        // The client missed (last_id, current_id]; send only those keys but
        // seed the dedup state from the whole view.
        let keys = match self.datastore.changed_keys(self.last_id, current_id) {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!("catch-up key fetch failed, sending snapshot: {err}");
                return self.send_full_snapshot();
            }
        };

        let (snapshot_id, full) = self.restricted_full_view()?;
        let mut changed = BTreeMap::new();
        for key in keys {
            match full.get(&key) {
                Some(bytes) => {
                    changed.insert(key, Some(raw_value(bytes)?));
                }
                None => {
                    changed.insert(key, None);
                }
            }
        }
        self.last_sent = full;
        self.last_id = snapshot_id;

        if !changed.is_empty() {
            self.emit(Frame {
                change_id: snapshot_id,
                changed,
                all_data: false,
            })?;
        }
        Ok(())
    }

    fn handle_notice(&mut self, notice: ChangeNotice) -> Result<(), Reply> {
        if notice.change_id() <= self.last_id {
            // Already covered by a snapshot that raced ahead.
            return Ok(());
        }

        let result = match &notice {
            ChangeNotice::Reset { .. } => return self.send_full_snapshot(),
            ChangeNotice::Changed {
                keys,
                change_id,
                perm_change,
            } => {
                if *perm_change {
                    self.full_diff()
                } else {
                    self.delta(keys, *change_id)
                }
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(Reply::Fatal(LoopError::Restrict(err))) => {
                // A broken delta must not kill the connection; start the
                // client over from a snapshot.
                tracing::warn!(uid = self.uid, "restriction failed, resending snapshot: {err}");
                self.send_full_snapshot()
            }
            Err(other) => Err(other),
        }
    }

    /// Restrict exactly the changed keys and emit what differs.
    fn delta(&mut self, keys: &[Key], change_id: ChangeId) -> Result<(), Reply> {
        let entries = self.datastore.entries(keys);
        let restricted = self
            .restricter
            .restrict(self.uid, &entries)
            .map_err(|err| Reply::Fatal(err.into()))?;

        let mut changed = BTreeMap::new();
        for (key, value) in restricted {
            match value {
                Some(bytes) => {
                    if self.last_sent.get(&key) != Some(&bytes) {
                        changed.insert(key.clone(), Some(raw_value(&bytes)?));
                        self.last_sent.insert(key, bytes);
                    }
                }
                None => {
                    if self.last_sent.remove(&key).is_some() {
                        changed.insert(key, None);
                    }
                }
            }
        }

        self.last_id = change_id;
        if !changed.is_empty() {
            self.emit(Frame {
                change_id,
                changed,
                all_data: false,
            })?;
        }
        Ok(())
    }

    /// Re-restrict the whole view and emit every difference, including
    /// tombstones for keys that became invisible without any upstream change.
    fn full_diff(&mut self) -> Result<(), Reply> {
        let (change_id, full) = self.restricted_full_view()?;

        let mut changed = BTreeMap::new();
        for (key, bytes) in &full {
            if self.last_sent.get(key) != Some(bytes) {
                changed.insert(key.clone(), Some(raw_value(bytes)?));
            }
        }
        for key in self.last_sent.keys() {
            if !full.contains_key(key) {
                changed.insert(key.clone(), None);
            }
        }

        self.last_sent = full;
        self.last_id = change_id;
        if !changed.is_empty() {
            self.emit(Frame {
                change_id,
                changed,
                all_data: false,
            })?;
        }
        Ok(())
    }

    fn send_full_snapshot(&mut self) -> Result<(), Reply> {
        let (change_id, full) = self.restricted_full_view()?;

        let mut changed = BTreeMap::new();
        for (key, bytes) in &full {
            changed.insert(key.clone(), Some(raw_value(bytes)?));
        }

        self.last_sent = full;
        self.last_id = change_id;
        self.emit(Frame {
            change_id,
            changed,
            all_data: true,
        })
    }

    /// The viewer's complete restricted view at the current change id.
    fn restricted_full_view(&self) -> Result<(ChangeId, HashMap<Key, Bytes>), Reply> {
        let (change_id, elements) = self.datastore.full_view();
        let restricted = self
            .restricter
            .restrict(self.uid, &elements)
            .map_err(|err| Reply::Fatal(err.into()))?;
        let visible = restricted
            .into_iter()
            .filter_map(|(key, value)| value.map(|bytes| (key, bytes)))
            .collect();
        Ok((change_id, visible))
    }

    fn emit(&mut self, frame: Frame) -> Result<(), Reply> {
        match self.sink.emit(&frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(uid = self.uid, "client sink closed: {err}");
                Err(Reply::Disconnected)
            }
        }
    }
}

/// Internal control flow of the loop body.
enum Reply {
    /// The client went away; exit cleanly.
    Disconnected,
    Fatal(LoopError),
}

impl From<LoopError> for Reply {
    fn from(err: LoopError) -> Self {
        Reply::Fatal(err)
    }
}

fn raw_value(bytes: &Bytes) -> Result<Box<RawValue>, Reply> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| Reply::Fatal(LoopError::BadPayload(err.to_string())))?;
    RawValue::from_string(text.to_string())
        .map_err(|err| Reply::Fatal(LoopError::BadPayload(err.to_string())))
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Subscribe(#[from] BroadcastError),
    #[error(transparent)]
    Restrict(#[from] RestrictError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error("restricted element is not valid JSON: {0}")]
    BadPayload(String),
}
