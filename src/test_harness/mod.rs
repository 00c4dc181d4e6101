//! In-memory fakes for exercising the service without a live upstream.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde_json::json;

use crate::autoupdate::{Frame, Sink, SinkError};
use crate::core::{ChangeId, Key, Shutdown};
use crate::feed::{FeedError, FullData, UpstreamFeed};

/// A scripted upstream feed.
///
/// Tests push raw update payloads into the feed and preload the responses
/// for `full_data`, `changed_keys`, and `data`. Calls are recorded so gap
/// handling can be asserted.
pub struct ScriptedFeed {
    updates_tx: Sender<Bytes>,
    updates_rx: Receiver<Bytes>,
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    full_data: FullData,
    full_data_calls: u64,
    changed_keys: BTreeMap<(ChangeId, ChangeId), Vec<Key>>,
    changed_keys_calls: Vec<(ChangeId, ChangeId)>,
    data: BTreeMap<Key, Bytes>,
    data_calls: Vec<Vec<Key>>,
}

impl Default for ScriptedFeed {
    fn default() -> Self {
        let (updates_tx, updates_rx) = unbounded();
        Self {
            updates_tx,
            updates_rx,
            state: Mutex::new(ScriptState::default()),
        }
    }
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot returned by `full_data`.
    pub fn set_full_data(&self, elements: &[(&str, &str)], max: ChangeId, min: ChangeId) {
        let mut state = self.state.lock().expect("script lock");
        state.full_data = FullData {
            elements: elements
                .iter()
                .map(|(key, value)| {
                    (
                        Key::parse(key).expect("scripted key"),
                        Bytes::copy_from_slice(value.as_bytes()),
                    )
                })
                .collect(),
            max_change_id: max,
            min_change_id: min,
        };
    }

    /// Preload the reply for one `changed_keys(from, to)` call.
    pub fn set_changed_keys(&self, from: ChangeId, to: ChangeId, keys: &[&str]) {
        let mut state = self.state.lock().expect("script lock");
        state.changed_keys.insert(
            (from, to),
            keys.iter()
                .map(|key| Key::parse(key).expect("scripted key"))
                .collect(),
        );
    }

    /// Preload the current value served by `data`.
    pub fn set_data(&self, key: &str, value: &str) {
        let mut state = self.state.lock().expect("script lock");
        state.data.insert(
            Key::parse(key).expect("scripted key"),
            Bytes::copy_from_slice(value.as_bytes()),
        );
    }

    /// Queue one raw update payload.
    pub fn push_raw_update(&self, raw: &[u8]) {
        self.updates_tx
            .send(Bytes::copy_from_slice(raw))
            .expect("scripted feed receiver gone");
    }

    /// Queue a well-formed update batch.
    pub fn push_update(&self, change_id: ChangeId, elements: &[(&str, Option<&str>)]) {
        let mut map = serde_json::Map::new();
        for (key, value) in elements {
            let value = match value {
                Some(raw) => serde_json::from_str(raw).expect("scripted element json"),
                None => serde_json::Value::Null,
            };
            map.insert((*key).to_string(), value);
        }
        let payload = json!({"elements": map, "change_id": change_id});
        self.push_raw_update(&serde_json::to_vec(&payload).expect("encode scripted batch"));
    }

    pub fn full_data_calls(&self) -> u64 {
        self.state.lock().expect("script lock").full_data_calls
    }

    pub fn changed_keys_calls(&self) -> Vec<(ChangeId, ChangeId)> {
        self.state
            .lock()
            .expect("script lock")
            .changed_keys_calls
            .clone()
    }

    pub fn data_calls(&self) -> Vec<Vec<Key>> {
        self.state.lock().expect("script lock").data_calls.clone()
    }
}

impl UpstreamFeed for ScriptedFeed {
    fn full_data(&self) -> Result<FullData, FeedError> {
        let mut state = self.state.lock().expect("script lock");
        state.full_data_calls += 1;
        Ok(state.full_data.clone())
    }

    fn update(&self, shutdown: &Shutdown) -> Result<Bytes, FeedError> {
        loop {
            if shutdown.is_triggered() {
                return Err(FeedError::Cancelled);
            }
            match self.updates_rx.recv_timeout(Duration::from_millis(20)) {
                Ok(raw) => return Ok(raw),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(FeedError::Cancelled),
            }
        }
    }

    fn changed_keys(&self, from: ChangeId, to: ChangeId) -> Result<Vec<Key>, FeedError> {
        let mut state = self.state.lock().expect("script lock");
        state.changed_keys_calls.push((from, to));
        Ok(state
            .changed_keys
            .get(&(from, to))
            .cloned()
            .unwrap_or_default())
    }

    fn data(&self, keys: &[Key]) -> Result<BTreeMap<Key, Bytes>, FeedError> {
        let mut state = self.state.lock().expect("script lock");
        state.data_calls.push(keys.to_vec());
        Ok(keys
            .iter()
            .filter_map(|key| state.data.get(key).map(|bytes| (key.clone(), bytes.clone())))
            .collect())
    }
}

/// Sink collecting emitted frames for assertions. Clones share the buffer,
/// so a test can keep one handle while the loop thread owns the other.
#[derive(Clone, Default)]
pub struct VecSink {
    inner: std::sync::Arc<VecSinkState>,
}

#[derive(Default)]
struct VecSinkState {
    frames: Mutex<Vec<Frame>>,
    closed: Mutex<bool>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.inner.frames.lock().expect("sink lock").clone()
    }

    /// Make every further emit fail, simulating a client disconnect.
    pub fn close(&self) {
        *self.inner.closed.lock().expect("sink lock") = true;
    }

    /// Block until `count` frames arrived or the deadline passes.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<Frame> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let frames = self.frames();
            if frames.len() >= count || std::time::Instant::now() >= deadline {
                return frames;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Sink for VecSink {
    fn emit(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if *self.inner.closed.lock().expect("sink lock") {
            return Err(SinkError::Closed);
        }
        self.inner
            .frames
            .lock()
            .expect("sink lock")
            .push(frame.clone());
        Ok(())
    }
}
