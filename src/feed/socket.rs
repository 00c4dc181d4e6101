//! Newline-delimited JSON feed client.
//!
//! Strict request/response over one stream socket: `full_data`,
//! `changed_keys` and `data` are plain RPCs, `update` is a long poll
//! answered whenever the upstream has the next batch. Read timeouts keep the
//! blocking poll responsive to shutdown; on any transport error the
//! connection is dropped and rebuilt on the next call.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use serde_json::value::RawValue;

use super::{FeedError, FullData, UpstreamFeed};
use crate::core::{ChangeId, Key, Shutdown};

/// How long a plain RPC may take before the connection counts as dead.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll granularity of the blocking `update` call.
const UPDATE_POLL: Duration = Duration::from_millis(250);

struct FeedConn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

pub struct SocketFeed {
    addr: String,
    conn: Mutex<Option<FeedConn>>,
}

impl SocketFeed {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    /// Connect eagerly, so startup can fail fast and retry with backoff.
    pub fn connect(&self) -> Result<(), FeedError> {
        let mut conn = self.conn.lock().expect("feed lock");
        if conn.is_none() {
            *conn = Some(self.dial()?);
        }
        Ok(())
    }

    fn dial(&self) -> Result<FeedConn, FeedError> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(FeedConn { stream, reader })
    }

    /// Send one request line and read one response line.
    fn request(
        &self,
        request: &serde_json::Value,
        shutdown: Option<&Shutdown>,
    ) -> Result<String, FeedError> {
        let mut guard = self.conn.lock().expect("feed lock");
        if guard.is_none() {
            *guard = Some(self.dial()?);
        }
        let conn = guard.as_mut().expect("connection just established");

        let result = Self::exchange(conn, request, shutdown);
        if matches!(result, Err(FeedError::Io(_) | FeedError::Protocol(_))) {
            // A broken connection must not be reused.
            *guard = None;
        }
        result
    }

    fn exchange(
        conn: &mut FeedConn,
        request: &serde_json::Value,
        shutdown: Option<&Shutdown>,
    ) -> Result<String, FeedError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|err| FeedError::Protocol(format!("encoding request: {err}")))?;
        line.push(b'\n');
        conn.stream.write_all(&line)?;

        let timeout = if shutdown.is_some() {
            UPDATE_POLL
        } else {
            RPC_TIMEOUT
        };
        conn.stream.set_read_timeout(Some(timeout))?;

        let mut response = String::new();
        loop {
            match conn.reader.read_line(&mut response) {
                Ok(0) => {
                    return Err(FeedError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "feed closed the connection",
                    )));
                }
                Ok(_) => {
                    let trimmed = response.trim();
                    if trimmed.is_empty() {
                        return Err(FeedError::Protocol("empty response line".to_string()));
                    }
                    return Ok(trimmed.to_string());
                }
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    match shutdown {
                        Some(shutdown) if shutdown.is_triggered() => {
                            return Err(FeedError::Cancelled);
                        }
                        Some(_) => continue,
                        None => return Err(FeedError::Io(err)),
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FeedError::Io(err)),
            }
        }
    }
}

impl UpstreamFeed for SocketFeed {
    fn full_data(&self) -> Result<FullData, FeedError> {
        #[derive(Deserialize)]
        struct Wire<'a> {
            #[serde(borrow)]
            data: BTreeMap<&'a str, &'a RawValue>,
            max_change_id: ChangeId,
            min_change_id: ChangeId,
        }

        let line = self.request(&json!({"op": "full_data"}), None)?;
        let wire: Wire<'_> = serde_json::from_str(&line)
            .map_err(|err| FeedError::Protocol(format!("full_data response: {err}")))?;

        let mut elements = BTreeMap::new();
        for (raw_key, value) in wire.data {
            let key = Key::parse(raw_key)
                .map_err(|err| FeedError::Protocol(format!("full_data key: {err}")))?;
            elements.insert(key, Bytes::copy_from_slice(value.get().as_bytes()));
        }

        Ok(FullData {
            elements,
            max_change_id: wire.max_change_id,
            min_change_id: wire.min_change_id,
        })
    }

    fn update(&self, shutdown: &Shutdown) -> Result<Bytes, FeedError> {
        let line = self.request(&json!({"op": "update"}), Some(shutdown))?;
        Ok(Bytes::from(line.into_bytes()))
    }

    fn changed_keys(&self, from: ChangeId, to: ChangeId) -> Result<Vec<Key>, FeedError> {
        #[derive(Deserialize)]
        struct Wire {
            keys: Vec<String>,
        }

        let line = self.request(&json!({"op": "changed_keys", "from": from, "to": to}), None)?;
        let wire: Wire = serde_json::from_str(&line)
            .map_err(|err| FeedError::Protocol(format!("changed_keys response: {err}")))?;
        wire.keys
            .iter()
            .map(|raw| {
                Key::parse(raw)
                    .map_err(|err| FeedError::Protocol(format!("changed_keys key: {err}")))
            })
            .collect()
    }

    fn data(&self, keys: &[Key]) -> Result<BTreeMap<Key, Bytes>, FeedError> {
        #[derive(Deserialize)]
        struct Wire<'a> {
            #[serde(borrow)]
            data: BTreeMap<&'a str, &'a RawValue>,
        }

        let line = self.request(&json!({"op": "data", "keys": keys}), None)?;
        let wire: Wire<'_> = serde_json::from_str(&line)
            .map_err(|err| FeedError::Protocol(format!("data response: {err}")))?;

        let mut elements = BTreeMap::new();
        for (raw_key, value) in wire.data {
            let key = Key::parse(raw_key)
                .map_err(|err| FeedError::Protocol(format!("data key: {err}")))?;
            elements.insert(key, Bytes::copy_from_slice(value.get().as_bytes()));
        }
        Ok(elements)
    }
}
