//! Per-step tensor handoff between partitions, and between a step and its caller.
//!
//! A transfer is named by a key built from the sending device, its
//! incarnation, the receiving device and the tensor name. Either side may
//! arrive first: an early send is queued until the matching receive, an early
//! receive parks its callback until the send. Aborting the rendezvous fails
//! every parked receive and every later operation with the abort status.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::time::Duration;

use dataflow_ir::Tensor;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, SessionError};

/// Builds a transfer key. Frame and iteration are always `0:0` locally.
pub fn create_key(
    src_device: &str,
    src_incarnation: u64,
    dst_device: &str,
    name: &str,
) -> String {
    format!(
        "{};{:016x};{};{};0:0",
        src_device, src_incarnation, dst_device, name
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub src_device: String,
    pub src_incarnation: u64,
    pub dst_device: String,
    pub edge_name: String,
    pub frame_id: u64,
    pub iter_id: u64,
    full_key: String,
}

impl ParsedKey {
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = || SessionError::invalid_argument(format!("Invalid rendezvous key: {}", key));
        let parts: Vec<&str> = key.split(';').collect();
        if parts.len() != 5 || parts[0].is_empty() || parts[2].is_empty() || parts[3].is_empty() {
            return Err(invalid());
        }
        let src_incarnation = u64::from_str_radix(parts[1], 16).map_err(|_| invalid())?;
        let (frame, iter) = parts[4].split_once(':').ok_or_else(invalid)?;
        Ok(ParsedKey {
            src_device: parts[0].to_string(),
            src_incarnation,
            dst_device: parts[2].to_string(),
            edge_name: parts[3].to_string(),
            frame_id: frame.parse().map_err(|_| invalid())?,
            iter_id: iter.parse().map_err(|_| invalid())?,
            full_key: key.to_string(),
        })
    }

    pub fn full_key(&self) -> &str {
        &self.full_key
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RendezvousValue {
    pub tensor: Tensor,
    /// Produced on an untaken branch of conditional control flow.
    pub is_dead: bool,
}

pub type RecvCallback = Box<dyn FnOnce(Result<RendezvousValue>) + Send>;

pub trait Rendezvous: Send + Sync {
    fn send(&self, key: &ParsedKey, value: RendezvousValue) -> Result<()>;

    /// Calls `done` once the value for `key` is available or the rendezvous is aborted.
    fn recv_async(&self, key: &ParsedKey, done: RecvCallback);

    /// Fails all pending and future operations with `status`. Only the first abort counts.
    fn start_abort(&self, status: SessionError);

    /// Blocking receive. `None` waits without bound.
    fn recv(&self, key: &ParsedKey, timeout: Option<Duration>) -> Result<RendezvousValue> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.recv_async(
            key,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let cancelled = || SessionError::cancelled("Rendezvous receive was abandoned");
        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(SessionError::deadline_exceeded(
                    "Timed out waiting for notification",
                )),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(cancelled()),
            },
            None => rx.recv().map_err(|_| cancelled())?,
        }
    }
}

enum Queue {
    Values(VecDeque<RendezvousValue>),
    Waiters(VecDeque<RecvCallback>),
}

#[derive(Default)]
struct Table {
    queues: HashMap<String, Queue>,
    aborted: Option<SessionError>,
}

/// In-process rendezvous for one step. Callbacks are never run with the table locked.
#[derive(Default)]
pub struct LocalRendezvous {
    table: Mutex<Table>,
}

impl LocalRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Result<()> {
        match &self.table.lock().aborted {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }
}

impl Rendezvous for LocalRendezvous {
    fn send(&self, key: &ParsedKey, value: RendezvousValue) -> Result<()> {
        let waiter = {
            let mut table = self.table.lock();
            if let Some(status) = &table.aborted {
                return Err(status.clone());
            }
            let waiter = match table.queues.get_mut(key.full_key()) {
                Some(Queue::Waiters(waiters)) => waiters.pop_front(),
                _ => None,
            };
            if waiter.is_none() {
                match table.queues.get_mut(key.full_key()) {
                    Some(Queue::Values(values)) => values.push_back(value.clone()),
                    _ => {
                        table.queues.insert(
                            key.full_key().to_string(),
                            Queue::Values(VecDeque::from([value.clone()])),
                        );
                    }
                }
            } else if matches!(table.queues.get(key.full_key()), Some(Queue::Waiters(w)) if w.is_empty())
            {
                table.queues.remove(key.full_key());
            }
            waiter
        };
        trace!(key = key.full_key(), delivered = waiter.is_some(), "rendezvous send");
        if let Some(waiter) = waiter {
            waiter(Ok(value));
        }
        Ok(())
    }

    fn recv_async(&self, key: &ParsedKey, done: RecvCallback) {
        let ready = {
            let mut table = self.table.lock();
            if let Some(status) = &table.aborted {
                Some(Err(status.clone()))
            } else {
                let value = match table.queues.get_mut(key.full_key()) {
                    Some(Queue::Values(values)) => values.pop_front(),
                    _ => None,
                };
                match value {
                    Some(value) => {
                        if matches!(table.queues.get(key.full_key()), Some(Queue::Values(v)) if v.is_empty())
                        {
                            table.queues.remove(key.full_key());
                        }
                        Some(Ok(value))
                    }
                    None => {
                        match table.queues.get_mut(key.full_key()) {
                            Some(Queue::Waiters(waiters)) => waiters.push_back(done),
                            _ => {
                                table.queues.insert(
                                    key.full_key().to_string(),
                                    Queue::Waiters(VecDeque::from([done])),
                                );
                            }
                        }
                        return;
                    }
                }
            }
        };
        if let Some(result) = ready {
            done(result);
        }
    }

    fn start_abort(&self, status: SessionError) {
        let waiters: Vec<RecvCallback> = {
            let mut table = self.table.lock();
            if table.aborted.is_some() {
                return;
            }
            table.aborted = Some(status.clone());
            table
                .queues
                .drain()
                .filter_map(|(_, q)| match q {
                    Queue::Waiters(w) => Some(w),
                    Queue::Values(_) => None,
                })
                .flatten()
                .collect()
        };
        trace!(waiters = waiters.len(), error = %status, "rendezvous aborted");
        for waiter in waiters {
            waiter(Err(status.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(name: &str) -> ParsedKey {
        ParsedKey::parse(&create_key("/device:CPU:0", 7, "/device:CPU:1", name)).unwrap()
    }

    fn value(v: f64) -> RendezvousValue {
        RendezvousValue {
            tensor: Tensor::scalar_f64(v),
            is_dead: false,
        }
    }

    #[test]
    fn test_key_roundtrip() {
        let raw = create_key("/job:localhost/replica:0/task:0/device:CPU:0", 255, "/job:localhost/replica:0/task:0/device:CPU:0", "a:0");
        assert!(raw.contains(";00000000000000ff;"));
        let parsed = ParsedKey::parse(&raw).unwrap();
        assert_eq!(parsed.src_incarnation, 255);
        assert_eq!(parsed.edge_name, "a:0");
        assert_eq!((parsed.frame_id, parsed.iter_id), (0, 0));
        assert_eq!(parsed.full_key(), raw);
        assert!(ParsedKey::parse("a;b;c").is_err());
        assert!(ParsedKey::parse("a;zz;c;d;0:0").is_err());
    }

    #[test]
    fn test_send_then_recv() {
        let r = LocalRendezvous::new();
        r.send(&key("x"), value(1.0)).unwrap();
        r.send(&key("x"), value(2.0)).unwrap();
        let got = r.recv(&key("x"), Some(Duration::from_secs(1))).unwrap();
        assert_eq!(got.tensor.scalar_value_f64(), Some(1.0));
        let got = r.recv(&key("x"), None).unwrap();
        assert_eq!(got.tensor.scalar_value_f64(), Some(2.0));
    }

    #[test]
    fn test_recv_then_send() {
        let r = Arc::new(LocalRendezvous::new());
        let r2 = r.clone();
        let handle = std::thread::spawn(move || r2.recv(&key("y"), Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        r.send(&key("y"), value(3.0)).unwrap();
        let got = handle.join().unwrap().unwrap();
        assert_eq!(got.tensor.scalar_value_f64(), Some(3.0));
    }

    #[test]
    fn test_abort_fails_waiters_and_later_sends() {
        let r = Arc::new(LocalRendezvous::new());
        let r2 = r.clone();
        let handle = std::thread::spawn(move || r2.recv(&key("z"), None));
        std::thread::sleep(Duration::from_millis(20));
        r.start_abort(SessionError::cancelled("step cancelled"));
        r.start_abort(SessionError::internal("ignored"));
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err, SessionError::cancelled("step cancelled"));
        assert!(r.send(&key("z"), value(0.0)).is_err());
        assert!(r.status().is_err());
    }

    #[test]
    fn test_recv_timeout() {
        let r = LocalRendezvous::new();
        let err = r.recv(&key("never"), Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DeadlineExceeded);
    }
}
