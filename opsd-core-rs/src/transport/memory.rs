//! In-process transport
//!
//! Endpoints are plain names. Connection attempts are answered according to
//! per-endpoint scripting (refuse the next N attempts, fail client creation,
//! hold the handshake open) and everything published is recorded so tests
//! can inspect what each endpoint received.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connection, Connector, Link, TransportEvent};
use crate::error::TransportError;

/// One recorded publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub payload: Vec<u8>,
    pub durable: bool,
}

impl Published {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct Endpoint {
    refusals: usize,
    unreachable: bool,
    hold: bool,
    attempts: usize,
    current: Option<Session>,
    published: Vec<Published>,
    subscriptions: Vec<String>,
}

struct Session {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: bool,
}

#[derive(Default)]
struct Shared {
    endpoints: HashMap<String, Endpoint>,
    next_session: u64,
}

/// Connector for in-memory endpoints
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` handshakes to `endpoint`
    pub fn refuse(&self, endpoint: &str, count: usize) {
        self.shared.lock().endpoints.entry(endpoint.to_string()).or_default().refusals = count;
    }

    /// Make `connect` itself fail for `endpoint`
    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        self.shared.lock().endpoints.entry(endpoint.to_string()).or_default().unreachable =
            unreachable;
    }

    /// Leave handshakes to `endpoint` unanswered until `accept` is called
    pub fn hold(&self, endpoint: &str, hold: bool) {
        self.shared.lock().endpoints.entry(endpoint.to_string()).or_default().hold = hold;
    }

    /// Complete a held handshake successfully
    pub fn accept(&self, endpoint: &str) -> bool {
        self.notify(endpoint, TransportEvent::Connected(Ok(())))
    }

    /// Drop the current connection to `endpoint` as if the peer went away
    pub fn drop_connection(&self, endpoint: &str) -> bool {
        let mut shared = self.shared.lock();
        let Some(session) = shared
            .endpoints
            .get_mut(endpoint)
            .and_then(|e| e.current.as_mut())
            .filter(|s| s.open)
        else {
            return false;
        };
        session.open = false;
        session
            .events
            .send(TransportEvent::Disconnected {
                expected: false,
                reason: "connection reset".to_string(),
            })
            .is_ok()
    }

    /// Deliver a message on the current connection to `endpoint`
    pub fn inject(&self, endpoint: &str, channel: &str, payload: &[u8]) -> bool {
        self.notify(
            endpoint,
            TransportEvent::Message {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            },
        )
    }

    /// Everything published to `endpoint`, across all connections
    pub fn published(&self, endpoint: &str) -> Vec<Published> {
        self.shared
            .lock()
            .endpoints
            .get(endpoint)
            .map(|e| e.published.clone())
            .unwrap_or_default()
    }

    /// Payloads published to `endpoint` on `channel`, oldest first
    pub fn payloads(&self, endpoint: &str, channel: &str) -> Vec<String> {
        self.published(endpoint)
            .iter()
            .filter(|p| p.channel == channel)
            .map(Published::payload_str)
            .collect()
    }

    /// Channels subscribed on `endpoint`, across all connections
    pub fn subscriptions(&self, endpoint: &str) -> Vec<String> {
        self.shared
            .lock()
            .endpoints
            .get(endpoint)
            .map(|e| e.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Number of `connect` calls made for `endpoint`
    pub fn attempts(&self, endpoint: &str) -> usize {
        self.shared.lock().endpoints.get(endpoint).map_or(0, |e| e.attempts)
    }

    /// Whether the latest connection to `endpoint` is still open
    pub fn is_open(&self, endpoint: &str) -> bool {
        self.shared
            .lock()
            .endpoints
            .get(endpoint)
            .and_then(|e| e.current.as_ref())
            .is_some_and(|s| s.open)
    }

    fn notify(&self, endpoint: &str, event: TransportEvent) -> bool {
        let shared = self.shared.lock();
        shared
            .endpoints
            .get(endpoint)
            .and_then(|e| e.current.as_ref())
            .filter(|s| s.open)
            .is_some_and(|s| s.events.send(event).is_ok())
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let mut shared = self.shared.lock();
        let id = shared.next_session;
        shared.next_session += 1;

        let entry = shared.endpoints.entry(endpoint.to_string()).or_default();
        entry.attempts += 1;

        if entry.unreachable {
            return Err(TransportError::Create {
                endpoint: endpoint.to_string(),
                reason: "unreachable".to_string(),
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut open = true;

        if entry.refusals > 0 {
            entry.refusals -= 1;
            open = false;
            let _ = events_tx.send(TransportEvent::Connected(Err("connection refused".to_string())));
        } else if !entry.hold {
            let _ = events_tx.send(TransportEvent::Connected(Ok(())));
        }

        entry.current = Some(Session {
            id,
            events: events_tx,
            open,
        });

        Ok(Connection {
            link: Arc::new(MemoryLink {
                endpoint: endpoint.to_string(),
                session: id,
                shared: self.shared.clone(),
            }),
            events: events_rx,
        })
    }
}

struct MemoryLink {
    endpoint: String,
    session: u64,
    shared: Arc<Mutex<Shared>>,
}

impl MemoryLink {
    /// Run `f` on the endpoint if this link's session is the live one
    fn with_open<T>(&self, f: impl FnOnce(&mut Endpoint) -> T) -> Result<T, TransportError> {
        let mut shared = self.shared.lock();
        let endpoint = shared
            .endpoints
            .get_mut(&self.endpoint)
            .ok_or(TransportError::Closed)?;
        let live = endpoint
            .current
            .as_ref()
            .is_some_and(|s| s.id == self.session && s.open);
        if !live {
            return Err(TransportError::Closed);
        }
        Ok(f(endpoint))
    }
}

impl Link for MemoryLink {
    fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.with_open(|e| e.subscriptions.push(channel.to_string()))
    }

    fn publish(&self, channel: &str, payload: &[u8], durable: bool) -> Result<(), TransportError> {
        self.with_open(|e| {
            e.published.push(Published {
                channel: channel.to_string(),
                payload: payload.to_vec(),
                durable,
            })
        })
    }

    fn disconnect(&self) {
        let _ = self.with_open(|e| {
            if let Some(session) = e.current.as_mut() {
                session.open = false;
                let _ = session.events.send(TransportEvent::Disconnected {
                    expected: true,
                    reason: "disconnect requested".to_string(),
                });
            }
        });
    }
}
