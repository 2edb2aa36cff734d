//! Control input listener
//!
//! Connects to the local broker, subscribes to every bound topic and feeds
//! valid inputs into the fleet state. Bad inputs are logged and dropped.
//! Losing this connection is fatal: without it the daemon can't be told
//! anything, so `run` returns an error and the process exits.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::DaemonError;
use crate::fleet::Fleet;
use crate::state::Bindings;
use crate::transport::{Connector, Link, TransportEvent};

pub struct ControlListener {
    broker: String,
    bindings: Arc<Bindings>,
    fleet: Arc<Fleet>,
    connector: Arc<dyn Connector>,
}

impl ControlListener {
    pub fn new(
        broker: impl Into<String>,
        bindings: Arc<Bindings>,
        fleet: Arc<Fleet>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            broker: broker.into(),
            bindings,
            fleet,
            connector,
        }
    }

    /// Listen until the connection ends.
    ///
    /// Returns `Ok` only for a disconnect we asked for.
    pub async fn run(self, shutdown: Arc<tokio::sync::Notify>) -> Result<(), DaemonError> {
        let connection = self.connector.connect(&self.broker).map_err(|e| DaemonError::ControlConnect {
            broker: self.broker.clone(),
            reason: e.to_string(),
        })?;
        let link = connection.link;
        let mut events = connection.events;

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.notified() => {
                    debug!("closing control connection to {}", self.broker);
                    link.disconnect();
                    return Ok(());
                }
            };

            let Some(event) = event else {
                return Err(DaemonError::ControlDisconnected {
                    broker: self.broker.clone(),
                    reason: "transport went away".to_string(),
                });
            };

            match event {
                TransportEvent::Connected(Ok(())) => {
                    info!("connected to {}", self.broker);
                    self.subscribe_all(link.as_ref());
                }
                TransportEvent::Connected(Err(reason)) => {
                    return Err(DaemonError::ControlConnect {
                        broker: self.broker.clone(),
                        reason,
                    });
                }
                TransportEvent::Message { channel, payload } => {
                    self.handle_message(&channel, &payload);
                }
                TransportEvent::Disconnected { expected: true, .. } => {
                    debug!("expected disconnect from {}", self.broker);
                    return Ok(());
                }
                TransportEvent::Disconnected { expected: false, reason } => {
                    return Err(DaemonError::ControlDisconnected {
                        broker: self.broker.clone(),
                        reason,
                    });
                }
            }
        }
    }

    fn subscribe_all(&self, link: &dyn Link) {
        for channel in self.bindings.channels() {
            if let Err(e) = link.subscribe(channel) {
                error!("{}", e);
            }
        }
    }

    /// Validate one input and apply it. Returns true if the state changed.
    pub fn handle_message(&self, channel: &str, payload: &[u8]) -> bool {
        debug!("message {}: {}", channel, String::from_utf8_lossy(payload));
        match self.bindings.resolve(channel, payload) {
            Ok((bits, on)) => self.fleet.apply_update(bits, on),
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}
