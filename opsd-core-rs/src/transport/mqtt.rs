//! MQTT transport over rumqttc
//!
//! Every `connect` builds a new `AsyncClient` with a fresh client id and
//! spawns a task polling its event loop. The task stops at the first error:
//! rumqttc would happily reconnect on its own, but retry timing belongs to
//! the caller's backoff, not to the client.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{parse_endpoint, Connection, Connector, Link, TransportEvent};
use crate::error::TransportError;

/// Capacity of the request queue between client handle and event loop
const REQUEST_CAPACITY: usize = 64;

/// Connector producing rumqttc-backed links
#[derive(Debug, Clone)]
pub struct MqttConnector {
    client_prefix: String,
    keep_alive: Duration,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            client_prefix: "opsd".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the prefix of generated client ids
    pub fn with_client_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_prefix = prefix.into();
        self
    }

    /// Set the MQTT keep-alive interval
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn client_id(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_prefix, &id[..12])
    }
}

impl Connector for MqttConnector {
    fn connect(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let (host, port) = parse_endpoint(endpoint)?;

        let mut options = MqttOptions::new(self.client_id(), host, port);
        options.set_keep_alive(self.keep_alive);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        debug!("mqtt: connecting to {}", endpoint);
        tokio::spawn(drive(endpoint.to_string(), eventloop, events_tx));

        Ok(Connection {
            link: Arc::new(MqttLink { client }),
            events: events_rx,
        })
    }
}

/// What to do with one event-loop poll result
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Forward the event and keep polling
    Emit(TransportEvent),
    /// Forward the event and stop
    Finish(TransportEvent),
    /// Nothing to report
    Skip,
}

/// Map a poll result to a transport notification. `connected` tracks
/// whether the handshake has completed on this connection.
fn translate(polled: Result<Event, ConnectionError>, connected: &mut bool) -> Step {
    match polled {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
            if ack.code == ConnectReturnCode::Success {
                *connected = true;
                Step::Emit(TransportEvent::Connected(Ok(())))
            } else {
                Step::Finish(TransportEvent::Connected(Err(format!("{:?}", ack.code))))
            }
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => Step::Emit(TransportEvent::Message {
            channel: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Ok(Event::Outgoing(Outgoing::Disconnect)) => Step::Finish(TransportEvent::Disconnected {
            expected: true,
            reason: "disconnect requested".to_string(),
        }),
        Ok(other) => {
            trace!("mqtt: {:?}", other);
            Step::Skip
        }
        Err(e) if *connected => Step::Finish(TransportEvent::Disconnected {
            expected: false,
            reason: e.to_string(),
        }),
        Err(e) => Step::Finish(TransportEvent::Connected(Err(e.to_string()))),
    }
}

/// Poll the event loop until the connection ends or nobody listens anymore
async fn drive(
    endpoint: String,
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut connected = false;

    loop {
        match translate(eventloop.poll().await, &mut connected) {
            Step::Emit(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Step::Finish(event) => {
                let _ = events.send(event);
                break;
            }
            Step::Skip => {}
        }
    }

    debug!("mqtt: event loop for {} stopped", endpoint);
}

struct MqttLink {
    client: AsyncClient,
}

impl Link for MqttLink {
    fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(channel, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    fn publish(&self, channel: &str, payload: &[u8], durable: bool) -> Result<(), TransportError> {
        self.client
            .try_publish(channel, QoS::AtLeastOnce, durable, payload.to_vec())
            .map_err(|e| TransportError::Publish {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt: disconnect request dropped: {}", e);
        }
    }
}
