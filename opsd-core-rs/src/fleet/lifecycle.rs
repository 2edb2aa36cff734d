//! One connection attempt to one member
//!
//! ```text
//! Disconnected ──attempt──► Connecting ──ok──► Connected
//!      ▲                        │                  │
//!      └────── failure ─────────┴── unexpected ────┘
//!             (backoff x2)         disconnect (backoff x2)
//! ```
//!
//! The task lives as long as the transport it created. When the attempt
//! fails or the connection goes away, the member is put back on pending
//! and the task ends; the next attempt is a new task with a new transport.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Attempt, Fleet};
use crate::transport::TransportEvent;

pub(crate) async fn run(fleet: Arc<Fleet>, attempt: Attempt) {
    let connection = match fleet.connector().connect(&attempt.host) {
        Ok(connection) => connection,
        Err(e) => {
            info!("can't connect to {}: {}", attempt.host, e);
            fail(&fleet, &attempt);
            return;
        }
    };

    let link = connection.link;
    let mut events = connection.events;

    loop {
        let Some(event) = events.recv().await else {
            warn!("{}: transport went away without notice", attempt.host);
            fail(&fleet, &attempt);
            return;
        };

        match event {
            TransportEvent::Connected(Ok(())) => {
                if !fleet.on_connected(&attempt, &link) {
                    link.disconnect();
                    return;
                }
            }
            TransportEvent::Connected(Err(reason)) => {
                warn!("could not connect to {}: {}", attempt.host, reason);
                fail(&fleet, &attempt);
                return;
            }
            TransportEvent::Disconnected { expected: false, reason } => {
                warn!("unexpected disconnect from {}: {}", attempt.host, reason);
                fail(&fleet, &attempt);
                return;
            }
            TransportEvent::Disconnected { expected: true, .. } => {
                debug!("expected disconnect from {}", attempt.host);
                fleet.on_closed(&attempt);
                return;
            }
            TransportEvent::Message { channel, .. } => {
                debug!("{}: ignoring message on {}", attempt.host, channel);
            }
        }
    }
}

fn fail(fleet: &Fleet, attempt: &Attempt) {
    if let Some(backoff) = fleet.on_failed(attempt) {
        debug!("{}: retry in {:?}", attempt.host, backoff);
    }
}
