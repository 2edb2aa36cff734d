//! opsd core library
//!
//! Keeps the ops switches of a fleet of miners in sync with a handful of
//! local control topics. Each miner gets its own MQTT connection with
//! exponential reconnect backoff; the shared `(value, mask)` pair is pushed
//! to every connected miner whenever it changes, and again on a fixed
//! refresh interval.
//!
//! ```text
//!  local broker ──► ControlListener ──► Fleet::apply_update
//!                                            │ (value, mask) changed
//!                                            ▼
//!  Daemon (1 Hz) ──► Fleet::schedule_due   Fleet::broadcast_now ──► miners
//!        │                 │
//!        └── refresh ──────┴──► lifecycle task per connection attempt
//! ```

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod fleet;
pub mod state;
pub mod transport;

pub use config::DaemonConfig;
pub use control::ControlListener;
pub use daemon::Daemon;
pub use error::{ConfigError, DaemonError, InputError, TransportError};
pub use fleet::{ConnectionState, Fleet, FleetStatus, MemberId};
pub use state::{Bindings, InputBinding, OpsState};
pub use transport::{Connection, Connector, Link, TransportEvent};
