//! Coordinator
//!
//! Ticks once per second. Each tick re-sends the state if the refresh
//! interval has passed, then starts a connection attempt for every member
//! whose retry deadline is up. The control listener runs alongside; when it
//! fails the daemon stops with its error.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::control::ControlListener;
use crate::error::DaemonError;
use crate::fleet::Fleet;
use crate::state::Bindings;
use crate::transport::Connector;

pub struct Daemon {
    config: DaemonConfig,
    fleet: Arc<Fleet>,
    bindings: Arc<Bindings>,
    connector: Arc<dyn Connector>,
    last_refresh: Instant,
}

impl Daemon {
    /// Build the fleet from `config`. No connection is made until the first tick.
    pub fn new(config: DaemonConfig, connector: Arc<dyn Connector>) -> Self {
        let fleet = Arc::new(Fleet::new(
            connector.clone(),
            config.broadcast(),
            config.initial_state(),
            config.max_backoff,
        ));
        for host in &config.hosts {
            fleet.register(host);
        }

        Self {
            bindings: Arc::new(config.bindings()),
            config,
            fleet,
            connector,
            last_refresh: Instant::now(),
        }
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// One scheduler step. Returns the number of connection attempts started.
    pub fn tick(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_refresh) >= self.config.refresh_interval {
            let sent = self.fleet.broadcast_now();
            let status = self.fleet.status();
            info!(
                "refresh {} to {} miners ({} waiting, {} connecting)",
                status.state, sent, status.waiting, status.connecting
            );
            self.last_refresh = now;
        }

        let due = self.fleet.schedule_due(now);
        let started = due.len();
        for attempt in due {
            self.fleet.attempt(attempt);
        }
        started
    }

    /// Run until a shutdown signal or a control channel failure
    pub async fn run(mut self) -> Result<(), DaemonError> {
        info!(
            "opsd: {} miners, control broker {}, refresh {:?}",
            self.fleet.with_registry(|r| r.len()),
            self.config.broker,
            self.config.refresh_interval
        );
        for binding in self.bindings.iter() {
            info!(
                "  {} -> {:#x}{}",
                binding.channel,
                binding.bits,
                if binding.pre_armed { " (armed)" } else { "" }
            );
        }
        if self.fleet.state().mask != 0 {
            info!("initial state {}", self.fleet.state());
        }

        let shutdown = Arc::new(Notify::new());
        let listener = ControlListener::new(
            self.config.broker.clone(),
            self.bindings.clone(),
            self.fleet.clone(),
            self.connector.clone(),
        );
        let mut control = tokio::spawn(listener.run(shutdown.clone()));

        let signal = wait_for_shutdown_signal();
        tokio::pin!(signal);

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut control => {
                    self.fleet.disconnect_all();
                    return result.map_err(|e| DaemonError::ListenerTask(e.to_string()))?;
                }
                result = &mut signal => {
                    result?;
                    info!("shutting down");
                    shutdown.notify_one();
                    self.fleet.disconnect_all();
                    if let Err(e) = control.await {
                        debug!("control listener: {}", e);
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }
        }
    }
}

/// Wait for SIGINT, SIGTERM or SIGQUIT (ctrl-c elsewhere)
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
