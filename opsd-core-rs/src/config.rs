//! Daemon configuration
//!
//! The command line is a flat list of items. Each item is one of:
//! - a readable file: one host per line, `#` starts a comment
//! - `topic@mask`: a control topic and the bits it drives. A negative mask
//!   (`/in/c@-0x4`) arms those bits at startup, defaulting to off.
//! - anything else: a host

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fleet::{BroadcastConfig, MAX_BACKOFF};
use crate::state::{Bindings, InputBinding, OpsState, OPS_SET_TOPIC};

/// Complete daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Local broker carrying the control topics
    pub broker: String,

    /// Miners to keep in sync
    pub hosts: Vec<String>,

    /// Control topic bindings
    pub bindings: Vec<InputBinding>,

    /// Interval of the unconditional state re-send
    pub refresh_interval: Duration,

    /// Retain state messages on the miners' brokers
    pub retain: bool,

    /// Topic the state is published on
    pub topic: String,

    /// Retry delay cap
    pub max_backoff: Duration,

    /// Scheduler cadence
    pub tick_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            hosts: Vec::new(),
            bindings: Vec::new(),
            refresh_interval: Duration::from_secs(600),
            retain: true,
            topic: OPS_SET_TOPIC.to_string(),
            max_backoff: MAX_BACKOFF,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl DaemonConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            ..Default::default()
        }
    }

    /// Add a miner
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    /// Add a control topic binding
    pub fn with_binding(mut self, binding: InputBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Set the refresh interval in (possibly fractional) seconds
    pub fn with_refresh_secs(mut self, secs: f64) -> Result<Self, ConfigError> {
        if secs.is_nan() || secs <= 0.0 {
            return Err(ConfigError::BadRefresh(secs));
        }
        self.refresh_interval =
            Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::BadRefresh(secs))?;
        Ok(self)
    }

    /// Retain (or not) state messages
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Set the scheduler cadence
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Classify and add command line items
    pub fn with_items<I, S>(mut self, items: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for item in items {
            let item = item.as_ref();
            let path = Path::new(item);

            if path.is_file() {
                self.hosts.extend(read_host_file(path)?);
            } else if let Some(binding) = parse_binding(item)? {
                self.bindings.push(binding);
            } else {
                self.hosts.push(item.to_string());
            }
        }
        Ok(self)
    }

    /// Configuration from command line items, everything else default
    pub fn from_items<I, S>(broker: impl Into<String>, items: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(broker).with_items(items)
    }

    pub fn bindings(&self) -> Bindings {
        Bindings::new(self.bindings.clone())
    }

    /// State before any input: pre-armed bits driven, all off
    pub fn initial_state(&self) -> OpsState {
        OpsState::armed(self.bindings().pre_armed_mask())
    }

    pub fn broadcast(&self) -> BroadcastConfig {
        BroadcastConfig {
            topic: self.topic.clone(),
            retain: self.retain,
        }
    }
}

/// Hosts listed in a file
pub fn read_host_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::HostFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_host_list(&content))
}

/// Host at the start of every line.
///
/// A line ends at the first whitespace or `#`. Lines that are empty after
/// that, including indented ones, are skipped.
pub fn parse_host_list(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let host = line
                .split(|c: char| c == '#' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            (!host.is_empty()).then(|| host.to_string())
        })
        .collect()
}

/// Parse `topic@mask`. Returns `None` if the item is not a binding.
pub fn parse_binding(item: &str) -> Result<Option<InputBinding>, ConfigError> {
    let mut parts = item.split('@');
    let (Some(channel), Some(literal), None) = (parts.next(), parts.next(), parts.next()) else {
        return Ok(None);
    };

    if channel.is_empty() {
        return Err(ConfigError::EmptyChannel(item.to_string()));
    }

    let bad_mask = || ConfigError::BadMask {
        item: item.to_string(),
        literal: literal.to_string(),
    };
    let parsed = parse_int_literal(literal).ok_or_else(bad_mask)?;
    let bits = u64::try_from(parsed.unsigned_abs()).map_err(|_| bad_mask())?;
    if bits == 0 {
        return Err(ConfigError::EmptyMask(item.to_string()));
    }

    Ok(Some(if parsed < 0 {
        InputBinding::pre_armed(channel, bits)
    } else {
        InputBinding::new(channel, bits)
    }))
}

/// Integer literal with optional sign and `0x`/`0o`/`0b` prefix.
///
/// `_` may separate digits. Decimal literals other than zero can't have
/// leading zeros.
pub fn parse_int_literal(literal: &str) -> Option<i128> {
    let s = literal.trim().to_ascii_lowercase();
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s.as_str())),
    };

    let (radix, digits) = if let Some(d) = rest.strip_prefix("0x") {
        (16, d.strip_prefix('_').unwrap_or(d))
    } else if let Some(d) = rest.strip_prefix("0o") {
        (8, d.strip_prefix('_').unwrap_or(d))
    } else if let Some(d) = rest.strip_prefix("0b") {
        (2, d.strip_prefix('_').unwrap_or(d))
    } else {
        if rest.starts_with('0') && rest.chars().any(|c| c != '0' && c != '_') {
            return None;
        }
        (10, rest)
    };

    if digits.is_empty()
        || digits.starts_with('_')
        || digits.ends_with('_')
        || digits.contains("__")
        || !digits.chars().all(|c| c == '_' || c.is_digit(radix))
    {
        return None;
    }

    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    let magnitude = i128::from_str_radix(&cleaned, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}
