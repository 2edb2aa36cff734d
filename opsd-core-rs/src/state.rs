//! Ops switch state and input bindings
//!
//! The fleet-wide state is a bitfield `value` plus a `mask` of the bits we
//! drive. Bits outside the mask are left alone on the miners. Every control
//! topic is bound to a bit mask; a `"1"` on the topic sets those bits, a
//! `"0"` clears them, and either way they join the mask for good.

use std::fmt;

use crate::error::InputError;

/// Topic the state is published on, on every miner
pub const OPS_SET_TOPIC: &str = "/power/on/ops-set";

/// Shared `(value, mask)` pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpsState {
    pub value: u64,
    pub mask: u64,
}

impl OpsState {
    pub fn new(value: u64, mask: u64) -> Self {
        Self { value, mask }
    }

    /// State with `bits` driven and defaulting to off
    pub fn armed(bits: u64) -> Self {
        Self { value: 0, mask: bits }
    }

    /// Apply one input. Returns the new state, or `None` if nothing changed.
    pub fn apply(&self, bits: u64, on: bool) -> Option<OpsState> {
        let next = OpsState {
            value: if on { self.value | bits } else { self.value & !bits },
            mask: self.mask | bits,
        };
        (next != *self).then_some(next)
    }

    /// Wire form: `0x<value> 0x<mask>`
    pub fn encode(&self) -> String {
        format!("{:#x} {:#x}", self.value, self.mask)
    }
}

impl fmt::Display for OpsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

/// A control topic and the bits it drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub channel: String,
    pub bits: u64,
    /// Bits join the mask at startup, before any input arrives
    pub pre_armed: bool,
}

impl InputBinding {
    pub fn new(channel: impl Into<String>, bits: u64) -> Self {
        Self {
            channel: channel.into(),
            bits,
            pre_armed: false,
        }
    }

    pub fn pre_armed(channel: impl Into<String>, bits: u64) -> Self {
        Self {
            channel: channel.into(),
            bits,
            pre_armed: true,
        }
    }
}

/// Lookup table from control topic to bits
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    bindings: Vec<InputBinding>,
}

impl Bindings {
    pub fn new(bindings: Vec<InputBinding>) -> Self {
        Self { bindings }
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputBinding> {
        self.bindings.iter()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.channel.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Union of the pre-armed bindings' bits
    pub fn pre_armed_mask(&self) -> u64 {
        self.bindings
            .iter()
            .filter(|b| b.pre_armed)
            .fold(0, |mask, b| mask | b.bits)
    }

    /// Validate an input message and resolve it to `(bits, on)`.
    ///
    /// The payload is checked before the topic. If a topic is bound more
    /// than once, the first binding wins.
    pub fn resolve(&self, channel: &str, payload: &[u8]) -> Result<(u64, bool), InputError> {
        let on = match payload {
            b"1" => true,
            b"0" => false,
            _ => {
                return Err(InputError::BadValue {
                    channel: channel.to_string(),
                    payload: String::from_utf8_lossy(payload).into_owned(),
                })
            }
        };

        self.bindings
            .iter()
            .find(|b| b.channel == channel)
            .map(|b| (b.bits, on))
            .ok_or_else(|| InputError::UnknownChannel(channel.to_string()))
    }
}
