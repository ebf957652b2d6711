//! Distributed, time-sortable 64-bit identifiers.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! [ 0 | 41 bits: ms since custom epoch | 10 bits: node id | 12 bits: sequence ]
//! ```
//!
//! 41 bits of milliseconds cover roughly 69 years past the custom epoch, the
//! node id allows 1024 generators, and the sequence rolls over after 4096 ids.

use crate::clock::{system_clock, SharedClock};
use crate::message::MessageId;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

/// Bits holding the timestamp.
pub const TIMESTAMP_BITS: u32 = 41;
/// Bits holding the node id.
pub const NODE_ID_BITS: u32 = 10;
/// Bits holding the sequence number.
pub const SEQUENCE_BITS: u32 = 12;
/// Position of the timestamp inside an id.
pub const TIMESTAMP_SHIFT: u32 = NODE_ID_BITS + SEQUENCE_BITS;

/// Largest valid node id.
pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;
/// Largest sequence value.
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
/// Largest timestamp (ms since the custom epoch) an id can hold.
pub const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Default tolerated backward clock jump.
pub const DEFAULT_MAX_CLOCK_REGRESSION_MS: u64 = 1_000;

const NODE_ID_MASK: u64 = MAX_NODE_ID as u64;
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Failure to construct a generator.
#[derive(Debug, Error)]
pub enum InitializationError {
    /// Node id does not fit in 10 bits.
    #[error("Node id {0} exceeds the maximum value of {MAX_NODE_ID}")]
    NodeIdOutOfRange(u16),

    /// Epoch before 1970.
    #[error("Custom epoch cannot be negative: {0}")]
    NegativeEpoch(i64),

    /// Epoch after the current time.
    #[error("Custom epoch {epoch_millis} is ahead of the clock ({now_millis})")]
    EpochInFuture {
        /// Requested epoch.
        epoch_millis: u64,
        /// Clock reading at construction.
        now_millis: u64,
    },

    /// No interface exposes a usable hardware address.
    #[error("Could not derive node id: no hardware address found")]
    NoHardwareAddress,

    /// Network interfaces could not be listed.
    #[error("Unable to read network interfaces: {0}")]
    NetworkInterfaces(#[from] std::io::Error),
}

/// Failure to mint an id.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The clock jumped backwards further than tolerated.
    #[error("Clock moved backwards by {regression_ms} ms (tolerance {tolerance_ms} ms)")]
    ClockRegressed {
        /// How far the clock went back.
        regression_ms: u64,
        /// Configured tolerance.
        tolerance_ms: u64,
    },

    /// The epoch is too far in the past for 41 bits.
    #[error("Timestamp {0} ms since the custom epoch does not fit in {TIMESTAMP_BITS} bits")]
    TimestampOverflow(u64),
}

/// Where the generator's node id comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIdSource {
    /// A fixed id in `[0, 1023]`.
    Explicit(u16),
    /// Hash of the first non-loopback hardware address.
    FromNetworkInterface,
    /// A random id; two nodes may pick the same one.
    RandomAcceptingCollisionRisk,
}

impl NodeIdSource {
    /// Resolve to a concrete node id.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit id is out of range or no hardware
    /// address can be found.
    pub fn resolve(self) -> Result<u16, InitializationError> {
        match self {
            Self::Explicit(id) if id > MAX_NODE_ID => {
                Err(InitializationError::NodeIdOutOfRange(id))
            }
            Self::Explicit(id) => Ok(id),
            Self::FromNetworkInterface => node_id_from_network_interfaces(Path::new(SYS_CLASS_NET)),
            Self::RandomAcceptingCollisionRisk => Ok(rand::random::<u16>() & MAX_NODE_ID),
        }
    }
}

/// Generator configuration.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Custom epoch in Unix milliseconds.
    pub epoch_millis: i64,
    /// Node id source.
    pub node_id: NodeIdSource,
    /// Largest backward clock jump absorbed without failing.
    pub max_clock_regression_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            epoch_millis: 0,
            node_id: NodeIdSource::FromNetworkInterface,
            max_clock_regression_ms: DEFAULT_MAX_CLOCK_REGRESSION_MS,
        }
    }
}

/// The three fields packed into an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Milliseconds since the custom epoch.
    pub timestamp: u64,
    /// Node id.
    pub node_id: u16,
    /// Sequence number.
    pub sequence: u16,
}

#[derive(Debug)]
struct SequenceState {
    last_timestamp: u64,
    sequence: u64,
}

/// Mints unique, roughly time-ordered ids.
///
/// Safe to share between threads; each call holds a short internal lock.
#[derive(Debug)]
pub struct IdGenerator {
    epoch_millis: u64,
    node_id: u16,
    max_clock_regression_ms: u64,
    clock: SharedClock,
    state: Mutex<SequenceState>,
}

impl IdGenerator {
    /// Create a generator with the given epoch and node id source.
    ///
    /// # Errors
    ///
    /// See [`InitializationError`].
    pub fn new(epoch_millis: i64, node_id: NodeIdSource) -> Result<Self, InitializationError> {
        Self::with_config(GeneratorConfig {
            epoch_millis,
            node_id,
            ..GeneratorConfig::default()
        })
    }

    /// Create a generator from a configuration, reading the system clock.
    ///
    /// # Errors
    ///
    /// See [`InitializationError`].
    pub fn with_config(config: GeneratorConfig) -> Result<Self, InitializationError> {
        Self::with_clock(config, system_clock())
    }

    /// Create a generator reading time from `clock`.
    ///
    /// # Errors
    ///
    /// See [`InitializationError`].
    pub fn with_clock(
        config: GeneratorConfig,
        clock: SharedClock,
    ) -> Result<Self, InitializationError> {
        if config.epoch_millis < 0 {
            return Err(InitializationError::NegativeEpoch(config.epoch_millis));
        }
        let epoch_millis = config.epoch_millis as u64;

        let now_millis = clock.now_millis();
        if now_millis < epoch_millis {
            return Err(InitializationError::EpochInFuture {
                epoch_millis,
                now_millis,
            });
        }

        let node_id = config.node_id.resolve()?;
        let sequence = u64::from(rand::random::<u16>()) & MAX_SEQUENCE;

        info!(
            node_id,
            epoch_millis,
            source = ?config.node_id,
            "Creating snowflake generator"
        );

        Ok(Self {
            epoch_millis,
            node_id,
            max_clock_regression_ms: config.max_clock_regression_ms,
            clock,
            state: Mutex::new(SequenceState {
                last_timestamp: (now_millis - epoch_millis).saturating_sub(1),
                sequence,
            }),
        })
    }

    /// Mint the next id.
    ///
    /// Blocks only when 4096 ids were minted within one millisecond, until the
    /// clock moves on.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock jumped back beyond the tolerance or the
    /// timestamp no longer fits in 41 bits.
    pub fn next_id(&self) -> Result<MessageId, IdError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut timestamp = self.elapsed_millis();
        if timestamp < state.last_timestamp {
            let regression_ms = state.last_timestamp - timestamp;
            if regression_ms > self.max_clock_regression_ms {
                return Err(IdError::ClockRegressed {
                    regression_ms,
                    tolerance_ms: self.max_clock_regression_ms,
                });
            }
            warn!(regression_ms, "Clock moved backwards, holding last timestamp");
            timestamp = state.last_timestamp;
        }

        let sequence = state.sequence;
        state.sequence = (sequence + 1) & MAX_SEQUENCE;

        // The counter wrapped inside one millisecond: wait for the next one.
        if sequence == 0 && timestamp == state.last_timestamp {
            while timestamp <= state.last_timestamp {
                std::hint::spin_loop();
                timestamp = self.elapsed_millis();
            }
        }

        if timestamp > MAX_TIMESTAMP {
            return Err(IdError::TimestampOverflow(timestamp));
        }

        state.last_timestamp = timestamp;

        Ok((timestamp << TIMESTAMP_SHIFT) | (u64::from(self.node_id) << SEQUENCE_BITS) | sequence)
    }

    /// The node id packed into every id of this generator.
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// The custom epoch in Unix milliseconds.
    #[must_use]
    pub fn epoch_millis(&self) -> u64 {
        self.epoch_millis
    }

    /// Creation time of `id` in Unix milliseconds.
    #[must_use]
    pub fn unix_millis(&self, id: MessageId) -> u64 {
        self.epoch_millis + timestamp_of(id)
    }

    /// Creation time of `id`.
    #[must_use]
    pub fn to_instant(&self, id: MessageId) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.unix_millis(id))
    }

    fn elapsed_millis(&self) -> u64 {
        self.clock.now_millis().saturating_sub(self.epoch_millis)
    }
}

/// Milliseconds since the custom epoch embedded in `id`.
#[must_use]
pub fn timestamp_of(id: MessageId) -> u64 {
    id >> TIMESTAMP_SHIFT
}

/// Split an id into its fields.
#[must_use]
pub fn decompose(id: MessageId) -> SnowflakeParts {
    SnowflakeParts {
        timestamp: timestamp_of(id),
        node_id: ((id >> SEQUENCE_BITS) & NODE_ID_MASK) as u16,
        sequence: (id & MAX_SEQUENCE) as u16,
    }
}

/// Map a hex-encoded hardware address onto the node id range (FNV-1a).
#[must_use]
pub fn hash_hardware_address(hex: &str) -> u16 {
    let hash = hex.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    (hash & u32::from(MAX_NODE_ID)) as u16
}

fn node_id_from_network_interfaces(root: &Path) -> Result<u16, InitializationError> {
    let mut interfaces: Vec<_> = fs::read_dir(root)?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name())
        .collect();
    interfaces.sort();

    for name in interfaces {
        if name == "lo" {
            continue;
        }
        let Ok(raw) = fs::read_to_string(root.join(&name).join("address")) else {
            continue;
        };

        let hex: String = raw
            .trim()
            .chars()
            .filter(char::is_ascii_hexdigit)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if hex.is_empty() || hex.bytes().all(|b| b == b'0') {
            continue;
        }

        let node_id = hash_hardware_address(&hex);
        info!(
            interface = %name.to_string_lossy(),
            address = %raw.trim().to_ascii_uppercase(),
            node_id,
            "Using network interface for node id"
        );
        return Ok(node_id);
    }

    Err(InitializationError::NoHardwareAddress)
}
