//! Per-stage handshake timers.
//!
//! A [`TimeoutSet`] holds one single-shot timer per [`Stage`]. Arming a
//! stage restarts its timer from zero, clearing disarms it, and a firing is
//! delivered as a [`TimerFired`] message on the channel supplied at
//! construction. Each arm gets a generation number so a firing that lost a
//! race against [`TimeoutSet::clear`] is recognized and dropped.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, StageFailure};

/// A timed handshake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Opening the physical link.
    Connecting,
    /// Discovering services.
    DiscoveringServices,
    /// Discovering the handshake characteristic.
    DiscoveringCharacteristics,
    /// Reading the payload before writing a key.
    ReadingPreWrite,
    /// Writing the key.
    Writing,
    /// Reading the payload after the key was written.
    ReadingPostWrite,
}

impl Stage {
    /// All timed stages, in handshake order.
    pub const ALL: [Stage; 6] = [
        Stage::Connecting,
        Stage::DiscoveringServices,
        Stage::DiscoveringCharacteristics,
        Stage::ReadingPreWrite,
        Stage::Writing,
        Stage::ReadingPostWrite,
    ];

    fn index(self) -> usize {
        match self {
            Stage::Connecting => 0,
            Stage::DiscoveringServices => 1,
            Stage::DiscoveringCharacteristics => 2,
            Stage::ReadingPreWrite => 3,
            Stage::Writing => 4,
            Stage::ReadingPostWrite => 5,
        }
    }

    /// The error this stage fails with.
    pub fn failure(self, failure: StageFailure) -> Error {
        match self {
            Stage::Connecting => Error::ConnectFailed(failure),
            Stage::DiscoveringServices => Error::ServiceNotFound(failure),
            Stage::DiscoveringCharacteristics => Error::CharacteristicNotFound(failure),
            Stage::ReadingPreWrite | Stage::ReadingPostWrite => Error::ReadFailed(failure),
            Stage::Writing => Error::WriteFailed(failure),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connecting => "connecting",
            Stage::DiscoveringServices => "discovering services",
            Stage::DiscoveringCharacteristics => "discovering characteristics",
            Stage::ReadingPreWrite => "reading before write",
            Stage::Writing => "writing",
            Stage::ReadingPostWrite => "reading after write",
        };
        f.write_str(name)
    }
}

/// Default timeout for opening the link.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service and characteristic discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for characteristic reads.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for characteristic writes.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for one key service call.
const DEFAULT_KEY_SERVICE_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for each handshake stage.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use locker_core::timeouts::StageTimeouts;
///
/// let timeouts = StageTimeouts::default()
///     .connecting(Duration::from_secs(20))
///     .write(Duration::from_secs(5));
/// assert!(timeouts.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Opening the physical link.
    pub connecting: Duration,
    /// Service discovery.
    pub service_discovery: Duration,
    /// Characteristic discovery.
    pub characteristic_discovery: Duration,
    /// Read before the key is written.
    pub read_pre_write: Duration,
    /// Key write.
    pub write: Duration,
    /// Read after the key is written.
    pub read_post_write: Duration,
    /// One `get_key` or `save_key` call on the key service.
    pub key_service: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            connecting: DEFAULT_CONNECT_TIMEOUT,
            service_discovery: DEFAULT_DISCOVERY_TIMEOUT,
            characteristic_discovery: DEFAULT_DISCOVERY_TIMEOUT,
            read_pre_write: DEFAULT_READ_TIMEOUT,
            write: DEFAULT_WRITE_TIMEOUT,
            read_post_write: DEFAULT_READ_TIMEOUT,
            key_service: DEFAULT_KEY_SERVICE_TIMEOUT,
        }
    }
}

impl StageTimeouts {
    /// Use one timeout for every stage.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            connecting: timeout,
            service_discovery: timeout,
            characteristic_discovery: timeout,
            read_pre_write: timeout,
            write: timeout,
            read_post_write: timeout,
            key_service: timeout,
        }
    }

    /// Timeout for a given stage.
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Connecting => self.connecting,
            Stage::DiscoveringServices => self.service_discovery,
            Stage::DiscoveringCharacteristics => self.characteristic_discovery,
            Stage::ReadingPreWrite => self.read_pre_write,
            Stage::Writing => self.write,
            Stage::ReadingPostWrite => self.read_post_write,
        }
    }

    /// Set the connecting timeout.
    #[must_use]
    pub fn connecting(mut self, timeout: Duration) -> Self {
        self.connecting = timeout;
        self
    }

    /// Set both discovery timeouts.
    #[must_use]
    pub fn discovery(mut self, timeout: Duration) -> Self {
        self.service_discovery = timeout;
        self.characteristic_discovery = timeout;
        self
    }

    /// Set both read timeouts.
    #[must_use]
    pub fn read(mut self, timeout: Duration) -> Self {
        self.read_pre_write = timeout;
        self.read_post_write = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write(mut self, timeout: Duration) -> Self {
        self.write = timeout;
        self
    }

    /// Set the key service deadline.
    #[must_use]
    pub fn key_service(mut self, timeout: Duration) -> Self {
        self.key_service = timeout;
        self
    }

    /// Reject zero timeouts.
    pub fn validate(&self) -> crate::Result<()> {
        for stage in Stage::ALL {
            if self.for_stage(stage).is_zero() {
                return Err(Error::invalid_config(format!(
                    "timeout for stage '{}' must be greater than zero",
                    stage
                )));
            }
        }
        if self.key_service.is_zero() {
            return Err(Error::invalid_config(
                "key service timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A stage timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// The stage whose timer fired.
    pub stage: Stage,
    generation: u64,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    cancel: CancellationToken,
}

/// One restartable single-shot timer per handshake stage.
#[derive(Debug)]
pub struct TimeoutSet {
    durations: StageTimeouts,
    fired: mpsc::UnboundedSender<TimerFired>,
    armed: [Option<ArmedTimer>; 6],
    generation: u64,
    root: CancellationToken,
}

impl TimeoutSet {
    /// Create a timer set that reports firings on `fired`.
    pub fn new(durations: StageTimeouts, fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            durations,
            fired,
            armed: Default::default(),
            generation: 0,
            root: CancellationToken::new(),
        }
    }

    /// The configured durations.
    pub fn durations(&self) -> &StageTimeouts {
        &self.durations
    }

    /// (Re)arm the timer for `stage` from zero.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set(&mut self, stage: Stage) {
        self.clear(stage);
        self.generation += 1;

        let generation = self.generation;
        let duration = self.durations.for_stage(stage);
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let fired = self.fired.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(duration) => {
                    let _ = fired.send(TimerFired { stage, generation });
                }
            }
        });

        debug!(%stage, ?duration, "Stage timer armed");
        self.armed[stage.index()] = Some(ArmedTimer { generation, cancel });
    }

    /// Disarm the timer for `stage`, if armed.
    pub fn clear(&mut self, stage: Stage) {
        if let Some(timer) = self.armed[stage.index()].take() {
            timer.cancel.cancel();
        }
    }

    /// Disarm every timer.
    pub fn clear_all(&mut self) {
        for stage in Stage::ALL {
            self.clear(stage);
        }
    }

    /// Whether the timer for `stage` is armed.
    pub fn is_armed(&self, stage: Stage) -> bool {
        self.armed[stage.index()].is_some()
    }

    /// Whether any timer is armed.
    pub fn any_armed(&self) -> bool {
        self.armed.iter().any(Option::is_some)
    }

    /// Accept a firing if it belongs to the timer currently armed for its
    /// stage. The timer is disarmed and its duration returned. Stale
    /// firings (cleared or re-armed since) return `None`.
    pub fn accept(&mut self, fired: &TimerFired) -> Option<Duration> {
        let slot = &mut self.armed[fired.stage.index()];
        match slot {
            Some(timer) if timer.generation == fired.generation => {
                *slot = None;
                Some(self.durations.for_stage(fired.stage))
            }
            _ => None,
        }
    }
}

impl Drop for TimeoutSet {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
