/*
  hydroctl, an environmental control runtime for hydroponic installations.
  Copyright (C) 2024 the hydroctl developers.

  hydroctl is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  hydroctl is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The error vocabulary of the runtime.
//!
//! Every error carries one of four behaviors, which the scheduler and the API
//! boundary use to decide what happens next:
//!
//! * *transient* faults are logged and retried at the entity's next tick;
//! * *persistent* faults mark the entity as faulted until its configuration
//!   is replaced;
//! * *configuration* errors reject the mutating operation that caused them
//!   and leave existing state untouched;
//! * *safety* refusals drop the offending output operation but let the
//!   emitting controller keep running.
//!
//! Anything else (storage corruption, a failed panic-off) is fatal and takes
//! the runtime down.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
/// The set of all errors that the control runtime can produce.
pub enum Error {
    /// The ADC did not signal data-ready within the protocol deadline.
    /// Transient: the next scheduled sample will retry.
    #[error("timed out waiting for ADC data-ready (DOUT stuck high)")]
    AdcTimeout,

    /// A device answered with a payload that failed its checksum.
    #[error("checksum mismatch in payload from {device}")]
    ChecksumMismatch {
        /// Human-readable name of the offending device.
        device: &'static str,
    },

    /// A bus transaction failed in a way that is expected to clear itself,
    /// such as clock stretching past the deadline or a NAK from a busy slave.
    #[error("transient bus fault: {0}")]
    BusBusy(String),

    /// A GPIO line could not be acquired or driven.
    /// Persistent: the owning entity is faulted until reconfigured.
    #[error("GPIO line {pin} unavailable: {cause}")]
    LineUnavailable {
        /// The platform pin number.
        pin: u8,
        /// Description of the underlying failure.
        cause: String,
    },

    /// A device that the configuration references is not present on the bus.
    #[error("device missing: {0}")]
    DeviceMissing(String),

    /// A configuration was rejected during validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An output operation was refused by a safety interlock.
    #[error("safety interlock refused operation on pin {pin}: {reason}")]
    Refused {
        /// The pin the operation targeted.
        pin: u8,
        /// Why the interlock tripped.
        reason: String,
    },

    /// All outputs are latched off after a panic-off; writes are refused
    /// until the latch is cleared.
    #[error("outputs are latched off after panic-off")]
    PanicLatched,

    /// A sensor id did not resolve to a live sensor.
    #[error("no such sensor: {0}")]
    NoSuchSensor(u32),

    /// A controller id did not resolve to a live controller.
    #[error("no such controller: {0}")]
    NoSuchController(u32),

    /// A pin number is not part of the declared output pool.
    #[error("pin {0} is not a managed output")]
    NoSuchPin(u8),

    /// Persistent storage failed. Fatal.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// A serialization step failed while persisting or loading state. Fatal.
    #[error("persisted state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// An internal lock was poisoned by a panicking thread. Fatal.
    #[error("internal lock poisoned")]
    Poison,
}

impl Error {
    #[must_use]
    /// Whether this error should be retried at the entity's next scheduled
    /// tick rather than faulting the entity.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::AdcTimeout | Error::ChecksumMismatch { .. } | Error::BusBusy(_)
        )
    }

    #[must_use]
    /// Whether this error describes a rejected configuration, meaning the
    /// entity cannot make progress until its config is replaced.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    #[must_use]
    /// Whether this error is a safety-interlock refusal, which is logged but
    /// never aborts the emitting controller.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Error::Refused { .. } | Error::PanicLatched)
    }

    #[must_use]
    /// Whether this error must take the whole runtime down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Corrupt(_) | Error::Poison
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Poison
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::AdcTimeout.is_transient());
        assert!(Error::ChecksumMismatch { device: "sht41" }.is_transient());
        assert!(!Error::NoSuchPin(4).is_transient());
        assert!(!Error::PanicLatched.is_transient());
    }

    #[test]
    fn refusals_are_not_fatal() {
        let err = Error::Refused {
            pin: 17,
            reason: "maximum on-time exceeded".into(),
        };
        assert!(err.is_refusal());
        assert!(!err.is_fatal());
        assert!(!err.is_transient());
    }
}
