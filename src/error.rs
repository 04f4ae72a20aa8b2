// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session error taxonomy.
//!
//! Every variant is recovered locally: the session writes it into the status
//! string and stays retryable.

use thiserror::Error;

use crate::bluetooth::RadioPowerState;

/// Which enumeration step a discovery failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryScope {
    Services,
    Characteristics { service: String },
}

impl std::fmt::Display for DiscoveryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryScope::Services => f.write_str("service discovery"),
            DiscoveryScope::Characteristics { service } => {
                write!(f, "characteristic discovery for {}", service)
            }
        }
    }
}

/// Errors surfaced by session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Bluetooth unavailable: {}", .0.describe())]
    RadioUnavailable(RadioPowerState),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("{scope} failed: {reason}")]
    DiscoveryFailed { scope: DiscoveryScope, reason: String },
    #[error("Not ready: no writable characteristic bound")]
    NotReady,
    #[error("Cannot encode text for transmission: {0}")]
    EncodingError(String),
    #[error("Unknown device: {0}")]
    UnknownPeripheral(String),
}

/// Result alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SessionError::RadioUnavailable(RadioPowerState::PoweredOff);
        assert_eq!(err.to_string(), "Bluetooth unavailable: Bluetooth is powered off");

        let err = SessionError::DiscoveryFailed {
            scope: DiscoveryScope::Characteristics {
                service: "ffe0".to_string(),
            },
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "characteristic discovery for ffe0 failed: timeout");
    }
}
