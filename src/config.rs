// Copyright 2026 BadCompany
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

use crate::engine_core::constants::config as keys;
use crate::engine_core::errors::BusError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Daemon endpoint parsed from `tcp://host:port` (scheme optional).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonAddress {
    pub host: String,
    pub port: u16,
}

impl DaemonAddress {
    pub fn parse(url: &str) -> Result<Self, BusError> {
        let trimmed = url.trim();
        let rest = match trimmed.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(BusError::InvalidAddress(url.to_string())),
            None => trimmed,
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| BusError::InvalidAddress(url.to_string()))?;
        if host.is_empty() {
            return Err(BusError::InvalidAddress(url.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BusError::InvalidAddress(url.to_string()))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for DaemonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.socket_addr())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub daemon_url: String,
    pub log_level: String,
    pub log_format: String, // "json" or "text"
    /// Default bound for correlated calls; `None` waits for the response or
    /// connection loss.
    pub call_timeout: Option<Duration>,
    /// How long Draining waits for in-flight handlers.
    pub drain_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, BusError> {
        let config = Self {
            daemon_url: env::var(keys::ENV_DAEMON_URL)
                .unwrap_or_else(|_| keys::DEFAULT_DAEMON_URL.to_string()),
            log_level: env::var(keys::ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            log_format: env::var(keys::ENV_LOG_FORMAT).unwrap_or_else(|_| "text".to_string()),
            call_timeout: env::var(keys::ENV_CALL_TIMEOUT_MS)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            drain_grace: Duration::from_millis(
                env::var(keys::ENV_DRAIN_GRACE_MS)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(keys::DEFAULT_DRAIN_GRACE_MS),
            ),
        };
        // Fail early on a malformed address rather than at connect time.
        config.daemon_address()?;
        Ok(config)
    }

    pub fn daemon_address(&self) -> Result<DaemonAddress, BusError> {
        DaemonAddress::parse(&self.daemon_url)
    }

    pub fn with_daemon_url(mut self, url: impl Into<String>) -> Self {
        self.daemon_url = url.into();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_url: keys::DEFAULT_DAEMON_URL.to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            call_timeout: None,
            drain_grace: Duration::from_millis(keys::DEFAULT_DRAIN_GRACE_MS),
        }
    }
}
