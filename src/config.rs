//! Server configuration.
//!
//! Build it in code with the `with_*` setters or read it from TOML:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8080
//! phase = "second"
//! policy = "blocking_handoff"
//!
//! [log]
//! response_info = true
//! ```
//!
//! Every field is optional; missing ones keep their defaults.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;
use crate::scheduler::Phase;
use crate::server::DispatchPolicy;

/// Listener address, scheduling phase and dispatch policy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Phase at which the host drains this server's queue.
    pub phase: Phase,
    pub policy: DispatchPolicy,
    pub log: LogOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            phase: Phase::default(),
            policy: DispatchPolicy::default(),
            log: LogOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_log(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }

    /// `host:port`, as handed to the socket layer.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The URL prefix a route path is served under.
    pub fn prefix_for(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// Which informational events are logged. Warnings and errors always are.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogOptions {
    /// Method and URI of every accepted request.
    pub received_routes: bool,
    /// Status of every response after its handler ran.
    pub response_info: bool,
    /// Listen prefixes once the socket is bound.
    pub started_listening: bool,
    /// The listener closing.
    pub closed_listening: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            received_routes: true,
            response_info: false,
            started_listening: true,
            closed_listening: true,
        }
    }
}
