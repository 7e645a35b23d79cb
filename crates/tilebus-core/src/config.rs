//! Port strings and explicit transport registration
//!
//! A port string selects a transport and optionally a serial port and device:
//! `transport[:port[,connection_string]]`, for example `bled112`,
//! `bled112:/dev/ttyACM0` or `bled112:<auto>,C0:11:22:33:44:55`.
//!
//! Transports are not discovered by scanning loaded code. Each transport crate
//! exposes a `register` function that adds its factory to a
//! [`TransportRegistry`] at startup.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::Transport;
use crate::{Result, TileBusError};

/// Sentinel port value asking the transport to find its hardware itself
pub const AUTO_PORT: &str = "<auto>";

// ----------------------------------------------------------------------------
// Port Specification
// ----------------------------------------------------------------------------

/// A parsed port string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Registered transport name
    pub transport: String,
    /// Serial device path, [`AUTO_PORT`], or absent
    pub port: Option<String>,
    /// Device to connect to right after opening
    pub connection_string: Option<String>,
}

impl PortSpec {
    /// Parse `transport[:port[,connection_string]]`
    pub fn parse(spec: &str) -> Result<Self> {
        let (transport, rest) = match spec.split_once(':') {
            Some((transport, rest)) => (transport.trim(), Some(rest)),
            None => (spec.trim(), None),
        };

        if transport.is_empty() {
            return Err(TileBusError::InvalidPort {
                port: spec.to_string(),
                reason: "missing transport name".to_string(),
            });
        }

        let (port, connection_string) = match rest {
            None => (None, None),
            Some(rest) => match rest.split_once(',') {
                Some((port, conn)) => (non_empty(port), non_empty(conn)),
                None => (non_empty(rest), None),
            },
        };

        Ok(Self {
            transport: transport.to_string(),
            port,
            connection_string,
        })
    }

    /// Whether the transport should pick its port automatically
    pub fn is_auto_port(&self) -> bool {
        self.port.as_deref().map_or(true, |port| port == AUTO_PORT)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.transport)?;
        if self.port.is_some() || self.connection_string.is_some() {
            write!(f, ":{}", self.port.as_deref().unwrap_or(""))?;
        }
        if let Some(conn) = &self.connection_string {
            write!(f, ",{}", conn)?;
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

// ----------------------------------------------------------------------------
// Transport Registry
// ----------------------------------------------------------------------------

/// Constructor for a transport, given the parsed port string
pub type TransportFactory = fn(&PortSpec) -> Result<Box<dyn Transport>>;

/// Maps transport names to their constructors
#[derive(Default)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport; an existing entry with the same name is replaced
    pub fn register(&mut self, name: &str, factory: TransportFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            tracing::debug!("Replaced transport factory for '{}'", name);
        }
    }

    /// Registered transport names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the transport named by `spec`
    pub fn create(&self, spec: &PortSpec) -> Result<Box<dyn Transport>> {
        let factory = self
            .factories
            .get(&spec.transport)
            .ok_or_else(|| TileBusError::UnknownTransport {
                name: spec.transport.clone(),
            })?;
        factory(spec)
    }
}
