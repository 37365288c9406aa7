//! Proxy configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable holding the session bus address.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// How long a forwarded call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address of the container's private bus, e.g. "unix:path=/run/user/1000/kapsule/box/bus".
    pub container_bus_address: String,
    /// Address of the host session bus. Falls back to the environment.
    pub host_bus_address: Option<String>,
    /// Reply timeout for forwarded calls.
    pub call_timeout: Duration,
}

impl ProxyConfig {
    /// Create a configuration for the given container bus.
    pub fn new(container_bus_address: impl Into<String>) -> Self {
        Self {
            container_bus_address: container_bus_address.into(),
            host_bus_address: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Use an explicit host bus address.
    pub fn with_host_bus(mut self, address: impl Into<String>) -> Self {
        self.host_bus_address = Some(address.into());
        self
    }

    /// Override the reply timeout for forwarded calls.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The host bus address to connect to.
    ///
    /// `None` means the library default session bus.
    pub fn host_address(&self) -> Option<String> {
        self.host_bus_address
            .clone()
            .or_else(|| std::env::var(SESSION_BUS_ENV).ok())
            .filter(|addr| !addr.is_empty())
    }

    /// Check the configuration before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.container_bus_address.trim().is_empty() {
            return Err(Error::Config("container bus address is empty".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call timeout must be positive".into()));
        }
        Ok(())
    }
}
