//! kapsule-dbus-proxy - bridges a container's private D-Bus bus and the
//! host session bus.
//!
//! A [`DbusProxy`] tracks which bus owns each well-known name, forwards
//! method calls to the right side and hands the replies back to the
//! caller. Names owned inside the container take priority over host names.
//! [`ProxyManager`] runs one proxy per container.

pub mod bus_connection;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod proxy;
pub mod routing;
pub mod serial_map;

pub use bus_connection::{BusConnection, BusLink, Connector, ZbusConnector};
pub use config::ProxyConfig;
pub use error::{Error, ForwardError, MessageError, Result};
pub use manager::{ProxyInfo, ProxyManager};
pub use message::{BusMessage, NameOwnerChange};
pub use proxy::{DbusProxy, ForwardResult, ProxyPhase, ProxyStats};
pub use routing::{NameLocation, RoutingTable};
