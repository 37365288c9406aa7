//! D-Bus connection management.
//!
//! The proxy talks to each bus through the [`BusLink`] trait. The production
//! implementation, [`BusConnection`], wraps a zbus connection; tests plug in
//! in-memory links instead.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use zbus::connection::Builder as ConnectionBuilder;
use zbus::{Connection, Message, MessageStream};

use crate::error::Result;
use crate::message::{daemon, error_names, BusMessage};
use crate::routing::NameLocation;

/// One live connection to a message bus.
#[async_trait]
pub trait BusLink: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Send a message with the serial it already carries.
    async fn send(&self, msg: &BusMessage) -> Result<()>;

    /// Receive the next inbound message.
    ///
    /// Returns `None` once the connection is gone.
    async fn recv(&self) -> Option<BusMessage>;

    /// `org.freedesktop.DBus.ListNames`.
    async fn list_names(&self) -> Result<Vec<String>>;

    /// `org.freedesktop.DBus.ListActivatableNames`.
    async fn list_activatable_names(&self) -> Result<Vec<String>>;

    /// `org.freedesktop.DBus.AddMatch`.
    async fn add_match(&self, rule: &str) -> Result<()>;

    /// `org.freedesktop.DBus.GetNameOwner`; `None` if the name has no owner.
    async fn get_name_owner(&self, name: &str) -> Result<Option<String>>;

    /// Close the connection.
    async fn disconnect(&self);
}

/// Opens [`BusLink`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a bus.
    ///
    /// # Arguments
    /// * `side` - Which bus this is; used for logging.
    /// * `address` - The D-Bus address. `None` means the session bus of the
    ///   current process.
    async fn connect(&self, side: NameLocation, address: Option<&str>) -> Result<Arc<dyn BusLink>>;
}

/// Connects real buses through zbus.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZbusConnector;

#[async_trait]
impl Connector for ZbusConnector {
    async fn connect(&self, side: NameLocation, address: Option<&str>) -> Result<Arc<dyn BusLink>> {
        let conn = match address {
            Some(addr) => BusConnection::connect(addr, side.to_string()).await?,
            None => BusConnection::connect_session(side.to_string()).await?,
        };
        let link: Arc<dyn BusLink> = Arc::new(conn);
        Ok(link)
    }
}

/// A connection to a D-Bus bus.
#[derive(Debug)]
pub struct BusConnection {
    /// The underlying zbus connection.
    connection: Connection,
    /// Message stream for receiving messages.
    stream: Mutex<MessageStream>,
    /// Human-readable name for logging.
    name: String,
}

impl BusConnection {
    /// Connect to a D-Bus bus at the given address.
    ///
    /// # Arguments
    /// * `address` - The D-Bus address (e.g., "unix:path=/path/to/socket").
    /// * `name` - A human-readable name for logging.
    pub async fn connect(address: &str, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        info!(address = %address, bus = %name, "Connecting to D-Bus");

        let connection = ConnectionBuilder::address(address)?.build().await?;
        Ok(Self::from_connection(connection, name))
    }

    /// Connect to the session bus of the current process.
    pub async fn connect_session(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        info!(bus = %name, "Connecting to default session bus");

        let connection = Connection::session().await?;
        Ok(Self::from_connection(connection, name))
    }

    fn from_connection(connection: Connection, name: String) -> Self {
        let stream = MessageStream::from(&connection);

        debug!(
            bus = %name,
            unique_name = ?connection.unique_name(),
            "Connected to D-Bus"
        );

        Self {
            connection,
            stream: Mutex::new(stream),
            name,
        }
    }

    async fn call_daemon<B>(&self, member: &str, body: &B) -> zbus::Result<Message>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        self.connection
            .call_method(
                Some(daemon::NAME),
                daemon::PATH,
                Some(daemon::INTERFACE),
                member,
                body,
            )
            .await
    }
}

#[async_trait]
impl BusLink for BusConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: &BusMessage) -> Result<()> {
        self.connection.send(msg.message()).await?;
        trace!(
            bus = %self.name,
            serial = msg.serial(),
            destination = ?msg.destination(),
            member = ?msg.member(),
            "Sent message"
        );
        Ok(())
    }

    async fn recv(&self) -> Option<BusMessage> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(msg)) => return Some(msg.into()),
                Some(Err(e)) => {
                    warn!(bus = %self.name, error = %e, "Error receiving message");
                }
                None => return None,
            }
        }
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let reply: Vec<String> = self.call_daemon("ListNames", &()).await?.body().deserialize()?;

        trace!(bus = %self.name, count = reply.len(), "Listed names");
        Ok(reply)
    }

    async fn list_activatable_names(&self) -> Result<Vec<String>> {
        let reply: Vec<String> = self
            .call_daemon("ListActivatableNames", &())
            .await?
            .body()
            .deserialize()?;

        trace!(bus = %self.name, count = reply.len(), "Listed activatable names");
        Ok(reply)
    }

    async fn add_match(&self, rule: &str) -> Result<()> {
        self.call_daemon("AddMatch", &(rule,)).await?;

        debug!(bus = %self.name, rule = %rule, "Added match rule");
        Ok(())
    }

    async fn get_name_owner(&self, name: &str) -> Result<Option<String>> {
        match self.call_daemon("GetNameOwner", &(name,)).await {
            Ok(reply) => {
                let owner: String = reply.body().deserialize()?;
                Ok(Some(owner))
            }
            Err(zbus::Error::MethodError(err, _, _))
                if err.as_str() == error_names::NAME_HAS_NO_OWNER =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn disconnect(&self) {
        if let Err(e) = self.connection.clone().close().await {
            debug!(bus = %self.name, error = %e, "Error closing connection");
        }
        info!(bus = %self.name, "Disconnected");
    }
}
