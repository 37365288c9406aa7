//! D-Bus message utilities.
//!
//! [`BusMessage`] pairs a `zbus::Message`, which carries the body and file
//! descriptors untouched, with the header fields the proxy routes on.

use std::os::fd::AsFd;

use zbus::message::{Body, Flags, Message, Type as MessageType};
use zbus::zvariant::serialized::{Context, Data};
use zbus::zvariant::{Endian, OwnedFd};

use crate::error::{MessageError, Result};

/// Well-known name, object path and interface of the bus daemon.
pub mod daemon {
    pub const NAME: &str = "org.freedesktop.DBus";
    pub const PATH: &str = "/org/freedesktop/DBus";
    pub const INTERFACE: &str = "org.freedesktop.DBus";

    /// Match rule for ownership changes announced by the daemon.
    pub const NAME_OWNER_CHANGED_RULE: &str = "type='signal',sender='org.freedesktop.DBus',\
         interface='org.freedesktop.DBus',member='NameOwnerChanged'";
}

/// Common D-Bus error names.
pub mod error_names {
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
}

/// Offset of the serial in the fixed message header.
const SERIAL_OFFSET: usize = 8;

/// A D-Bus message as seen by the proxy.
///
/// Header fields are read once when the message is wrapped; the payload
/// stays in the wrapped `zbus::Message`.
#[derive(Debug, Clone)]
pub struct BusMessage {
    kind: MessageType,
    serial: u32,
    reply_serial: Option<u32>,
    no_reply_expected: bool,
    sender: Option<String>,
    destination: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    message: Message,
}

/// Ownership change announced by `NameOwnerChanged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOwnerChange {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

impl From<Message> for BusMessage {
    fn from(message: Message) -> Self {
        let (kind, reply_serial, sender, destination, path, interface, member, error_name) = {
            let header = message.header();
            (
                header.message_type(),
                header.reply_serial().map(|n| n.get()),
                header.sender().map(|n| n.to_string()),
                header.destination().map(|n| n.to_string()),
                header.path().map(|p| p.to_string()),
                header.interface().map(|i| i.to_string()),
                header.member().map(|m| m.to_string()),
                header.error_name().map(|e| e.to_string()),
            )
        };
        let serial = message.primary_header().serial_num().get();
        let no_reply_expected = message
            .primary_header()
            .flags()
            .contains(Flags::NoReplyExpected);

        Self {
            kind,
            serial,
            reply_serial,
            no_reply_expected,
            sender,
            destination,
            path,
            interface,
            member,
            error_name,
            message,
        }
    }
}

impl BusMessage {
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// The wrapped zbus message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The message body.
    pub fn body(&self) -> Body {
        self.message.body()
    }

    /// The body signature, empty for a message without a body.
    pub fn signature(&self) -> String {
        self.message
            .header()
            .signature()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default()
    }

    /// Number of file descriptors attached to the message.
    pub fn fd_count(&self) -> usize {
        self.message.data().fds().len()
    }

    pub fn is_method_call(&self) -> bool {
        self.kind == MessageType::MethodCall
    }

    /// Method return or error.
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::MethodReturn | MessageType::Error)
    }

    pub fn is_signal(&self) -> bool {
        self.kind == MessageType::Signal
    }

    /// Whether the sender asked not to get a reply.
    pub fn no_reply_expected(&self) -> bool {
        self.no_reply_expected
    }

    /// Check if this is a NameOwnerChanged signal from the bus daemon.
    ///
    /// Messages with a sender other than the daemon are not accepted, so a
    /// peer cannot spoof ownership changes.
    pub fn is_name_owner_changed(&self) -> bool {
        self.is_signal()
            && self.interface() == Some(daemon::INTERFACE)
            && self.member() == Some("NameOwnerChanged")
            && self.sender().map_or(true, |s| s == daemon::NAME)
    }

    /// Parse a NameOwnerChanged signal body.
    ///
    /// Empty owners mean the name was acquired (old) or released (new).
    pub fn name_owner_change(&self) -> Result<NameOwnerChange> {
        let body = self.body();
        let (name, old_owner, new_owner): (String, String, String) = body
            .deserialize()
            .map_err(|e| MessageError::DeserializeFailed(e.to_string()))?;

        Ok(NameOwnerChange {
            name,
            old_owner,
            new_owner,
        })
    }

    /// Copy this call for re-emission on the other bus under `serial`.
    ///
    /// Addressing, flags, byte order, the body bytes and file descriptors
    /// are kept. The sender is dropped because the target bus fills it in.
    pub fn forwarded(&self, serial: u32) -> Result<Self> {
        if serial == 0 {
            return Err(MessageError::InvalidSerial.into());
        }
        if !self.is_method_call() {
            return Err(MessageError::UnexpectedType(self.kind).into());
        }
        let path = self
            .path()
            .ok_or_else(|| MessageError::MissingHeader("path".into()))?;
        let member = self
            .member()
            .ok_or_else(|| MessageError::MissingHeader("member".into()))?;

        let endian = self.message.data().context().endian();
        let mut builder = Message::method(path, member)?.endian(endian);
        if let Some(destination) = self.destination() {
            builder = builder.destination(destination)?;
        }
        if let Some(interface) = self.interface() {
            builder = builder.interface(interface)?;
        }
        for flag in self.message.primary_header().flags().iter() {
            builder = builder.with_flags(flag)?;
        }

        // The builder strips one pair of parentheses from a signature that
        // starts with a struct, so the body signature goes in wrapped.
        let signature = self.signature();
        let signature = if signature.is_empty() {
            signature
        } else {
            format!("({signature})")
        };

        let body = self.message.body();
        let fds = dup_fds(body.data())?;
        // SAFETY: the bytes are the body of a well-formed message with this
        // signature, byte order and set of file descriptors.
        let rebuilt =
            unsafe { builder.build_raw_body(body.data().bytes(), signature.as_str(), fds)? };

        let message = with_serial(&rebuilt, serial)?;
        Ok(message.into())
    }
}

/// Duplicate the descriptors referenced by `data`.
fn dup_fds(data: &Data<'_, '_>) -> Result<Vec<OwnedFd>> {
    let mut fds = Vec::with_capacity(data.fds().len());
    for fd in data.fds() {
        fds.push(fd.as_fd().try_clone_to_owned()?.into());
    }
    Ok(fds)
}

/// Re-frame `message` with its serial replaced.
///
/// zbus stamps every message it builds from a process-wide counter, so the
/// serial is written into the fixed header afterwards.
fn with_serial(message: &Message, serial: u32) -> Result<Message> {
    let data = message.data();
    let endian = data.context().endian();
    let mut bytes = data.bytes().to_vec();
    let encoded = match endian {
        Endian::Little => serial.to_le_bytes(),
        Endian::Big => serial.to_be_bytes(),
    };
    bytes
        .get_mut(SERIAL_OFFSET..SERIAL_OFFSET + 4)
        .ok_or(MessageError::InvalidSerial)?
        .copy_from_slice(&encoded);

    let fds = dup_fds(data)?;
    let data = Data::new_fds(bytes, Context::new_dbus(endian, 0), fds);
    // SAFETY: only the serial of a message zbus just built was changed.
    let message = unsafe { Message::from_bytes(data)? };
    Ok(message)
}
