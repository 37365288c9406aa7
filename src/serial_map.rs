//! Serial number mapping for correlating D-Bus replies.
//!
//! When forwarding a call to the other bus, the proxy re-issues it under a
//! serial of its own. Replies on that bus reference that serial, so the
//! pending call is keyed by (bus, forwarded serial) and carries the
//! completion handle the forwarding task is waiting on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::warn;

use crate::message::BusMessage;
use crate::routing::NameLocation;

/// First serial handed out by [`SerialGenerator`].
///
/// zbus stamps every message it builds from one process-wide counter that
/// starts at 1 and is shared by all connections. Forwarded serials live in
/// the upper half, which that counter would need two billion messages to
/// reach.
pub const FORWARD_SERIAL_BASE: u32 = 0x8000_0000;

/// Information about a pending forwarded call.
#[derive(Debug)]
pub struct PendingCall {
    /// The serial the original caller used.
    pub original_serial: u32,
    /// The bus the original call came from.
    pub origin: NameLocation,
    /// When the call was forwarded.
    pub timestamp: Instant,
    /// Resolved exactly once with the reply; dropping it cancels the call.
    reply_tx: oneshot::Sender<BusMessage>,
}

/// What is left of a pending call once its reply was delivered.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedCall {
    pub original_serial: u32,
    pub origin: NameLocation,
    /// Time between forwarding and the reply.
    pub elapsed: Duration,
}

/// Key for looking up pending calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialKey {
    /// Which bus the message was forwarded to.
    pub target: NameLocation,
    /// The serial number used on that bus.
    pub serial: u32,
}

impl SerialKey {
    /// Create a new serial key.
    pub fn new(target: NameLocation, serial: u32) -> Self {
        Self { target, serial }
    }
}

/// Maps forwarded serial numbers to the callers waiting for their replies.
#[derive(Debug, Default)]
pub struct SerialMap {
    pending: HashMap<SerialKey, PendingCall>,
}

impl SerialMap {
    /// Create an empty serial map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending call and return the receiver its reply arrives on.
    ///
    /// A call already pending under `key` is cancelled; callers pick keys
    /// with [`SerialGenerator::next_unused`] so this does not happen.
    ///
    /// # Arguments
    /// * `key` - The bus and serial the call was forwarded under.
    /// * `original_serial` - The serial number the caller used.
    /// * `origin` - The bus the call came from.
    pub fn insert(
        &mut self,
        key: SerialKey,
        original_serial: u32,
        origin: NameLocation,
    ) -> oneshot::Receiver<BusMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let displaced = self.pending.insert(
            key,
            PendingCall {
                original_serial,
                origin,
                timestamp: Instant::now(),
                reply_tx,
            },
        );
        if let Some(old) = displaced {
            warn!(
                bus = %key.target,
                serial = key.serial,
                original_serial = old.original_serial,
                "Replaced a pending call with the same serial"
            );
        }
        reply_rx
    }

    /// Resolve the pending call a reply belongs to.
    ///
    /// Returns the resolved call, or `None` if no call was waiting for this
    /// key (a reply to someone else, or a late duplicate).
    pub fn resolve(&mut self, key: SerialKey, reply: BusMessage) -> Option<ResolvedCall> {
        let PendingCall {
            original_serial,
            origin,
            timestamp,
            reply_tx,
        } = self.pending.remove(&key)?;
        // The forwarding task may have given up already; that is fine.
        let _ = reply_tx.send(reply);
        Some(ResolvedCall {
            original_serial,
            origin,
            elapsed: timestamp.elapsed(),
        })
    }

    /// Remove a pending call without resolving it.
    pub fn remove(&mut self, key: SerialKey) -> Option<PendingCall> {
        self.pending.remove(&key)
    }

    /// Whether a call is waiting for this key.
    pub fn contains(&self, key: SerialKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Cancel every pending call.
    ///
    /// Dropping the senders wakes each waiting forward with a cancellation.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Get the number of pending calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are no pending calls.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Generator for forwarded serial numbers.
///
/// Private to the proxy; never compared against either connection's own
/// numbering.
#[derive(Debug)]
pub struct SerialGenerator {
    next: u32,
}

impl Default for SerialGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialGenerator {
    /// Create a new serial generator.
    pub fn new() -> Self {
        Self {
            next: FORWARD_SERIAL_BASE,
        }
    }

    /// Get the next serial number.
    ///
    /// Serial numbers wrap back to the base after u32::MAX.
    pub fn next(&mut self) -> u32 {
        let serial = self.next;
        self.next = if serial == u32::MAX {
            FORWARD_SERIAL_BASE
        } else {
            serial + 1
        };
        serial
    }

    /// Next serial with no call pending under it on `target`.
    ///
    /// After the counter wraps, serials of calls still waiting for a reply
    /// are skipped.
    pub fn next_unused(&mut self, target: NameLocation, pending: &SerialMap) -> SerialKey {
        loop {
            let key = SerialKey::new(target, self.next());
            if !pending.contains(key) {
                return key;
            }
        }
    }
}
