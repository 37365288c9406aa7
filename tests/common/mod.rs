//! In-memory buses for driving the proxy without a dbus-daemon.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use zbus::message::Builder;
use zbus::zvariant::DynamicType;
use zbus::Message;

use kapsule_dbus_proxy::bus_connection::{BusLink, Connector};
use kapsule_dbus_proxy::message::daemon;
use kapsule_dbus_proxy::{BusMessage, Error, NameLocation, Result};

type Responder = Box<dyn Fn(&BusMessage) -> Option<BusMessage> + Send + Sync>;

/// What a mock bus reports at connect time.
#[derive(Debug, Clone, Default)]
pub struct MockSpec {
    pub names: Vec<String>,
    pub activatable: Vec<String>,
    /// Answers for GetNameOwner: well-known name to unique owner.
    pub owners: Vec<(String, String)>,
}

impl MockSpec {
    pub fn names(names: &[&str]) -> Self {
        Self {
            names: strings(names),
            ..Self::default()
        }
    }

    pub fn with_activatable(mut self, names: &[&str]) -> Self {
        self.activatable = strings(names);
        self
    }

    pub fn with_owner(mut self, name: &str, owner: &str) -> Self {
        self.owners.push((name.to_string(), owner.to_string()));
        self
    }
}

pub fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// =============================================================================
// Messages
// =============================================================================

/// A method call as the client `:1.5` would make it, ready for a body.
pub fn call_to<'a>(destination: &'a str, member: &'a str) -> Builder<'a> {
    Message::method("/org/example/Object", member)
        .unwrap()
        .destination(destination)
        .unwrap()
        .interface("org.example.Iface")
        .unwrap()
        .sender(":1.5")
        .unwrap()
}

/// A method call without arguments.
pub fn call(destination: &str, member: &str) -> BusMessage {
    call_to(destination, member).build(&()).unwrap().into()
}

/// A method return for `call`, sent by `:1.9`.
pub fn reply_to<B>(call: &BusMessage, body: &B) -> BusMessage
where
    B: Serialize + DynamicType,
{
    Message::method_reply(call.message())
        .unwrap()
        .sender(":1.9")
        .unwrap()
        .build(body)
        .unwrap()
        .into()
}

/// An error reply for `call`.
pub fn error_to(call: &BusMessage, name: &str, text: &str) -> BusMessage {
    Message::method_error(call.message(), name)
        .unwrap()
        .build(&(text,))
        .unwrap()
        .into()
}

/// NameOwnerChanged as `sender` would emit it.
pub fn name_owner_changed_from(sender: &str, name: &str, old_owner: &str, new_owner: &str) -> BusMessage {
    Message::signal(daemon::PATH, daemon::INTERFACE, "NameOwnerChanged")
        .unwrap()
        .sender(sender)
        .unwrap()
        .build(&(name, old_owner, new_owner))
        .unwrap()
        .into()
}

/// NameOwnerChanged as the bus daemon emits it.
pub fn name_owner_changed(name: &str, old_owner: &str, new_owner: &str) -> BusMessage {
    name_owner_changed_from(daemon::NAME, name, old_owner, new_owner)
}

// =============================================================================
// Buses
// =============================================================================

/// One side of the proxy: records what is sent, replays what is injected.
pub struct MockBus {
    side: NameLocation,
    names: Vec<String>,
    activatable: Vec<String>,
    owners: Mutex<HashMap<String, String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<BusMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusMessage>>,
    sent: Mutex<Vec<BusMessage>>,
    match_rules: Mutex<Vec<String>>,
    responder: Mutex<Option<Responder>>,
    owner_lookups: AtomicUsize,
    fail_send: AtomicBool,
    disconnected: AtomicBool,
    /// Name listings wait for a permit here when set.
    gate: Option<Arc<Semaphore>>,
}

impl MockBus {
    pub fn new(side: NameLocation, spec: &MockSpec, gate: Option<Arc<Semaphore>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            side,
            names: spec.names.clone(),
            activatable: spec.activatable.clone(),
            owners: Mutex::new(spec.owners.iter().cloned().collect()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            match_rules: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            owner_lookups: AtomicUsize::new(0),
            fail_send: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            gate,
        }
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
    }

    /// Deliver a message as if the bus had sent it.
    pub fn inject(&self, msg: BusMessage) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Drop the connection from the bus side.
    pub fn close(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    /// Answer every sent message with whatever `f` returns.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&BusMessage) -> Option<BusMessage> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_owner(&self, name: &str, owner: &str) {
        self.owners
            .lock()
            .unwrap()
            .insert(name.to_string(), owner.to_string());
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<BusMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn match_rules(&self) -> Vec<String> {
        self.match_rules.lock().unwrap().clone()
    }

    pub fn owner_lookups(&self) -> usize {
        self.owner_lookups.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusLink for MockBus {
    fn name(&self) -> &str {
        match self.side {
            NameLocation::Local => "mock-local",
            NameLocation::Host => "mock-host",
        }
    }

    async fn send(&self, msg: &BusMessage) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed(format!("{} send refused", self.side)));
        }
        self.sent.lock().unwrap().push(msg.clone());

        let reply = self
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|respond| respond(msg));
        if let Some(reply) = reply {
            self.inject(reply);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<BusMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        self.pass_gate().await;
        Ok(self.names.clone())
    }

    async fn list_activatable_names(&self) -> Result<Vec<String>> {
        self.pass_gate().await;
        Ok(self.activatable.clone())
    }

    async fn add_match(&self, rule: &str) -> Result<()> {
        self.match_rules.lock().unwrap().push(rule.to_string());
        Ok(())
    }

    async fn get_name_owner(&self, name: &str) -> Result<Option<String>> {
        self.owner_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.owners.lock().unwrap().get(name).cloned())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.close();
    }
}

/// Hands out a fresh [`MockBus`] per connection and remembers them.
pub struct MockConnector {
    local: MockSpec,
    host: MockSpec,
    fail: Mutex<Option<NameLocation>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    created: Mutex<Vec<(NameLocation, Option<String>, Arc<MockBus>)>>,
}

impl MockConnector {
    pub fn new(local: MockSpec, host: MockSpec) -> Arc<Self> {
        Arc::new(Self {
            local,
            host,
            fail: Mutex::new(None),
            gate: Mutex::new(None),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Make connections to `side` fail.
    pub fn fail_on(&self, side: Option<NameLocation>) {
        *self.fail.lock().unwrap() = side;
    }

    /// Hold name listings on buses opened from now on until the returned
    /// semaphore gets a permit.
    pub fn hold_listings(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// The most recent bus opened for `side`.
    pub fn bus(&self, side: NameLocation) -> Arc<MockBus> {
        self.buses(side)
            .pop()
            .unwrap_or_else(|| panic!("no {side} bus was connected"))
    }

    pub fn buses(&self, side: NameLocation) -> Vec<Arc<MockBus>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == side)
            .map(|(_, _, bus)| bus.clone())
            .collect()
    }

    pub fn addresses(&self, side: NameLocation) -> Vec<Option<String>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == side)
            .map(|(_, addr, _)| addr.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, side: NameLocation, address: Option<&str>) -> Result<Arc<dyn BusLink>> {
        if *self.fail.lock().unwrap() == Some(side) {
            return Err(Error::ConnectionClosed(format!("{side} bus unreachable")));
        }

        let spec = match side {
            NameLocation::Local => &self.local,
            NameLocation::Host => &self.host,
        };
        let gate = self.gate.lock().unwrap().clone();
        let bus = Arc::new(MockBus::new(side, spec, gate));
        self.created
            .lock()
            .unwrap()
            .push((side, address.map(str::to_string), bus.clone()));
        let link: Arc<dyn BusLink> = bus;
        Ok(link)
    }
}

/// Poll `cond` until it holds, panicking after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Wait until `bus` has seen `count` messages and return them.
pub async fn wait_for_sent(bus: &MockBus, count: usize) -> Vec<BusMessage> {
    wait_until(|| bus.sent().len() >= count).await;
    bus.sent()
}
