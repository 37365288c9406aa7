//! The container/host D-Bus proxy.
//!
//! A proxy holds one connection to the container's private bus and one to
//! the host session bus. It keeps a routing table of well-known names in
//! sync with both buses, and forwards method calls across under serials of
//! its own, correlating the replies back to the waiting caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bus_connection::{BusLink, Connector, ZbusConnector};
use crate::config::ProxyConfig;
use crate::error::{Error, ForwardError, Result};
use crate::message::{daemon, BusMessage, NameOwnerChange};
use crate::routing::{NameChangeOutcome, NameLocation, RoutingTable};
use crate::serial_map::{SerialGenerator, SerialKey, SerialMap};

/// Result of forwarding one call.
///
/// `Ok(None)` means the call was sent with NO_REPLY_EXPECTED and nothing
/// was waited for.
pub type ForwardResult = std::result::Result<Option<BusMessage>, ForwardError>;

/// Lifecycle phase of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Point-in-time counters for a proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    /// Well-known names routed to the container bus.
    pub local_name_count: usize,
    /// Well-known names routed to the host bus.
    pub host_name_count: usize,
    /// Names the host bus can activate.
    pub host_activatable_count: usize,
    /// Names the container bus can activate.
    pub local_activatable_count: usize,
    /// Forwarded calls still waiting for a reply.
    pub pending_call_count: usize,
}

/// Broadcast to `run()` and the dispatch loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSignal {
    Active,
    Stopped,
    BusLost(NameLocation),
}

/// Mutable state shared by the dispatch loops and forwarding callers.
#[derive(Debug, Default)]
struct ProxyState {
    routes: RoutingTable,
    pending: SerialMap,
    serials: SerialGenerator,
    /// Bumped on every start and stop; detached lookups from an older
    /// session compare against it before writing.
    epoch: u64,
}

struct BusPair {
    local: Arc<dyn BusLink>,
    host: Arc<dyn BusLink>,
}

impl BusPair {
    fn get(&self, side: NameLocation) -> &Arc<dyn BusLink> {
        match side {
            NameLocation::Local => &self.local,
            NameLocation::Host => &self.host,
        }
    }

    async fn disconnect(&self) {
        self.host.disconnect().await;
        self.local.disconnect().await;
    }
}

struct Shared {
    state: Mutex<ProxyState>,
    links: Mutex<Option<BusPair>>,
    phase: Mutex<ProxyPhase>,
    signal: watch::Sender<RunSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    call_timeout: Duration,
}

/// Lock a std mutex, ignoring poisoning; no critical section here can
/// leave the data half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The D-Bus proxy for one container.
pub struct DbusProxy {
    config: ProxyConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl DbusProxy {
    /// Create a proxy that connects real buses.
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_connector(config, Arc::new(ZbusConnector))
    }

    /// Create a proxy that opens its connections through `connector`.
    pub fn with_connector(config: ProxyConfig, connector: Arc<dyn Connector>) -> Self {
        let (signal, _) = watch::channel(RunSignal::Stopped);
        let shared = Arc::new(Shared {
            state: Mutex::new(ProxyState::default()),
            links: Mutex::new(None),
            phase: Mutex::new(ProxyPhase::Uninitialized),
            signal,
            tasks: Mutex::new(Vec::new()),
            call_timeout: config.call_timeout,
        });

        Self {
            config,
            connector,
            shared,
        }
    }

    /// The configuration this proxy was created with.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ProxyPhase {
        *lock(&self.shared.phase)
    }

    /// Whether both buses are connected and messages are being dispatched.
    pub fn is_running(&self) -> bool {
        self.phase() == ProxyPhase::Running
    }

    /// Connect both buses, seed the routing table and start dispatching.
    ///
    /// Fails with [`Error::AlreadyStarted`] unless the proxy is new or
    /// stopped. On any other failure everything opened so far is closed
    /// and the proxy is left stopped.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        {
            let mut phase = lock(&self.shared.phase);
            match *phase {
                ProxyPhase::Uninitialized | ProxyPhase::Stopped => *phase = ProxyPhase::Starting,
                current => {
                    warn!(phase = ?current, "Proxy is already active");
                    return Err(Error::AlreadyStarted);
                }
            }
        }

        info!(
            container_bus = %self.config.container_bus_address,
            host_bus = ?self.config.host_bus_address,
            "Starting D-Bus proxy"
        );

        let pair = match self.connect_and_seed().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Failed to start D-Bus proxy");
                self.shared.reset_state();
                *lock(&self.shared.phase) = ProxyPhase::Stopped;
                return Err(e);
            }
        };

        if let Err(pair) = self.activate(pair) {
            info!("Proxy stopped during startup");
            pair.disconnect().await;
            self.shared.reset_state();
            *lock(&self.shared.phase) = ProxyPhase::Stopped;
            return Err(Error::ConnectionClosed("proxy stopped during startup".into()));
        }

        let stats = self.get_stats();
        info!(
            local_names = stats.local_name_count,
            host_names = stats.host_name_count,
            host_activatable = stats.host_activatable_count,
            local_activatable = stats.local_activatable_count,
            "D-Bus proxy started"
        );
        Ok(())
    }

    /// Publish the connections and spawn the dispatch loops.
    ///
    /// Hands the pair back if the proxy left `Starting` in the meantime.
    fn activate(&self, pair: BusPair) -> std::result::Result<(), BusPair> {
        let mut phase = lock(&self.shared.phase);
        if *phase != ProxyPhase::Starting {
            return Err(pair);
        }

        self.shared.signal.send_replace(RunSignal::Active);
        let local = pair.local.clone();
        let host = pair.host.clone();
        *lock(&self.shared.links) = Some(pair);

        let mut tasks = lock(&self.shared.tasks);
        tasks.push(tokio::spawn(dispatch_loop(
            self.shared.clone(),
            NameLocation::Local,
            local,
            self.shared.signal.subscribe(),
        )));
        tasks.push(tokio::spawn(dispatch_loop(
            self.shared.clone(),
            NameLocation::Host,
            host,
            self.shared.signal.subscribe(),
        )));
        *phase = ProxyPhase::Running;
        Ok(())
    }

    async fn connect_and_seed(&self) -> Result<BusPair> {
        let host_address = self.config.host_address();
        let host = self
            .connector
            .connect(NameLocation::Host, host_address.as_deref())
            .await?;

        let local = match self
            .connector
            .connect(NameLocation::Local, Some(&self.config.container_bus_address))
            .await
        {
            Ok(local) => local,
            Err(e) => {
                host.disconnect().await;
                return Err(e);
            }
        };

        let pair = BusPair { local, host };
        if let Err(e) = self.seed(&pair).await {
            pair.disconnect().await;
            return Err(e);
        }
        Ok(pair)
    }

    /// Sync the routing table from current bus state and subscribe to
    /// ownership changes.
    ///
    /// Nothing is written if the proxy left `Starting` while the names were
    /// being listed.
    async fn seed(&self, pair: &BusPair) -> Result<()> {
        let host_names = pair.host.list_names().await?;
        let host_activatable = pair.host.list_activatable_names().await?;
        let local_names = pair.local.list_names().await?;
        let local_activatable = pair.local.list_activatable_names().await?;

        {
            let phase = lock(&self.shared.phase);
            if *phase != ProxyPhase::Starting {
                return Err(Error::ConnectionClosed("proxy stopped during startup".into()));
            }
            let mut state = lock(&self.shared.state);
            let epoch = state.epoch + 1;
            *state = ProxyState {
                epoch,
                ..ProxyState::default()
            };
            state
                .routes
                .seed(host_names, local_names, host_activatable, local_activatable);
        }
        debug!("Routing table synchronized");

        pair.host.add_match(daemon::NAME_OWNER_CHANGED_RULE).await?;
        pair.local.add_match(daemon::NAME_OWNER_CHANGED_RULE).await?;
        Ok(())
    }

    /// Wait until the proxy is stopped or loses a bus.
    ///
    /// Returns `Ok(())` after [`stop`](Self::stop) and
    /// [`Error::ConnectionClosed`] if either bus went away.
    pub async fn run(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotStarted);
        }

        let mut signal = self.shared.signal.subscribe();
        loop {
            let current = *signal.borrow_and_update();
            match current {
                RunSignal::Active => {}
                RunSignal::Stopped => return Ok(()),
                RunSignal::BusLost(side) => {
                    return Err(Error::ConnectionClosed(format!("{side} bus")));
                }
            }
            if signal.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Stop dispatching, fail pending calls and close both connections.
    ///
    /// Safe to call any number of times. A stop during startup leaves the
    /// proxy `Stopping` until the pending `start()` has closed what it
    /// opened.
    pub async fn stop(&self) {
        let previous = {
            let mut phase = lock(&self.shared.phase);
            match *phase {
                ProxyPhase::Uninitialized | ProxyPhase::Stopped | ProxyPhase::Stopping => {
                    trace!(phase = ?*phase, "Proxy not active; nothing to stop");
                    return;
                }
                current => {
                    *phase = ProxyPhase::Stopping;
                    current
                }
            }
        };

        info!("Stopping D-Bus proxy");
        self.shared.signal.send_replace(RunSignal::Stopped);
        self.shared.reset_state();

        if previous == ProxyPhase::Starting {
            return;
        }
        self.shared.teardown().await;
        info!("D-Bus proxy stopped");
    }

    /// Current counters.
    pub fn get_stats(&self) -> ProxyStats {
        let state = lock(&self.shared.state);
        ProxyStats {
            local_name_count: state.routes.local_name_count(),
            host_name_count: state.routes.host_name_count(),
            host_activatable_count: state.routes.host_activatable_count(),
            local_activatable_count: state.routes.local_activatable_count(),
            pending_call_count: state.pending.len(),
        }
    }

    /// Which bus a call to `destination` should go to.
    ///
    /// `None` for empty and unique destinations, which never cross buses.
    pub fn route_for(&self, destination: Option<&str>) -> Option<NameLocation> {
        lock(&self.shared.state).routes.route_for(destination)
    }

    /// Forward a container-originated call to the host bus.
    pub async fn forward_to_host(&self, msg: &BusMessage) -> ForwardResult {
        self.forward_to(NameLocation::Host, msg).await
    }

    /// Forward a host-originated call to the container bus.
    pub async fn forward_to_local(&self, msg: &BusMessage) -> ForwardResult {
        self.forward_to(NameLocation::Local, msg).await
    }

    /// Forward a call to whichever bus owns its destination.
    pub async fn forward(&self, msg: &BusMessage) -> ForwardResult {
        let target = self
            .route_for(msg.destination())
            .ok_or_else(|| ForwardError::NoRoute(msg.destination().map(str::to_string)))?;
        self.forward_to(target, msg).await
    }

    async fn forward_to(&self, target: NameLocation, msg: &BusMessage) -> ForwardResult {
        if !msg.is_method_call() {
            return Err(ForwardError::NotACall);
        }
        let link = self
            .shared
            .link(target)
            .ok_or(ForwardError::NotConnected(target))?;

        let no_reply = msg.no_reply_expected();
        let (key, reply_rx) = {
            let mut state = lock(&self.shared.state);
            let ProxyState { pending, serials, .. } = &mut *state;
            let key = serials.next_unused(target, pending);
            let reply_rx = (!no_reply).then(|| pending.insert(key, msg.serial(), target.other()));
            (key, reply_rx)
        };

        let forwarded = match msg.forwarded(key.serial) {
            Ok(forwarded) => forwarded,
            Err(e) => {
                lock(&self.shared.state).pending.remove(key);
                warn!(bus = %target, error = %e, "Failed to re-frame method call");
                return Err(ForwardError::Reframe(e.to_string()));
            }
        };
        debug!(
            bus = %target,
            original_serial = msg.serial(),
            forwarded_serial = key.serial,
            destination = ?msg.destination(),
            interface = ?msg.interface(),
            member = ?msg.member(),
            fds = msg.fd_count(),
            "Forwarding method call"
        );

        if let Err(e) = link.send(&forwarded).await {
            lock(&self.shared.state).pending.remove(key);
            warn!(bus = %target, error = %e, "Failed to forward method call");
            return Err(ForwardError::Send(e.to_string()));
        }

        let Some(reply_rx) = reply_rx else {
            return Ok(None);
        };

        match tokio::time::timeout(self.shared.call_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(ForwardError::Cancelled),
            Err(_) => {
                lock(&self.shared.state).pending.remove(key);
                warn!(
                    bus = %target,
                    forwarded_serial = key.serial,
                    member = ?msg.member(),
                    "Forwarded call timed out"
                );
                Err(ForwardError::NoReply(self.shared.call_timeout))
            }
        }
    }
}

impl Drop for DbusProxy {
    fn drop(&mut self) {
        self.shared.signal.send_replace(RunSignal::Stopped);
        for task in lock(&self.shared.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Shared {
    fn link(&self, side: NameLocation) -> Option<Arc<dyn BusLink>> {
        lock(&self.links).as_ref().map(|pair| pair.get(side).clone())
    }

    /// Act on ownership changes and on replies to forwarded calls; every
    /// other message is left alone.
    fn handle_message(self: &Arc<Self>, side: NameLocation, msg: BusMessage) {
        trace!(
            bus = %side,
            msg_type = ?msg.kind(),
            serial = msg.serial(),
            reply_serial = ?msg.reply_serial(),
            sender = ?msg.sender(),
            destination = ?msg.destination(),
            member = ?msg.member(),
            "Received message from bus"
        );

        if msg.is_name_owner_changed() {
            match msg.name_owner_change() {
                Ok(change) => self.apply_name_change(side, change),
                Err(e) => warn!(bus = %side, error = %e, "Ignoring malformed NameOwnerChanged"),
            }
            return;
        }

        let (true, Some(reply_serial)) = (msg.is_reply(), msg.reply_serial()) else {
            return;
        };
        let kind = msg.kind();
        let key = SerialKey::new(side, reply_serial);
        let resolved = lock(&self.state).pending.resolve(key, msg);
        if let Some(call) = resolved {
            debug!(
                bus = %side,
                msg_type = ?kind,
                forwarded_serial = reply_serial,
                original_serial = call.original_serial,
                origin = %call.origin,
                elapsed_ms = call.elapsed.as_millis() as u64,
                "Delivered reply to forwarded call"
            );
        }
    }

    /// Drop routes and fail every pending call.
    fn reset_state(&self) {
        let cancelled = {
            let mut state = lock(&self.state);
            state.epoch += 1;
            state.routes.clear();
            state.pending.cancel_all()
        };
        if cancelled > 0 {
            debug!(count = cancelled, "Cancelled pending calls");
        }
    }

    /// Stop the dispatch loops, close both connections and mark the proxy
    /// stopped.
    async fn teardown(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }

        let pair = lock(&self.links).take();
        if let Some(pair) = pair {
            pair.disconnect().await;
        }

        *lock(&self.phase) = ProxyPhase::Stopped;
    }

    /// React to one bus going away while running: wake `run()` with the
    /// loss and wind the proxy down.
    fn on_bus_lost(self: &Arc<Self>, side: NameLocation) {
        {
            let mut phase = lock(&self.phase);
            if *phase != ProxyPhase::Running {
                return;
            }
            *phase = ProxyPhase::Stopping;
        }

        error!(bus = %side, "Bus connection closed unexpectedly");
        self.signal.send_replace(RunSignal::BusLost(side));
        self.reset_state();

        let shared = self.clone();
        tokio::spawn(async move {
            shared.teardown().await;
            info!(bus = %side, "D-Bus proxy stopped after bus loss");
        });
    }

    fn apply_name_change(self: &Arc<Self>, side: NameLocation, change: NameOwnerChange) {
        debug!(
            bus = %side,
            name = %change.name,
            old_owner = %change.old_owner,
            new_owner = %change.new_owner,
            "Name owner changed"
        );

        let (outcome, epoch) = {
            let mut state = lock(&self.state);
            let outcome = match side {
                NameLocation::Host => state
                    .routes
                    .on_host_name_change(&change.name, &change.new_owner),
                NameLocation::Local => state
                    .routes
                    .on_local_name_change(&change.name, &change.new_owner),
            };
            (outcome, state.epoch)
        };

        if let NameChangeOutcome::RecheckHost(name) = outcome {
            if let Some(host) = self.link(NameLocation::Host) {
                tokio::spawn(recheck_host_owner(self.clone(), host, name, epoch));
            }
        }
    }
}

/// After the container releases a name, route it to the host again if the
/// host still has an owner for it.
async fn recheck_host_owner(
    shared: Arc<Shared>,
    host: Arc<dyn BusLink>,
    name: String,
    epoch: u64,
) {
    match host.get_name_owner(&name).await {
        Ok(Some(owner)) => {
            let mut state = lock(&shared.state);
            if state.epoch != epoch {
                return;
            }
            if state.routes.record_host_owner(&name) {
                debug!(name = %name, owner = %owner, "Name falls back to host owner");
            }
        }
        Ok(None) => trace!(name = %name, "Name has no owner on host"),
        Err(e) => debug!(name = %name, error = %e, "Host owner lookup failed"),
    }
}

/// Receive and dispatch messages from one bus until stopped.
async fn dispatch_loop(
    shared: Arc<Shared>,
    side: NameLocation,
    link: Arc<dyn BusLink>,
    mut signal: watch::Receiver<RunSignal>,
) {
    debug!(bus = %side, "Dispatch loop started");

    loop {
        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() || *signal.borrow() != RunSignal::Active {
                    break;
                }
            }
            msg = link.recv() => match msg {
                Some(msg) => shared.handle_message(side, msg),
                None => {
                    shared.on_bus_lost(side);
                    break;
                }
            }
        }
    }

    debug!(bus = %side, "Dispatch loop exiting");
}
