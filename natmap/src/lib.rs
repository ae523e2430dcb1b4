//! NAT port mapping orchestrator.
//!
//! Establishes inbound port mappings on residential gateways over NAT-PMP,
//! PCP or UPnP IGD, coordinates multiple simultaneous mappings, keeps them
//! alive as leases run out, and re-establishes them when the host roams to a
//! different network.
//!
//! The entry point is [`Manager`], a cheap clonable handle to a service task
//! that owns the active-mapping table. Mapping attempts fan out across
//! candidate gateways in two waves (known-good and interface-derived routers
//! first, the remaining well-known defaults second) and race within a wave;
//! the first gateway to answer wins.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    adapter::Adapter,
    dispatch::Dispatcher,
    mapping::MappingKey,
    registry::{Entry, Registry},
};

mod adapter;
mod chooser;
mod dispatch;
mod mapping;
mod nat_pmp;
mod pcp;
mod probe;
mod registry;
mod upnp;

mod defaults {
    use std::time::Duration;

    /// Budget for one SSDP search.
    pub(crate) const UPNP_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

    /// Budget for each SOAP control call.
    pub(crate) const UPNP_SOAP_TIMEOUT: Duration = Duration::from_secs(1);

    /// Budget to receive a response from a PCP server.
    pub(crate) const PCP_RECV_TIMEOUT: Duration = Duration::from_secs(2);

    /// Budget to receive a response from a NAT-PMP server.
    pub(crate) const NAT_PMP_RECV_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default period of the public-address sweep.
    pub(crate) const RENEW_INTERVAL: Duration = Duration::from_secs(600);
}

pub use adapter::{AdapterError, Protocol};
pub use mapping::MappingRecord;
pub use probe::{NetworkProbe, SystemProbe};

/// Capacity of the channel to communicate with the service task.
const SERVICE_CHANNEL_CAPACITY: usize = 32; // should be plenty

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Configures the [`Manager`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether the periodic sweep re-checks the public address and re-maps
    /// mappings stranded on an old network.
    pub auto_renew: bool,
    /// Period of the sweep.
    pub renew_interval: Duration,
    /// Adapter priority order for mapping attempts.
    pub adapters: Vec<Protocol>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            auto_renew: true,
            renew_interval: defaults::RENEW_INTERVAL,
            adapters: vec![Protocol::Pmp, Protocol::Upnp],
        }
    }
}

/// Which protocols have probed usable so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("portmap={{ PMP: {pmp}, PCP: {pcp}, UPnP: {upnp} }}")]
pub struct ProbeOutput {
    /// If NAT-PMP probed usable.
    pub pmp: bool,
    /// If PCP probed usable.
    pub pcp: bool,
    /// If UPnP probed usable.
    pub upnp: bool,
}

/// Notifications emitted by the manager.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// A mapping was created or renewed; carries the full record.
    Mapping(MappingRecord),
}

/// Errors surfaced by [`Manager`] operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("service channel is closed")]
    ChannelClosed,
    #[error("no private IPv4 addresses available")]
    NoLocalAddress,
    #[error("every adapter failed")]
    AllAdaptersFailed {
        #[source]
        last: AdapterError,
    },
    #[error("no active mapping for {external_ip}:{external_port}")]
    MappingNotFound {
        external_ip: Ipv4Addr,
        external_port: u16,
    },
    #[error("current public address is unknown")]
    PublicAddressUnknown,
    #[error("adapter failed")]
    Adapter {
        #[from]
        source: AdapterError,
    },
}

/// Handle to the mapping service.
///
/// Cheap to clone. The service task is aborted when the last clone drops;
/// call [`Manager::close`] first to release mappings on their gateways.
#[derive(Debug, Clone)]
pub struct Manager {
    service_tx: mpsc::Sender<Message>,
    events: broadcast::Sender<Event>,
    _service_handle: Arc<AbortOnDropHandle<()>>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Manager {
    /// Creates a manager and spawns its service task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: Config) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe))
    }

    /// Creates a manager that consults a custom [`NetworkProbe`].
    pub fn with_probe(config: Config, network: Arc<dyn NetworkProbe>) -> Self {
        let adapters = config
            .adapters
            .iter()
            .map(|&protocol| build_adapter(protocol))
            .collect();
        Self::with_adapters(config, network, adapters)
    }

    fn with_adapters(
        config: Config,
        network: Arc<dyn NetworkProbe>,
        adapters: Vec<Arc<dyn Adapter>>,
    ) -> Self {
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let service = Service::new(
            config,
            network,
            adapters,
            service_tx.clone(),
            service_rx,
            events.clone(),
        );
        let handle = AbortOnDropHandle::new(tokio::spawn(
            service.run().instrument(info_span!("natmap.service")),
        ));

        Manager {
            service_tx,
            events,
            _service_handle: Arc::new(handle),
        }
    }

    /// Establishes a mapping from `external_port` to `internal_port`.
    ///
    /// `external_port == 0` lets the gateway pick a free port. `lifetime` is
    /// in seconds; `0` requests a mapping refreshed indefinitely. Adapters
    /// are tried in the configured priority order; the call fails only when
    /// every adapter exhausts its gateway candidates.
    pub async fn add_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<MappingRecord, Error> {
        self.request(|result_tx| Message::AddMapping {
            internal_port,
            external_port,
            lifetime,
            result_tx,
        })
        .await?
    }

    /// Deletes the mapping at `(external_ip, external_port)`.
    ///
    /// With no `external_ip` the current public address is used. The registry
    /// entry is removed even when the gateway refuses the release; the error
    /// is still surfaced.
    pub async fn delete_mapping(
        &self,
        external_port: u16,
        external_ip: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        self.request(|result_tx| Message::DeleteMapping {
            external_port,
            external_ip,
            result_tx,
        })
        .await?
    }

    /// Snapshot of the active mappings.
    pub async fn active_mappings(&self) -> Result<Vec<MappingRecord>, Error> {
        self.request(|result_tx| Message::ActiveMappings { result_tx })
            .await
    }

    /// Runs a sweep now, resolving once stranded mappings are re-established.
    pub async fn renew_mappings(&self) -> Result<(), Error> {
        self.request(|result_tx| Message::Renew { result_tx }).await
    }

    /// Which protocols have probed usable so far.
    pub async fn probe_output(&self) -> Result<ProbeOutput, Error> {
        self.request(|result_tx| Message::ProbeSnapshot { result_tx })
            .await
    }

    /// Cancels all timers and releases every active mapping in parallel.
    ///
    /// The manager is unusable afterwards; operations fail with
    /// [`Error::ChannelClosed`].
    pub async fn close(&self) -> Result<(), Error> {
        self.request(|result_tx| Message::Close { result_tx }).await
    }

    /// Subscribes to [`Event`]s emitted on mapping creation and renewal.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(make(result_tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        result_rx.await.map_err(|_| Error::ChannelClosed)
    }
}

fn build_adapter(protocol: Protocol) -> Arc<dyn Adapter> {
    match protocol {
        Protocol::Pmp => Arc::new(nat_pmp::NatPmpAdapter),
        Protocol::Pcp => Arc::new(pcp::PcpAdapter),
        Protocol::Upnp => Arc::new(upnp::UpnpAdapter),
    }
}

#[derive(Debug)]
enum Message {
    AddMapping {
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        result_tx: oneshot::Sender<Result<MappingRecord, Error>>,
    },
    DeleteMapping {
        external_port: u16,
        external_ip: Option<Ipv4Addr>,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteKeyResolved {
        external_port: u16,
        public_ip: Option<Ipv4Addr>,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    ActiveMappings {
        result_tx: oneshot::Sender<Vec<MappingRecord>>,
    },
    ProbeSnapshot {
        result_tx: oneshot::Sender<ProbeOutput>,
    },
    Renew {
        result_tx: oneshot::Sender<()>,
    },
    Close {
        result_tx: oneshot::Sender<()>,
    },
    /// A spawned mapping attempt settled.
    MappingReady {
        outcome: Result<(MappingRecord, Arc<dyn Adapter>), Error>,
        intent: Intent,
    },
    /// A renewal timer ran out.
    RenewDue { key: MappingKey, next_lifetime: u32 },
    /// An expiry timer ran out.
    LeaseElapsed { key: MappingKey },
    /// The sweep's public-address query settled.
    SweepReady { public_ip: Option<Ipv4Addr> },
}

/// Why a mapping attempt was started, deciding where its result goes.
#[derive(Debug)]
enum Intent {
    /// A caller is waiting on the result.
    Fresh {
        result_tx: oneshot::Sender<Result<MappingRecord, Error>>,
    },
    /// Renewal of the entry registered under `key`.
    Renew { key: MappingKey },
    /// Re-establishment after the sweep evicted a stranded mapping.
    Roam,
}

/// Cached probe outcomes per protocol.
///
/// An adapter that probed unusable is skipped on later calls; the cache is
/// cleared when the sweep detects a network change.
#[derive(Debug, Clone, Default)]
struct Availability {
    inner: Arc<Mutex<HashMap<Protocol, bool>>>,
}

impl Availability {
    fn get(&self, protocol: Protocol) -> Option<bool> {
        self.inner.lock().expect("poisoned").get(&protocol).copied()
    }

    fn set(&self, protocol: Protocol, usable: bool) {
        self.inner.lock().expect("poisoned").insert(protocol, usable);
    }

    fn clear(&self) {
        self.inner.lock().expect("poisoned").clear();
    }

    fn output(&self) -> ProbeOutput {
        let inner = self.inner.lock().expect("poisoned");
        let usable = |protocol| inner.get(&protocol).copied().unwrap_or_default();
        ProbeOutput {
            pmp: usable(Protocol::Pmp),
            pcp: usable(Protocol::Pcp),
            upnp: usable(Protocol::Upnp),
        }
    }
}

/// Everything a spawned mapping attempt needs.
#[derive(Debug, Clone)]
struct AttemptCtx {
    adapters: Arc<Vec<Arc<dyn Adapter>>>,
    dispatcher: Dispatcher,
    network: Arc<dyn NetworkProbe>,
    availability: Availability,
}

/// Runs the adapter cascade for one mapping attempt.
///
/// Adapters are tried strictly in priority order; within one adapter the
/// dispatcher races gateway candidates. The error reported when everything
/// fails is the last adapter's.
async fn attempt_mapping(
    ctx: AttemptCtx,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Result<(MappingRecord, Arc<dyn Adapter>), Error> {
    let private_ips = ctx.network.private_ips();
    if private_ips.is_empty() {
        return Err(Error::NoLocalAddress);
    }
    let gateway = ctx.network.gateway_ip();

    let mut last_err: Option<AdapterError> = None;
    for adapter in ctx.adapters.iter() {
        if !adapter_usable(&ctx, adapter.as_ref(), &private_ips, gateway).await {
            trace!(protocol = %adapter.protocol(), "skipping unusable adapter");
            last_err = Some(adapter::UnsupportedSnafu.build());
            continue;
        }
        match ctx
            .dispatcher
            .dispatch(
                adapter.as_ref(),
                &private_ips,
                gateway,
                internal_port,
                external_port,
                lifetime,
            )
            .await
        {
            Ok(mut record) => {
                record.error_info = last_err.map(|e| e.to_string());
                return Ok((record, adapter.clone()));
            }
            Err(e) => {
                debug!(protocol = %adapter.protocol(), "adapter failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(Error::AllAdaptersFailed {
        last: last_err.unwrap_or_else(|| adapter::UnsupportedSnafu.build()),
    })
}

/// Resolves, and caches, whether an adapter's protocol is usable here.
async fn adapter_usable(
    ctx: &AttemptCtx,
    adapter: &dyn Adapter,
    private_ips: &[Ipv4Addr],
    gateway: Option<Ipv4Addr>,
) -> bool {
    if let Some(usable) = ctx.availability.get(adapter.protocol()) {
        return usable;
    }
    // Probing needs a gateway to aim at; without one, let the dispatch try.
    let Some(gateway) = gateway else {
        return true;
    };
    let Some(internal_ip) = chooser::longest_prefix_match(private_ips, gateway) else {
        return true;
    };
    let usable = adapter.probe(gateway, internal_ip).await;
    ctx.availability.set(adapter.protocol(), usable);
    usable
}

/// What to do when a record's lease runs out.
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    /// Permanent static mapping; nothing to arm.
    Static,
    /// Re-map when the granted lease runs out.
    Renew { delay: Duration, next_lifetime: u32 },
    /// Forget the mapping once the lease the caller asked for elapses.
    Expire { delay: Duration },
}

fn renewal_plan(record: &MappingRecord) -> Plan {
    if record.requested_lifetime == 0 {
        // A zero lease is a permanent static mapping on UPnP; elsewhere it
        // means "re-map perpetually", at the granted lease (24h unless the
        // gateway capped it).
        if record.protocol == Protocol::Upnp {
            return Plan::Static;
        }
        return Plan::Renew {
            delay: Duration::from_secs(record.lifetime.into()),
            next_lifetime: 0,
        };
    }
    if record.lifetime < record.requested_lifetime {
        // The gateway shortened the lease; renew at its end with the
        // remainder of what the caller asked for.
        Plan::Renew {
            delay: Duration::from_secs(record.lifetime.into()),
            next_lifetime: record.requested_lifetime - record.lifetime,
        }
    } else {
        Plan::Expire {
            delay: Duration::from_secs(record.requested_lifetime.into()),
        }
    }
}

#[derive(Debug)]
struct SweepState {
    /// Re-mapping attempts still in flight.
    pending: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

/// The long-running service owning the active-mapping table.
///
/// All registry mutation happens here, one message at a time; network work
/// runs in spawned tasks that report back through the service channel.
#[derive(Debug)]
struct Service {
    rx: mpsc::Receiver<Message>,
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<Event>,
    registry: Registry,
    ctx: AttemptCtx,
    auto_renew: bool,
    renew_interval: Duration,
    sweep: Option<SweepState>,
    /// In-flight attempts, deletions and sweep queries; aborted on close.
    tasks: Vec<AbortOnDropHandle<()>>,
}

impl Service {
    fn new(
        config: Config,
        network: Arc<dyn NetworkProbe>,
        adapters: Vec<Arc<dyn Adapter>>,
        tx: mpsc::Sender<Message>,
        rx: mpsc::Receiver<Message>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Service {
            rx,
            tx,
            events,
            registry: Registry::default(),
            ctx: AttemptCtx {
                adapters: Arc::new(adapters),
                dispatcher: Dispatcher::default(),
                network,
                availability: Availability::default(),
            },
            auto_renew: config.auto_renew,
            renew_interval: config.renew_interval,
            sweep: None,
            tasks: Vec::new(),
        }
    }

    async fn run(mut self) {
        debug!("mapping service starting");
        let mut sweep_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.renew_interval,
            self.renew_interval,
        );
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: msg {msg:?}");
                    match msg {
                        Some(msg) => {
                            if self.handle_msg(msg) {
                                break;
                            }
                        }
                        None => {
                            debug!("all handles dropped, stopping");
                            break;
                        }
                    }
                }
                _ = sweep_timer.tick(), if self.auto_renew => {
                    trace!("tick: sweep");
                    self.start_sweep(None);
                }
            }
        }
    }

    /// Handles one message; returns `true` when the service should stop.
    fn handle_msg(&mut self, msg: Message) -> bool {
        match msg {
            Message::AddMapping {
                internal_port,
                external_port,
                lifetime,
                result_tx,
            } => {
                self.spawn_attempt(
                    internal_port,
                    external_port,
                    lifetime,
                    Intent::Fresh { result_tx },
                );
            }
            Message::DeleteMapping {
                external_port,
                external_ip,
                result_tx,
            } => match external_ip {
                Some(external_ip) => self.finish_delete((external_ip, external_port), result_tx),
                None => {
                    // No address given: the mapping lives under the current
                    // public address.
                    let network = self.ctx.network.clone();
                    let tx = self.tx.clone();
                    self.track(tokio::spawn(async move {
                        let public_ip = network.public_ip().await;
                        let _ = tx
                            .send(Message::DeleteKeyResolved {
                                external_port,
                                public_ip,
                                result_tx,
                            })
                            .await;
                    }));
                }
            },
            Message::DeleteKeyResolved {
                external_port,
                public_ip,
                result_tx,
            } => match public_ip {
                Some(public_ip) => self.finish_delete((public_ip, external_port), result_tx),
                None => {
                    let _ = result_tx.send(Err(Error::PublicAddressUnknown));
                }
            },
            Message::ActiveMappings { result_tx } => {
                let _ = result_tx.send(self.registry.records());
            }
            Message::ProbeSnapshot { result_tx } => {
                let _ = result_tx.send(self.ctx.availability.output());
            }
            Message::Renew { result_tx } => self.start_sweep(Some(result_tx)),
            Message::MappingReady { outcome, intent } => self.on_mapping_ready(outcome, intent),
            Message::RenewDue { key, next_lifetime } => self.on_renew_due(key, next_lifetime),
            Message::LeaseElapsed { key } => {
                debug!(?key, "lease elapsed, evicting");
                self.registry.remove(&key);
            }
            Message::SweepReady { public_ip } => self.on_sweep_ready(public_ip),
            Message::Close { result_tx } => {
                self.close(result_tx);
                return true;
            }
        }
        false
    }

    fn spawn_attempt(
        &mut self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        intent: Intent,
    ) {
        let ctx = self.ctx.clone();
        let tx = self.tx.clone();
        self.track(tokio::spawn(
            async move {
                let outcome = attempt_mapping(ctx, internal_port, external_port, lifetime).await;
                let _ = tx.send(Message::MappingReady { outcome, intent }).await;
            }
            .instrument(info_span!("natmap.attempt")),
        ));
    }

    fn track(&mut self, task: tokio::task::JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(AbortOnDropHandle::new(task));
    }

    fn on_mapping_ready(
        &mut self,
        outcome: Result<(MappingRecord, Arc<dyn Adapter>), Error>,
        intent: Intent,
    ) {
        match outcome {
            Ok((record, adapter)) => match record.key() {
                Some(key) => {
                    if let Intent::Renew { key: old_key } = &intent {
                        // The renewal may have landed under a different
                        // external identity; drop the stale entry.
                        if *old_key != key {
                            self.registry.remove(old_key);
                        }
                    }
                    // Displacing an entry under the same key drops its timer
                    // with it, so a key never has two timers armed.
                    self.registry.insert(Entry {
                        record: record.clone(),
                        adapter,
                        timer: None,
                    });
                    self.arm_timer(key);
                    let _ = self.events.send(Event::Mapping(record.clone()));
                    match intent {
                        Intent::Fresh { result_tx } => {
                            let _ = result_tx.send(Ok(record));
                        }
                        Intent::Renew { .. } => debug!(?key, "mapping renewed"),
                        Intent::Roam => {
                            debug!(?key, "mapping re-established after roam");
                            self.sweep_settled();
                        }
                    }
                }
                None => {
                    let err = Error::Adapter {
                        source: adapter::ProtocolSnafu {
                            reason: "adapter returned an unestablished mapping".to_string(),
                        }
                        .build(),
                    };
                    self.settle_failure(intent, err);
                }
            },
            Err(e) => self.settle_failure(intent, e),
        }
    }

    fn settle_failure(&mut self, intent: Intent, err: Error) {
        match intent {
            Intent::Fresh { result_tx } => {
                let _ = result_tx.send(Err(err));
            }
            Intent::Renew { key } => {
                // The lease ran out while the renewal failed; the gateway has
                // forgotten the mapping and so must the table.
                warn!(?key, "renewal failed, evicting: {err}");
                self.registry.remove(&key);
            }
            Intent::Roam => {
                warn!("re-mapping after roam failed: {err}");
                self.sweep_settled();
            }
        }
    }

    /// Arms the renewal or expiry timer matching `key`'s lease.
    fn arm_timer(&mut self, key: MappingKey) {
        let tx = self.tx.clone();
        let Some(entry) = self.registry.get_mut(&key) else {
            return;
        };
        entry.timer = match renewal_plan(&entry.record) {
            Plan::Static => None,
            Plan::Renew {
                delay,
                next_lifetime,
            } => Some(spawn_timer(tx, delay, Message::RenewDue { key, next_lifetime })),
            Plan::Expire { delay } => Some(spawn_timer(tx, delay, Message::LeaseElapsed { key })),
        };
    }

    fn on_renew_due(&mut self, key: MappingKey, next_lifetime: u32) {
        let Some(entry) = self.registry.get_mut(&key) else {
            return;
        };
        entry.timer = None; // fired
        let internal_port = entry.record.internal_port;
        let external_port = entry.record.external_port;
        debug!(?key, next_lifetime, "lease ran out, renewing");
        self.spawn_attempt(internal_port, external_port, next_lifetime, Intent::Renew { key });
    }

    /// Begins a sweep; requests arriving while one runs share its result.
    fn start_sweep(&mut self, waiter: Option<oneshot::Sender<()>>) {
        if let Some(state) = &mut self.sweep {
            state.waiters.extend(waiter);
            return;
        }
        self.sweep = Some(SweepState {
            pending: 0,
            waiters: waiter.into_iter().collect(),
        });

        let network = self.ctx.network.clone();
        let tx = self.tx.clone();
        self.track(tokio::spawn(
            async move {
                let public_ip = network.public_ip().await;
                let _ = tx.send(Message::SweepReady { public_ip }).await;
            }
            .instrument(info_span!("natmap.sweep")),
        ));
    }

    fn on_sweep_ready(&mut self, public_ip: Option<Ipv4Addr>) {
        let Some(public_ip) = public_ip else {
            debug!("sweep: public address unknown, keeping mappings");
            self.finish_sweep();
            return;
        };

        let stale: Vec<MappingKey> = self
            .registry
            .keys()
            .into_iter()
            .filter(|&(external_ip, _)| external_ip != public_ip)
            .collect();
        if stale.is_empty() {
            self.finish_sweep();
            return;
        }

        debug!(count = stale.len(), %public_ip, "sweep: public address changed, re-mapping");
        // A different network may support a different protocol set.
        self.ctx.availability.clear();

        for key in stale {
            // The gateway that granted this is no longer reachable; evict
            // without calling it and establish a fresh mapping instead.
            let Some(entry) = self.registry.remove(&key) else {
                continue;
            };
            if let Some(state) = &mut self.sweep {
                state.pending += 1;
            }
            self.spawn_attempt(
                entry.record.internal_port,
                entry.record.external_port,
                entry.record.requested_lifetime,
                Intent::Roam,
            );
        }
    }

    fn sweep_settled(&mut self) {
        if let Some(state) = &mut self.sweep {
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 {
                self.finish_sweep();
            }
        }
    }

    fn finish_sweep(&mut self) {
        if let Some(state) = self.sweep.take() {
            for waiter in state.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Removes the entry and releases it on the gateway. The entry is gone
    /// from the table regardless of what the gateway answers.
    fn finish_delete(&mut self, key: MappingKey, result_tx: oneshot::Sender<Result<(), Error>>) {
        let Some(entry) = self.registry.remove(&key) else {
            let _ = result_tx.send(Err(Error::MappingNotFound {
                external_ip: key.0,
                external_port: key.1,
            }));
            return;
        };
        let Entry {
            record,
            adapter,
            timer,
        } = entry;
        drop(timer);
        self.track(tokio::spawn(async move {
            let result = adapter.delete_mapping(&record).await.map_err(Error::from);
            let _ = result_tx.send(result);
        }));
    }

    fn close(&mut self, result_tx: oneshot::Sender<()>) {
        debug!(mappings = self.registry.len(), "closing");
        // Cancel in-flight attempts; pending waiters see a closed channel.
        self.tasks.clear();
        self.sweep = None;

        let mut entries = self.registry.drain();
        for entry in &mut entries {
            entry.timer = None;
        }
        // Detached deliberately: the releases outlive the service loop.
        tokio::spawn(async move {
            let releases = entries.into_iter().map(|entry| async move {
                if let Err(e) = entry.adapter.delete_mapping(&entry.record).await {
                    debug!("failed to release mapping on close: {e}");
                }
            });
            futures_util::future::join_all(releases).await;
            let _ = result_tx.send(());
        });
    }
}

fn spawn_timer(
    tx: mpsc::Sender<Message>,
    delay: Duration,
    msg: Message,
) -> AbortOnDropHandle<()> {
    AbortOnDropHandle::new(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(msg).await;
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use super::*;
    use crate::adapter::{GatewaySnafu, PMP_PROBE_PORT};

    /// Shared picture of the fake network: the stub probe reports it and the
    /// stub adapters grant mappings on it.
    #[derive(Debug)]
    struct TestNet {
        public_ip: StdMutex<Ipv4Addr>,
    }

    impl TestNet {
        fn new(public_ip: &str) -> Arc<Self> {
            Arc::new(Self {
                public_ip: StdMutex::new(public_ip.parse().unwrap()),
            })
        }

        fn set_public_ip(&self, public_ip: &str) {
            *self.public_ip.lock().unwrap() = public_ip.parse().unwrap();
        }

        fn public_ip(&self) -> Ipv4Addr {
            *self.public_ip.lock().unwrap()
        }
    }

    #[derive(Debug)]
    struct StubProbe {
        net: Arc<TestNet>,
    }

    #[async_trait::async_trait]
    impl NetworkProbe for StubProbe {
        fn private_ips(&self) -> Vec<Ipv4Addr> {
            vec![Ipv4Addr::new(192, 168, 1, 20)]
        }

        fn gateway_ip(&self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(192, 168, 1, 1))
        }

        async fn public_ip(&self) -> Option<Ipv4Addr> {
            Some(self.net.public_ip())
        }
    }

    #[derive(Debug)]
    struct StubAdapter {
        protocol: Protocol,
        usable: bool,
        fail: bool,
        granted_lifetime: Option<u32>,
        net: Arc<TestNet>,
        requested: StdMutex<Vec<u32>>,
        deletions: AtomicUsize,
    }

    impl StubAdapter {
        fn new(protocol: Protocol, net: &Arc<TestNet>) -> Self {
            Self {
                protocol,
                usable: true,
                fail: false,
                granted_lifetime: None,
                net: net.clone(),
                requested: StdMutex::new(Vec::new()),
                deletions: AtomicUsize::new(0),
            }
        }

        fn requested_lifetimes(&self) -> Vec<u32> {
            self.requested.lock().unwrap().clone()
        }

        fn deletions(&self) -> usize {
            self.deletions.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Adapter for StubAdapter {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        fn probe_port(&self) -> u16 {
            PMP_PROBE_PORT
        }

        async fn probe(&self, _router_ip: Ipv4Addr, _internal_ip: Ipv4Addr) -> bool {
            self.usable
        }

        async fn create_mapping(
            &self,
            router_ip: Ipv4Addr,
            internal_ip: Ipv4Addr,
            internal_port: u16,
            external_port: u16,
            lifetime: u32,
        ) -> Result<MappingRecord, AdapterError> {
            self.requested.lock().unwrap().push(lifetime);
            if self.fail {
                return GatewaySnafu {
                    reason: "stub refuses".to_string(),
                }
                .fail();
            }
            let granted = self
                .granted_lifetime
                .unwrap_or_else(|| adapter::wire_lifetime(lifetime));
            Ok(MappingRecord {
                protocol: self.protocol,
                internal_port,
                external_port: if external_port == 0 {
                    internal_port
                } else {
                    external_port
                },
                internal_ip,
                external_ip: Some(self.net.public_ip()),
                router_ip,
                lifetime: granted,
                requested_lifetime: lifetime,
                nonce: (self.protocol == Protocol::Pcp).then_some([7u8; 12]),
                error_info: None,
            })
        }

        async fn delete_mapping(&self, _record: &MappingRecord) -> Result<(), AdapterError> {
            self.deletions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with(net: &Arc<TestNet>, adapters: Vec<Arc<dyn Adapter>>) -> Manager {
        Manager::with_adapters(
            Config::default(),
            Arc::new(StubProbe { net: net.clone() }),
            adapters,
        )
    }

    #[tokio::test]
    async fn failing_adapter_falls_through_to_the_next() {
        let net = TestNet::new("1.2.3.4");
        let mut first = StubAdapter::new(Protocol::Pmp, &net);
        first.fail = true;
        let first = Arc::new(first);
        let second = Arc::new(StubAdapter::new(Protocol::Upnp, &net));

        let manager = manager_with(&net, vec![first.clone() as Arc<dyn Adapter>, second.clone()]);
        let record = manager.add_mapping(55555, 55555, 0).await.unwrap();

        assert_eq!(record.protocol, Protocol::Upnp);
        assert_eq!(record.internal_port, 55555);
        assert!(record.error_info.is_some());
        assert!(!first.requested_lifetimes().is_empty());
    }

    #[tokio::test]
    async fn unusable_adapter_is_never_dispatched() {
        let net = TestNet::new("1.2.3.4");
        let mut unusable = StubAdapter::new(Protocol::Pcp, &net);
        unusable.usable = false;
        let unusable = Arc::new(unusable);
        let working = Arc::new(StubAdapter::new(Protocol::Pmp, &net));

        let manager = manager_with(
            &net,
            vec![unusable.clone() as Arc<dyn Adapter>, working.clone()],
        );
        let record = manager.add_mapping(7000, 7000, 3600).await.unwrap();

        assert_eq!(record.protocol, Protocol::Pmp);
        assert!(unusable.requested_lifetimes().is_empty());

        let output = manager.probe_output().await.unwrap();
        assert!(output.pmp);
        assert!(!output.pcp);
    }

    #[tokio::test]
    async fn all_adapters_failing_fails_the_call() {
        let net = TestNet::new("1.2.3.4");
        let mut only = StubAdapter::new(Protocol::Pmp, &net);
        only.fail = true;

        let manager = manager_with(&net, vec![Arc::new(only) as Arc<dyn Adapter>]);
        let err = manager.add_mapping(7000, 7000, 3600).await.unwrap_err();

        assert!(matches!(err, Error::AllAdaptersFailed { .. }));
    }

    #[tokio::test]
    async fn delete_removes_the_record_from_the_table() {
        let net = TestNet::new("1.2.3.4");
        let adapter = Arc::new(StubAdapter::new(Protocol::Pmp, &net));
        let manager = manager_with(&net, vec![adapter.clone() as Arc<dyn Adapter>]);

        let record = manager.add_mapping(7000, 7000, 3600).await.unwrap();
        assert_eq!(manager.active_mappings().await.unwrap(), vec![record.clone()]);

        manager
            .delete_mapping(record.external_port, record.external_ip)
            .await
            .unwrap();

        assert!(manager.active_mappings().await.unwrap().is_empty());
        assert_eq!(adapter.deletions(), 1);
    }

    #[tokio::test]
    async fn delete_defaults_to_the_current_public_address() {
        let net = TestNet::new("1.2.3.4");
        let adapter = Arc::new(StubAdapter::new(Protocol::Pmp, &net));
        let manager = manager_with(&net, vec![adapter.clone() as Arc<dyn Adapter>]);

        manager.add_mapping(7000, 7000, 3600).await.unwrap();
        manager.delete_mapping(7000, None).await.unwrap();

        assert!(manager.active_mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_an_unknown_mapping_errors() {
        let net = TestNet::new("1.2.3.4");
        let manager = manager_with(
            &net,
            vec![Arc::new(StubAdapter::new(Protocol::Pmp, &net)) as Arc<dyn Adapter>],
        );

        let err = manager
            .delete_mapping(4242, Some(Ipv4Addr::new(1, 2, 3, 4)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MappingNotFound { .. }));
    }

    #[tokio::test]
    async fn same_external_identity_displaces_the_old_entry() {
        let net = TestNet::new("1.2.3.4");
        let manager = manager_with(
            &net,
            vec![Arc::new(StubAdapter::new(Protocol::Pmp, &net)) as Arc<dyn Adapter>],
        );

        manager.add_mapping(7000, 7000, 3600).await.unwrap();
        manager.add_mapping(7000, 7000, 3600).await.unwrap();

        assert_eq!(manager.active_mappings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn creation_emits_an_event_with_the_record() {
        let net = TestNet::new("1.2.3.4");
        let manager = manager_with(
            &net,
            vec![Arc::new(StubAdapter::new(Protocol::Pmp, &net)) as Arc<dyn Adapter>],
        );

        let mut events = manager.subscribe();
        let record = manager.add_mapping(7000, 7000, 3600).await.unwrap();

        let Event::Mapping(emitted) = events.recv().await.unwrap();
        assert_eq!(emitted, record);
    }

    #[tokio::test(start_paused = true)]
    async fn shortened_lease_renews_with_the_remainder() {
        let net = TestNet::new("1.2.3.4");
        let mut capped = StubAdapter::new(Protocol::Pmp, &net);
        capped.granted_lifetime = Some(120);
        let capped = Arc::new(capped);
        let manager = manager_with(&net, vec![capped.clone() as Arc<dyn Adapter>]);

        let record = manager.add_mapping(7000, 7000, 3600).await.unwrap();
        assert_eq!(record.lifetime, 120);
        assert_eq!(record.requested_lifetime, 3600);

        // The renewal fires once the 120 s lease runs out and asks for the
        // remaining 3480 s.
        let mut events = manager.subscribe();
        let Event::Mapping(renewed) = events.recv().await.unwrap();
        assert_eq!(renewed.requested_lifetime, 3480);
        assert_eq!(capped.requested_lifetimes(), vec![3600, 3480]);
        assert_eq!(manager.active_mappings().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fully_granted_lease_expires_out_of_the_table() {
        let net = TestNet::new("1.2.3.4");
        let manager = manager_with(
            &net,
            vec![Arc::new(StubAdapter::new(Protocol::Pmp, &net)) as Arc<dyn Adapter>],
        );

        manager.add_mapping(7000, 7000, 60).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(manager.active_mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_reestablishes_after_roam() {
        let net = TestNet::new("1.2.3.4");
        let adapter = Arc::new(StubAdapter::new(Protocol::Pmp, &net));
        let manager = manager_with(&net, vec![adapter.clone() as Arc<dyn Adapter>]);

        let record = manager.add_mapping(7000, 7000, 3600).await.unwrap();
        assert_eq!(record.external_ip, Some(Ipv4Addr::new(1, 2, 3, 4)));

        net.set_public_ip("5.6.7.8");
        manager.renew_mappings().await.unwrap();

        let records = manager.active_mappings().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_ip, Some(Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(records[0].external_port, 7000);
        // The unreachable old gateway is never contacted.
        assert_eq!(adapter.deletions(), 0);
    }

    #[tokio::test]
    async fn sweep_with_an_unchanged_address_is_a_no_op() {
        let net = TestNet::new("1.2.3.4");
        let adapter = Arc::new(StubAdapter::new(Protocol::Pmp, &net));
        let manager = manager_with(&net, vec![adapter.clone() as Arc<dyn Adapter>]);

        manager.add_mapping(7000, 7000, 3600).await.unwrap();
        let attempts = adapter.requested_lifetimes().len();

        manager.renew_mappings().await.unwrap();

        assert_eq!(adapter.requested_lifetimes().len(), attempts);
        assert_eq!(manager.active_mappings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_releases_everything_and_shuts_down() {
        let net = TestNet::new("1.2.3.4");
        let adapter = Arc::new(StubAdapter::new(Protocol::Pmp, &net));
        let manager = manager_with(&net, vec![adapter.clone() as Arc<dyn Adapter>]);

        manager.add_mapping(7000, 7000, 3600).await.unwrap();
        manager.add_mapping(7000, 7001, 3600).await.unwrap();

        manager.close().await.unwrap();

        assert_eq!(adapter.deletions(), 2);
        assert!(matches!(
            manager.active_mappings().await,
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn plans_match_the_lease_regimes() {
        let record = |protocol, lifetime, requested_lifetime| MappingRecord {
            protocol,
            internal_port: 7000,
            external_port: 7000,
            internal_ip: Ipv4Addr::new(192, 168, 1, 20),
            external_ip: Some(Ipv4Addr::new(1, 2, 3, 4)),
            router_ip: Ipv4Addr::new(192, 168, 1, 1),
            lifetime,
            requested_lifetime,
            nonce: None,
            error_info: None,
        };

        // UPnP zero lease: permanent static mapping, no timer.
        assert_eq!(renewal_plan(&record(Protocol::Upnp, 0, 0)), Plan::Static);
        // Indefinite PMP/PCP: re-map perpetually when the lease runs out.
        assert_eq!(
            renewal_plan(&record(Protocol::Pmp, 86_400, 0)),
            Plan::Renew {
                delay: Duration::from_secs(86_400),
                next_lifetime: 0,
            }
        );
        // Shortened lease: renew with the remainder.
        assert_eq!(
            renewal_plan(&record(Protocol::Pcp, 120, 3600)),
            Plan::Renew {
                delay: Duration::from_secs(120),
                next_lifetime: 3480,
            }
        );
        // Fully granted lease: expire at its end.
        assert_eq!(
            renewal_plan(&record(Protocol::Pmp, 3600, 3600)),
            Plan::Expire {
                delay: Duration::from_secs(3600),
            }
        );
    }
}
