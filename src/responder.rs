//! The mDNS responder: public API and executor loop.
//!
//! A [`Responder`] owns a single-threaded executor that applies every state
//! mutation in order, driven by a bounded action queue and a periodic timer
//! tick. API calls from other threads either enqueue actions (waiting for
//! completion where the original call must observe its effect) or take the
//! engine mutex for short read-mostly operations.

mod action;
mod browse;
mod engine;
mod iface;
mod outbound;
mod parsed;
mod query;
mod registry;
mod schedule;

use std::net::IpAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::{Clock, Entropy, Monotonic, Rng};
use crate::name::Label;
use crate::transport::{IfaceId, IpFamily, MulticastSocket, RxFrame, Transport};
use crate::Error;

use action::{post, Action};
use engine::{Engine, EngineOpts};
use query::SearchShared;

pub use action::NetifEvent;
pub use query::{QueryResult, QuerySpec};
pub use registry::{Proto, TxtItem};

/// Responder configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on concurrently registered services.
    pub max_services: usize,
    /// Size of the static interface table.
    pub max_interfaces: usize,
    /// Capacity of the action queue.
    pub action_queue_depth: usize,
    /// Period of the scheduler/search timer tick.
    pub timer_tick_ms: u64,
    /// Answer PTR questions for `in-addr.arpa` / `ip6.arpa` names.
    pub respond_reverse_queries: bool,
    /// Drop datagrams whose source address is our own.
    pub suppress_own_queries: bool,
    /// Interface pairs known to share an IPv4 subnet (e.g. wired and
    /// wireless of the same machine); the second one up goes silent.
    pub duplicate_pairs: Vec<(IfaceId, IfaceId)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_services: 16,
            max_interfaces: 3,
            action_queue_depth: 16,
            timer_tick_ms: 100,
            respond_reverse_queries: false,
            suppress_own_queries: true,
            duplicate_pairs: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Describes a service to register.
#[derive(Clone, Debug)]
pub struct ServiceDesc {
    /// Instance name; `None` uses the default instance name (or hostname).
    pub instance: Option<String>,
    /// Service type, e.g. `_http`.
    pub service: String,
    pub proto: Proto,
    /// Host the service runs on; `None` means this machine.
    pub hostname: Option<String>,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub txt: Vec<TxtItem>,
}

impl ServiceDesc {
    pub fn new(service: impl Into<String>, proto: Proto, port: u16) -> Self {
        Self {
            instance: None,
            service: service.into(),
            proto,
            hostname: None,
            port,
            priority: 0,
            weight: 0,
            txt: Vec::new(),
        }
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn txt(mut self, txt: Vec<TxtItem>) -> Self {
        self.txt = txt;
        self
    }
}

struct Shared {
    engine: Mutex<Engine>,
    actions: SyncSender<Action>,
}

/// A running mDNS responder.
///
/// Created with [`Responder::new`]; dropped (or [`Responder::shutdown`])
/// responders drain their action queue and send a goodbye for everything
/// they announced.
pub struct Responder {
    shared: Arc<Shared>,
    executor: Option<thread::JoinHandle<()>>,
}

impl Responder {
    /// Creates a responder with the default collaborators: the system
    /// monotonic clock, the process entropy source, and multicast UDP
    /// sockets.
    pub fn new(config: Config) -> Responder {
        Self::with_collaborators(
            config,
            Box::new(Monotonic::new()),
            Box::new(Entropy),
            Box::new(MulticastSocket::new()),
        )
    }

    /// Creates a responder with explicit clock, randomness and socket
    /// collaborators. This is how tests (and unusual embeddings) pin down
    /// time, jitter and I/O.
    pub fn with_collaborators(
        config: Config,
        clock: Box<dyn Clock>,
        rng: Box<dyn Rng>,
        transport: Box<dyn Transport>,
    ) -> Responder {
        let (tx, rx) = mpsc::sync_channel(config.action_queue_depth);
        let engine = Engine::new(
            EngineOpts {
                max_services: config.max_services,
                max_interfaces: config.max_interfaces,
                respond_reverse_queries: config.respond_reverse_queries,
                suppress_own_queries: config.suppress_own_queries,
                duplicate_pairs: config.duplicate_pairs.clone(),
            },
            clock,
            rng,
            transport,
            tx.clone(),
        );
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            actions: tx,
        });

        let executor = {
            let shared = shared.clone();
            let tick = Duration::from_millis(config.timer_tick_ms.max(1));
            thread::Builder::new()
                .name("mdns".into())
                .spawn(move || run_executor(shared, rx, tick))
                .expect("failed to spawn mdns executor")
        };

        Responder {
            shared,
            executor: Some(executor),
        }
    }

    fn post(&self, action: Action) -> Result<(), Error> {
        post(&self.shared.actions, action)
    }

    /// Posts an action and waits until the executor has applied it.
    fn post_and_wait(
        &self,
        make: impl FnOnce(SyncSender<()>) -> Action,
    ) -> Result<(), Error> {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.post(make(done_tx))?;
        done_rx.recv().map_err(|_| Error::InvalidState)
    }

    // ---- names -----------------------------------------------------------

    /// Sets our hostname. Existing records are retired with a goodbye and
    /// all names are re-probed under the new one.
    ///
    /// Returns once the executor has applied the change.
    pub fn hostname_set(&self, hostname: &str) -> Result<(), Error> {
        check_label(hostname)?;
        self.post_and_wait(|done| Action::HostnameSet {
            hostname: hostname.to_owned(),
            done,
        })
    }

    /// Returns the current hostname (which may have been renamed after a
    /// collision).
    pub fn hostname(&self) -> String {
        self.shared.engine.lock().unwrap().registry.hostname.clone()
    }

    /// Sets the default instance name used by services without one.
    pub fn instance_name_set(&self, instance: &str) -> Result<(), Error> {
        check_label(instance)?;
        self.post(Action::InstanceSet {
            instance: Some(instance.to_owned()),
        })
    }

    // ---- delegated hosts -------------------------------------------------

    /// Registers a hostname we answer for on behalf of another entity.
    pub fn delegate_hostname_add(
        &self,
        hostname: &str,
        addrs: Vec<IpAddr>,
    ) -> Result<(), Error> {
        check_label(hostname)?;
        self.post_and_wait(|done| Action::DelegateAdd {
            hostname: hostname.to_owned(),
            addrs,
            done,
        })
    }

    /// Replaces the address list of a delegated hostname.
    pub fn delegate_hostname_set_addrs(
        &self,
        hostname: &str,
        addrs: Vec<IpAddr>,
    ) -> Result<(), Error> {
        check_label(hostname)?;
        self.post(Action::DelegateSetAddrs {
            hostname: hostname.to_owned(),
            addrs,
        })
    }

    /// Removes a delegated hostname along with the services bound to it.
    pub fn delegate_hostname_remove(&self, hostname: &str) -> Result<(), Error> {
        check_label(hostname)?;
        self.post_and_wait(|done| Action::DelegateRemove {
            hostname: hostname.to_owned(),
            done,
        })
    }

    // ---- services --------------------------------------------------------

    /// Registers a service. It is probed for uniqueness on every enabled
    /// interface before being announced.
    pub fn service_add(&self, desc: ServiceDesc) -> Result<(), Error> {
        if desc.service.is_empty() || desc.port == 0 {
            return Err(Error::InvalidArg);
        }
        if let Some(instance) = &desc.instance {
            check_label(instance)?;
        }

        let mut engine = self.shared.engine.lock().unwrap();
        let hostname = match desc.hostname {
            Some(hostname) => {
                if !engine.registry.hostname_is_ours(&hostname) {
                    return Err(Error::NotFound);
                }
                hostname
            }
            None => {
                if engine.registry.hostname.is_empty() {
                    return Err(Error::InvalidState);
                }
                engine.registry.hostname.clone()
            }
        };
        engine
            .service_add(registry::Service {
                instance: desc.instance,
                service: desc.service,
                proto: desc.proto,
                hostname,
                port: desc.port,
                priority: desc.priority,
                weight: desc.weight,
                txt: desc.txt,
                subtypes: Vec::new(),
            })
            .map(drop)
    }

    fn with_service<R>(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        f: impl FnOnce(&mut Engine, registry::ServiceId) -> R,
    ) -> Result<R, Error> {
        let mut engine = self.shared.engine.lock().unwrap();
        let id = match instance {
            Some(instance) => engine
                .registry
                .find_instance(Some(instance), service, proto, None),
            None => engine.registry.find(service, proto, None),
        }
        .map(|e| e.id)
        .ok_or(Error::NotFound)?;
        Ok(f(&mut engine, id))
    }

    /// Removes a service, sending a goodbye for its records.
    pub fn service_remove(&self, service: &str, proto: Proto) -> Result<(), Error> {
        self.with_service(None, service, proto, |engine, id| {
            engine.service_remove(id);
        })
    }

    /// Removes a specific instance of a service.
    pub fn service_remove_instance(
        &self,
        instance: &str,
        service: &str,
        proto: Proto,
    ) -> Result<(), Error> {
        self.with_service(Some(instance), service, proto, |engine, id| {
            engine.service_remove(id);
        })
    }

    /// Removes every registered service.
    pub fn service_remove_all(&self) {
        self.shared.engine.lock().unwrap().service_remove_all();
    }

    /// Changes a service's port and re-announces it.
    pub fn service_port_set(&self, service: &str, proto: Proto, port: u16) -> Result<(), Error> {
        if port == 0 {
            return Err(Error::InvalidArg);
        }
        self.with_service(None, service, proto, |engine, id| {
            if let Some(entry) = engine.registry.get_mut(id) {
                entry.service.port = port;
            }
            engine.service_announce(id);
        })
    }

    /// Replaces a service's TXT items and re-announces it.
    pub fn service_txt_set(
        &self,
        service: &str,
        proto: Proto,
        txt: Vec<TxtItem>,
    ) -> Result<(), Error> {
        self.with_service(None, service, proto, |engine, id| {
            if let Some(entry) = engine.registry.get_mut(id) {
                entry.service.txt = txt;
            }
            engine.service_announce(id);
        })
    }

    /// Sets (or replaces) one TXT item and re-announces the service.
    pub fn service_txt_item_set(
        &self,
        service: &str,
        proto: Proto,
        key: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        let item = TxtItem::new(key, value.map(|v| v.to_vec()))?;
        self.with_service(None, service, proto, |engine, id| {
            if let Some(entry) = engine.registry.get_mut(id) {
                let txt = &mut entry.service.txt;
                match txt
                    .iter_mut()
                    .find(|t| t.key().eq_ignore_ascii_case(key))
                {
                    Some(slot) => *slot = item,
                    None => txt.push(item),
                }
            }
            engine.service_announce(id);
        })
    }

    /// Removes one TXT item and re-announces the service.
    pub fn service_txt_item_remove(
        &self,
        service: &str,
        proto: Proto,
        key: &str,
    ) -> Result<(), Error> {
        self.with_service(None, service, proto, |engine, id| {
            if let Some(entry) = engine.registry.get_mut(id) {
                entry
                    .service
                    .txt
                    .retain(|t| !t.key().eq_ignore_ascii_case(key));
            }
            engine.service_announce(id);
        })
    }

    /// Adds a subtype to a service and re-announces it.
    pub fn service_subtype_add(
        &self,
        service: &str,
        proto: Proto,
        subtype: &str,
    ) -> Result<(), Error> {
        check_label(subtype)?;
        self.with_service(None, service, proto, |engine, id| {
            if let Some(entry) = engine.registry.get_mut(id) {
                if !entry
                    .service
                    .subtypes
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(subtype))
                {
                    entry.service.subtypes.push(subtype.to_owned());
                }
            }
            engine.service_announce(id);
        })
    }

    /// Removes a subtype, retiring its PTR record with a goodbye.
    pub fn service_subtype_remove(
        &self,
        service: &str,
        proto: Proto,
        subtype: &str,
    ) -> Result<(), Error> {
        self.with_service(None, service, proto, |engine, id| {
            engine.subtype_bye(id, subtype.to_owned());
            if let Some(entry) = engine.registry.get_mut(id) {
                entry
                    .service
                    .subtypes
                    .retain(|s| !s.eq_ignore_ascii_case(subtype));
            }
        })
    }

    /// Replaces the whole subtype set; removed subtypes get goodbyes.
    pub fn service_subtype_update(
        &self,
        service: &str,
        proto: Proto,
        subtypes: Vec<String>,
    ) -> Result<(), Error> {
        for s in &subtypes {
            check_label(s)?;
        }
        self.with_service(None, service, proto, |engine, id| {
            let removed: Vec<String> = engine
                .registry
                .get(id)
                .map(|e| {
                    e.service
                        .subtypes
                        .iter()
                        .filter(|old| !subtypes.iter().any(|n| n.eq_ignore_ascii_case(old)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for subtype in removed {
                engine.subtype_bye(id, subtype);
            }
            if let Some(entry) = engine.registry.get_mut(id) {
                entry.service.subtypes = subtypes;
            }
            engine.service_announce(id);
        })
    }

    /// Renames a service instance; the new name is re-probed.
    pub fn service_instance_name_set(
        &self,
        service: &str,
        proto: Proto,
        instance: &str,
    ) -> Result<(), Error> {
        check_label(instance)?;
        self.with_service(None, service, proto, |engine, id| {
            engine.service_instance_set(id, instance.to_owned());
        })
    }

    /// Whether a service of this type is registered.
    pub fn service_exists(&self, service: &str, proto: Proto) -> bool {
        self.shared
            .engine
            .lock()
            .unwrap()
            .registry
            .find(service, proto, None)
            .is_some()
    }

    /// Whether a specific instance of a service is registered.
    pub fn service_exists_with_instance(
        &self,
        instance: &str,
        service: &str,
        proto: Proto,
    ) -> bool {
        self.shared
            .engine
            .lock()
            .unwrap()
            .registry
            .find_instance(Some(instance), service, proto, None)
            .is_some()
    }

    // ---- queries and browsing --------------------------------------------

    /// Runs a one-shot query, blocking until it times out or collects
    /// `max_results` entries. A query that finds nothing returns an empty
    /// result set.
    pub fn query(&self, spec: QuerySpec) -> Result<Vec<QueryResult>, Error> {
        let handle = self.query_async_new(spec)?;
        handle.wait()
    }

    /// Starts a query without blocking. Results are collected in the
    /// background and retrieved through the returned handle.
    pub fn query_async_new(&self, spec: QuerySpec) -> Result<SearchHandle, Error> {
        self.query_async(spec, None)
    }

    /// Like [`Responder::query_async_new`], additionally invoking `notifier`
    /// on the executor thread with the final results when the query ends.
    pub fn query_async_with_notifier(
        &self,
        spec: QuerySpec,
        notifier: impl Fn(&[QueryResult]) + Send + 'static,
    ) -> Result<SearchHandle, Error> {
        self.query_async(spec, Some(Box::new(notifier)))
    }

    fn query_async(
        &self,
        spec: QuerySpec,
        notifier: Option<Box<dyn Fn(&[QueryResult]) + Send>>,
    ) -> Result<SearchHandle, Error> {
        if spec.timeout_ms == 0 {
            return Err(Error::InvalidArg);
        }
        if spec.service.is_none() && spec.instance.is_none() {
            return Err(Error::InvalidArg);
        }

        let shared = SearchShared::new();
        let timeout_ms = spec.timeout_ms;
        let (id, now) = {
            let mut engine = self.shared.engine.lock().unwrap();
            (engine.next_handle(), engine.now())
        };
        let mut search = query::Search::new(id, spec, now, shared.clone());
        search.notifier = notifier;
        self.post(Action::SearchAdd(Box::new(search)))?;
        Ok(SearchHandle {
            id,
            shared,
            actions: self.shared.actions.clone(),
            timeout_ms,
            ended: false,
        })
    }

    /// Starts a browse subscription for a service type. The notifier runs on
    /// the executor thread for every created, changed or removed result.
    pub fn browse_new(
        &self,
        service: &str,
        proto: Proto,
        notifier: impl Fn(&QueryResult) + Send + 'static,
    ) -> Result<BrowseHandle, Error> {
        if service.is_empty() {
            return Err(Error::InvalidArg);
        }
        let id = self.shared.engine.lock().unwrap().next_handle();
        let browse = browse::Browse::new(id, service.to_owned(), proto, Box::new(notifier));
        self.post(Action::BrowseAdd(Box::new(browse)))?;
        Ok(BrowseHandle {
            id,
            actions: self.shared.actions.clone(),
        })
    }

    /// Ends a browse subscription.
    pub fn browse_delete(&self, handle: BrowseHandle) {
        drop(handle);
    }

    // ---- interfaces and I/O ----------------------------------------------

    /// Claims a slot in the interface table for `iface`.
    ///
    /// This happens implicitly on the first [`Responder::netif_up`]; calling
    /// it early surfaces a full table as an error instead of a log line.
    pub fn register_netif(&self, iface: IfaceId) -> Result<(), Error> {
        let mut engine = self.shared.engine.lock().unwrap();
        match engine.ifaces.pcb_mut(iface, IpFamily::V4) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidState),
        }
    }

    /// Takes an interface out of service for both address families.
    pub fn unregister_netif(&self, iface: IfaceId) -> Result<(), Error> {
        self.netif_action(iface, IpFamily::V4, NetifEvent::Down)?;
        self.netif_action(iface, IpFamily::V6, NetifEvent::Down)
    }

    /// Delivers an interface event for `(iface, family)`.
    pub fn netif_action(
        &self,
        iface: IfaceId,
        family: IpFamily,
        event: NetifEvent,
    ) -> Result<(), Error> {
        self.post(Action::SystemEvent {
            iface,
            family,
            event,
        })
    }

    /// Enables mDNS on an interface that came up with `addr`.
    pub fn netif_up(&self, iface: IfaceId, family: IpFamily, addr: IpAddr) -> Result<(), Error> {
        self.netif_action(iface, family, NetifEvent::Up(addr))
    }

    /// Disables mDNS on an interface.
    pub fn netif_down(&self, iface: IfaceId, family: IpFamily) -> Result<(), Error> {
        self.netif_action(iface, family, NetifEvent::Down)
    }

    /// Re-announces everything on an interface without re-probing.
    pub fn netif_announce(&self, iface: IfaceId, family: IpFamily) -> Result<(), Error> {
        self.netif_action(iface, family, NetifEvent::Announce)
    }

    /// Feeds a received datagram into the responder.
    ///
    /// The embedding application's receive loop calls this for every frame
    /// read from a socket opened by the transport.
    pub fn feed_frame(&self, frame: RxFrame) -> Result<(), Error> {
        self.post(Action::RxHandle(frame))
    }

    /// Stops the responder, sending a goodbye for everything it announced.
    ///
    /// Dropping the responder does the same.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        // A full queue drains as the executor runs, so a blocking send is
        // fine here.
        if self.shared.actions.send(Action::Stop { done: done_tx }).is_ok() {
            let _ = done_rx.recv();
        }
        if let Some(executor) = self.executor.take() {
            let _ = executor.join();
        }
    }
}

/// Handle to an asynchronous one-shot query.
pub struct SearchHandle {
    id: u64,
    shared: Arc<SearchShared>,
    actions: SyncSender<Action>,
    timeout_ms: u64,
    ended: bool,
}

impl SearchHandle {
    /// Whether the query has ended and results are available.
    pub fn results_ready(&self) -> bool {
        self.shared.results.lock().unwrap().is_some()
    }

    /// Takes the results if the query has ended.
    pub fn take_results(&self) -> Option<Vec<QueryResult>> {
        self.shared.results.lock().unwrap().take()
    }

    /// Blocks until the query ends and returns its results.
    pub fn wait(mut self) -> Result<Vec<QueryResult>, Error> {
        // The executor ends the search at its timeout; the grace on top only
        // guards against a torn-down executor.
        let deadline =
            Instant::now() + Duration::from_millis(self.timeout_ms) + Duration::from_secs(5);
        let mut slot = self.shared.results.lock().unwrap();
        while slot.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::InvalidState);
            }
            let (guard, _) = self
                .shared
                .done
                .wait_timeout(slot, remaining)
                .map_err(|_| Error::InvalidState)?;
            slot = guard;
        }
        self.ended = true;
        Ok(slot.take().unwrap_or_default())
    }
}

impl Drop for SearchHandle {
    fn drop(&mut self) {
        if !self.ended && !self.results_ready() {
            let _ = post(&self.actions, Action::SearchEnd { id: self.id });
        }
    }
}

/// Handle to a browse subscription; dropping it ends the browse.
pub struct BrowseHandle {
    id: u64,
    actions: SyncSender<Action>,
}

impl Drop for BrowseHandle {
    fn drop(&mut self) {
        let _ = post(&self.actions, Action::BrowseEnd { id: self.id });
    }
}

/// The executor: applies actions in order and runs the scheduler and search
/// sweeps once per timer tick.
fn run_executor(shared: Arc<Shared>, rx: Receiver<Action>, tick: Duration) {
    let mut last_tick = Instant::now();
    loop {
        match rx.recv_timeout(tick) {
            Ok(action) => {
                let mut engine = shared.engine.lock().unwrap();
                engine.execute(action);
                if engine.stopped {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        if last_tick.elapsed() >= tick {
            last_tick = Instant::now();
            let mut engine = shared.engine.lock().unwrap();
            engine.scheduler_run();
            engine.search_run();
        }
    }
}

fn check_label(s: &str) -> Result<(), Error> {
    if s.is_empty() || s.len() > Label::MAX_LEN || s.contains('.') {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedRng, ManualClock};
    use crate::transport::Capture;

    fn responder() -> (Responder, Capture, ManualClock) {
        let capture = Capture::new();
        let clock = ManualClock::new();
        let responder = Responder::with_collaborators(
            Config {
                timer_tick_ms: 1,
                ..Config::default()
            },
            Box::new(clock.clone()),
            Box::new(FixedRng(0)),
            Box::new(capture.clone()),
        );
        (responder, capture, clock)
    }

    #[test]
    fn hostname_set_waits_for_executor() {
        let (responder, _capture, _clock) = responder();
        responder.hostname_set("alpha").unwrap();
        assert_eq!(responder.hostname(), "alpha");
    }

    #[test]
    fn invalid_names_rejected() {
        let (responder, _capture, _clock) = responder();
        assert_eq!(responder.hostname_set(""), Err(Error::InvalidArg));
        assert_eq!(responder.hostname_set("a.b"), Err(Error::InvalidArg));
        let long = "a".repeat(64);
        assert_eq!(responder.hostname_set(&long), Err(Error::InvalidArg));
    }

    #[test]
    fn service_add_requires_hostname() {
        let (responder, _capture, _clock) = responder();
        let desc = ServiceDesc::new("_http", Proto::Tcp, 80);
        assert_eq!(responder.service_add(desc), Err(Error::InvalidState));

        responder.hostname_set("alpha").unwrap();
        responder
            .service_add(ServiceDesc::new("_http", Proto::Tcp, 80))
            .unwrap();
        assert!(responder.service_exists("_http", Proto::Tcp));

        // The same tuple again is a conflict.
        assert_eq!(
            responder.service_add(ServiceDesc::new("_http", Proto::Tcp, 80)),
            Err(Error::AlreadyExists)
        );

        responder.service_remove("_http", Proto::Tcp).unwrap();
        assert!(!responder.service_exists("_http", Proto::Tcp));
    }

    #[test]
    fn unknown_service_is_not_found() {
        let (responder, _capture, _clock) = responder();
        assert_eq!(
            responder.service_port_set("_gone", Proto::Udp, 9),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn query_rejects_bad_spec() {
        let (responder, _capture, _clock) = responder();
        let spec = QuerySpec {
            instance: None,
            service: None,
            proto: None,
            qtype: crate::packet::QType::PTR,
            unicast: false,
            timeout_ms: 0,
            max_results: 1,
        };
        assert!(responder.query_async_new(spec).is_err());
    }
}
