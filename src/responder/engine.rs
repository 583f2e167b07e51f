//! The responder core.
//!
//! Everything here runs on the executor thread (or under the engine mutex
//! for the few read-only API calls). The engine owns the data model, the
//! interface table, the transmit queue and all active searches and browses,
//! and is driven exclusively by [`Action`]s plus the two periodic sweeps.

use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::mpsc::SyncSender;

use crate::clock::{Clock, Rng};
use crate::packet::decoder::{self, MessageDecoder};
use crate::packet::records::{Record, TXT};
use crate::packet::{Header, QClass, QType, Type};
use crate::transport::{IfaceId, IpFamily, RxFrame, Transport};
use crate::{Error, MAX_PACKET_SIZE};

use super::action::{post, Action, NetifEvent};
use super::browse::Browse;
use super::iface::{IfaceTable, PcbState};
use super::outbound::{self, AnswerData, HostRef, OutAnswer, OutQuestion, TxPacket, TTL_PTR};
use super::parsed::{ParsedPacket, ParsedQuestion, ParsedRecord, WireName};
use super::query::{Search, SearchState};
use super::registry::{mangle_name, Proto, Registry, Service, ServiceId, TxtItem};
use super::schedule::TxQueue;

/// Interval between repeated transmissions of an active search.
const SEARCH_RESEND_MS: u64 = 1000;

/// Outcome of comparing a conflicting record against our own data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Collision {
    WeWin,
    Tie,
    TheyWin,
}

pub(crate) struct EngineOpts {
    pub max_services: usize,
    pub max_interfaces: usize,
    pub respond_reverse_queries: bool,
    pub suppress_own_queries: bool,
    pub duplicate_pairs: Vec<(IfaceId, IfaceId)>,
}

pub(crate) struct Engine {
    clock: Box<dyn Clock>,
    rng: Box<dyn Rng>,
    transport: Box<dyn Transport>,
    actions: SyncSender<Action>,
    pub registry: Registry,
    pub ifaces: IfaceTable,
    pub txq: TxQueue,
    pub searches: Vec<Search>,
    pub browses: Vec<Browse>,
    next_handle: u64,
    /// Cycling step spreading shared answers over 25..100 ms.
    share_step: u8,
    reverse: bool,
    suppress_own: bool,
    pub stopped: bool,
}

impl Engine {
    pub fn new(
        opts: EngineOpts,
        clock: Box<dyn Clock>,
        rng: Box<dyn Rng>,
        transport: Box<dyn Transport>,
        actions: SyncSender<Action>,
    ) -> Self {
        let mut ifaces = IfaceTable::new(opts.max_interfaces);
        for (a, b) in &opts.duplicate_pairs {
            ifaces.set_dup_pair(*a, *b);
        }
        Self {
            clock,
            rng,
            transport,
            actions,
            registry: Registry::new(opts.max_services),
            ifaces,
            txq: TxQueue::new(),
            searches: Vec::new(),
            browses: Vec::new(),
            next_handle: 1,
            share_step: 0,
            reverse: opts.respond_reverse_queries,
            suppress_own: opts.suppress_own_queries,
            stopped: false,
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn jitter7(&mut self) -> u64 {
        u64::from(self.rng.next_u32() & 0x7F)
    }

    pub fn next_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    // ---- action loop ----------------------------------------------------

    pub fn execute(&mut self, action: Action) {
        match action {
            Action::SystemEvent {
                iface,
                family,
                event,
            } => self.netif_event(iface, family, event),
            Action::HostnameSet { hostname, done } => {
                self.hostname_set(hostname);
                let _ = done.try_send(());
            }
            Action::InstanceSet { instance } => {
                self.send_bye_all_no_instance(false);
                self.registry.instance = instance;
                self.restart_all_pcbs_no_instance();
            }
            Action::SearchAdd(search) => self.searches.push(*search),
            Action::SearchSend { id } => self.search_send(id),
            Action::SearchEnd { id } => self.search_finish(id),
            Action::BrowseAdd(browse) => self.browse_add(*browse),
            Action::BrowseSync { changes } => {
                for (browse_id, key) in changes {
                    if let Some(b) = self.browses.iter_mut().find(|b| b.id == browse_id) {
                        b.sync_one(key);
                    }
                }
            }
            Action::BrowseEnd { id } => {
                self.browses.retain(|b| b.id != id);
            }
            Action::TxHandle { packet } => match self.txq.take_head(packet) {
                Some(p) => self.tx_handle(p),
                None => log::debug!("skipping transmit of an unexpected packet"),
            },
            Action::RxHandle(frame) => self.parse_packet(&frame),
            Action::DelegateAdd {
                hostname,
                addrs,
                done,
            } => {
                if self.registry.hostname_is_ours(&hostname) {
                    log::debug!("delegated hostname {} already registered", hostname);
                } else {
                    self.registry.delegated.push(super::registry::DelegatedHost {
                        hostname,
                        addrs,
                    });
                }
                let _ = done.try_send(());
            }
            Action::DelegateSetAddrs { hostname, addrs } => {
                match self
                    .registry
                    .delegated
                    .iter_mut()
                    .find(|d| d.hostname.eq_ignore_ascii_case(&hostname))
                {
                    Some(host) => host.addrs = addrs,
                    None => log::debug!("no delegated hostname {}", hostname),
                }
            }
            Action::DelegateRemove { hostname, done } => {
                self.delegate_remove(&hostname);
                let _ = done.try_send(());
            }
            Action::Stop { done } => {
                self.final_bye();
                // Nobody must stay blocked on a search that will never end.
                let ids: Vec<_> = self.searches.iter().map(|s| s.id).collect();
                for id in ids {
                    self.search_finish(id);
                }
                self.stopped = true;
                let _ = done.try_send(());
            }
        }
    }

    // ---- interface lifecycle --------------------------------------------

    fn netif_event(&mut self, iface: IfaceId, family: IpFamily, event: NetifEvent) {
        match event {
            NetifEvent::Up(addr) => {
                if IpFamily::of(&addr) != family {
                    log::warn!("{}/{}: address family mismatch, ignoring", iface, family);
                    return;
                }
                let Some(pcb) = self.ifaces.pcb_mut(iface, family) else {
                    log::warn!("interface table full, ignoring {}", iface);
                    return;
                };
                pcb.addr = Some(addr);
                pcb.failed_probes = 0;
                if let Err(e) = self.transport.open(iface, family, addr) {
                    log::warn!("{}/{}: failed to open socket: {}", iface, family, e);
                    return;
                }
                if self.reverse {
                    let name = reverse_name(&addr);
                    if !self.registry.hostname_is_ours(&name) {
                        log::debug!("registered reverse query: {}.arpa", name);
                        self.registry
                            .delegated
                            .push(super::registry::DelegatedHost {
                                hostname: name,
                                addrs: Vec::new(),
                            });
                    }
                }
                self.restart_pcb(iface, family);
            }
            NetifEvent::Down => {
                let addr = self.ifaces.pcb(iface, family).and_then(|p| p.addr);
                self.txq.clear_pcb(iface, family);
                self.transport.close(iface, family);
                if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                    pcb.state = PcbState::Off;
                    pcb.addr = None;
                    pcb.clear_probe();
                }
                if self.reverse {
                    if let Some(addr) = addr {
                        let name = reverse_name(&addr);
                        self.registry
                            .delegated
                            .retain(|d| !d.hostname.eq_ignore_ascii_case(&name));
                    }
                }
                // Promote an interface that was silenced as our subnet
                // duplicate.
                if let Some(other) = self.ifaces.other_if(iface) {
                    let promoted = self
                        .ifaces
                        .pcb(other, family)
                        .map(|p| p.state == PcbState::Dup)
                        .unwrap_or(false);
                    if promoted {
                        if let Some(pcb) = self.ifaces.pcb_mut(other, family) {
                            pcb.state = PcbState::Off;
                        }
                        self.restart_pcb(other, family);
                    }
                }
            }
            NetifEvent::Announce => {
                let past = self
                    .ifaces
                    .pcb(iface, family)
                    .map(|p| p.state.is_past_probing())
                    .unwrap_or(false);
                if past {
                    let services = self.registry.service_ids();
                    self.announce_pcb(iface, family, &services, true);
                }
            }
        }
    }

    /// Re-probes everything we own on one PCB.
    fn restart_pcb(&mut self, iface: IfaceId, family: IpFamily) {
        let services = self.registry.service_ids();
        self.init_pcb_probe(iface, family, &services, true);
    }

    // ---- probing and announcing -----------------------------------------

    /// Starts (or merges into) the probe sequence on one PCB.
    fn init_pcb_probe(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        services: &[ServiceId],
        probe_ip: bool,
    ) {
        self.txq.clear_pcb(iface, family);

        let Some(pcb) = self.ifaces.pcb(iface, family) else {
            return;
        };
        if pcb.addr.is_none() {
            return;
        }
        if self.registry.hostname.is_empty() {
            // Nothing to defend yet.
            if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                pcb.state = PcbState::Running;
            }
            return;
        }

        // A probe already in flight is merged with the new services.
        let mut probe_set: Vec<ServiceId> = if pcb.state.is_probing() {
            pcb.probe_services.clone()
        } else {
            Vec::new()
        };
        for id in services {
            if !probe_set.contains(id) {
                probe_set.push(*id);
            }
        }
        let probe_ip = probe_ip || (pcb.state.is_probing() && pcb.probe_ip);
        let failed_probes = pcb.failed_probes;

        let packet = self.create_probe_packet(iface, family, &probe_set, true, probe_ip);
        if packet.is_empty() {
            return;
        }

        let delay = if failed_probes > 5 { 1000 } else { 120 } + self.jitter7();
        let now = self.now();
        self.txq.schedule(packet, delay, now);

        if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
            pcb.probe_services = probe_set;
            pcb.probe_ip = probe_ip;
            pcb.probe_running = true;
            pcb.state = PcbState::Probe1;
        }
    }

    /// Builds a probe: one ANY question per claimed name, with the records
    /// we intend to own in the authority section.
    fn create_probe_packet(
        &self,
        iface: IfaceId,
        family: IpFamily,
        services: &[ServiceId],
        first: bool,
        probe_ip: bool,
    ) -> TxPacket {
        let mut packet = TxPacket::new(iface, family);

        for id in services {
            let Some(entry) = self.registry.get(*id) else {
                continue;
            };
            let svc = &entry.service;
            let q = OutQuestion {
                qtype: QType::ANY,
                unicast: first,
                sub: false,
                host: Some(self.registry.instance_name_of(svc).to_owned()),
                service: Some(svc.service.clone()),
                proto: Some(svc.proto.as_str().to_owned()),
            };
            if !q.exists_in(&packet.questions) {
                packet.questions.push(q);
            }
            TxPacket::push_unique(
                &mut packet.authority,
                OutAnswer {
                    data: AnswerData::ServiceSrv(*id),
                    flush: false,
                    bye: false,
                },
            );
        }

        if probe_ip && !self.registry.hostname.is_empty() {
            let q = OutQuestion {
                qtype: QType::ANY,
                unicast: first,
                sub: false,
                host: Some(self.registry.hostname.clone()),
                service: None,
                proto: None,
            };
            if !q.exists_in(&packet.questions) {
                packet.questions.push(q);
            }
            TxPacket::push_unique(
                &mut packet.authority,
                OutAnswer {
                    data: AnswerData::HostA(HostRef::Own),
                    flush: false,
                    bye: false,
                },
            );
            TxPacket::push_unique(
                &mut packet.authority,
                OutAnswer {
                    data: AnswerData::HostAaaa(HostRef::Own),
                    flush: false,
                    bye: false,
                },
            );
        }

        packet
    }

    /// Converts a finished probe into the matching announcement.
    fn create_announce_from_probe(&self, probe: &TxPacket) -> TxPacket {
        let mut packet = TxPacket::new(probe.iface, probe.family);
        packet.authoritative = true;

        for answer in &probe.authority {
            match &answer.data {
                AnswerData::ServiceSrv(id) => {
                    for data in [
                        AnswerData::ServiceSdPtr(*id),
                        AnswerData::ServicePtr(*id),
                    ] {
                        TxPacket::push_unique(
                            &mut packet.answers,
                            OutAnswer {
                                data,
                                flush: false,
                                bye: false,
                            },
                        );
                    }
                    for data in [AnswerData::ServiceSrv(*id), AnswerData::ServiceTxt(*id)] {
                        TxPacket::push_unique(
                            &mut packet.answers,
                            OutAnswer {
                                data,
                                flush: true,
                                bye: false,
                            },
                        );
                    }
                    let host = match self.registry.get(*id) {
                        Some(e) if !e.service.hostname.eq_ignore_ascii_case(&self.registry.hostname) => {
                            HostRef::Delegated(e.service.hostname.clone())
                        }
                        _ => HostRef::Own,
                    };
                    for data in [
                        AnswerData::HostA(host.clone()),
                        AnswerData::HostAaaa(host),
                    ] {
                        TxPacket::push_unique(
                            &mut packet.answers,
                            OutAnswer {
                                data,
                                flush: true,
                                bye: false,
                            },
                        );
                    }
                }
                AnswerData::HostA(host) => TxPacket::push_unique(
                    &mut packet.answers,
                    OutAnswer {
                        data: AnswerData::HostA(host.clone()),
                        flush: true,
                        bye: false,
                    },
                ),
                AnswerData::HostAaaa(host) => TxPacket::push_unique(
                    &mut packet.answers,
                    OutAnswer {
                        data: AnswerData::HostAaaa(host.clone()),
                        flush: true,
                        bye: false,
                    },
                ),
                _ => {}
            }
        }

        packet
    }

    /// Schedules an announcement of `services` on one PCB that is already
    /// past probing.
    fn announce_pcb(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        services: &[ServiceId],
        include_ip: bool,
    ) {
        let Some(pcb) = self.ifaces.pcb(iface, family) else {
            return;
        };
        if !pcb.state.is_past_probing() {
            // Probing PCBs announce on their own once probing completes.
            return;
        }

        let mut packet = TxPacket::new(iface, family);
        packet.authoritative = true;
        for id in services {
            for (data, flush) in [
                (AnswerData::ServiceSdPtr(*id), false),
                (AnswerData::ServicePtr(*id), false),
                (AnswerData::ServiceSrv(*id), true),
                (AnswerData::ServiceTxt(*id), true),
            ] {
                TxPacket::push_unique(
                    &mut packet.answers,
                    OutAnswer {
                        data,
                        flush,
                        bye: false,
                    },
                );
            }
        }
        if include_ip {
            for data in [
                AnswerData::HostA(HostRef::Own),
                AnswerData::HostAaaa(HostRef::Own),
            ] {
                TxPacket::push_unique(
                    &mut packet.answers,
                    OutAnswer {
                        data,
                        flush: true,
                        bye: false,
                    },
                );
            }
        }
        if packet.is_empty() {
            return;
        }
        let now = self.now();
        self.txq.schedule(packet, 0, now);
    }

    /// Probes `services` on every enabled PCB.
    fn probe_all_pcbs(&mut self, services: &[ServiceId], probe_ip: bool) {
        for (iface, family) in self.ifaces.pairs() {
            let enabled = self
                .ifaces
                .pcb(iface, family)
                .map(|p| p.addr.is_some() && p.state != PcbState::Off && p.state != PcbState::Dup)
                .unwrap_or(false);
            if enabled {
                self.init_pcb_probe(iface, family, services, probe_ip);
            }
        }
    }

    fn announce_all_pcbs(&mut self, services: &[ServiceId], include_ip: bool) {
        for (iface, family) in self.ifaces.pairs() {
            self.announce_pcb(iface, family, services, include_ip);
        }
    }

    fn restart_all_pcbs(&mut self) {
        let services = self.registry.service_ids();
        for (iface, family) in self.ifaces.pairs() {
            let enabled = self
                .ifaces
                .pcb(iface, family)
                .map(|p| p.addr.is_some() && p.state != PcbState::Off && p.state != PcbState::Dup)
                .unwrap_or(false);
            if enabled {
                self.init_pcb_probe(iface, family, &services, true);
            }
        }
    }

    fn restart_all_pcbs_no_instance(&mut self) {
        let services: Vec<ServiceId> = self
            .registry
            .services()
            .iter()
            .filter(|e| e.service.instance.is_none())
            .map(|e| e.id)
            .collect();
        self.probe_all_pcbs(&services, false);
    }

    // ---- goodbyes --------------------------------------------------------

    /// Sends an immediate goodbye for `services` on one PCB.
    fn pcb_send_bye(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        services: &[ServiceId],
        include_ip: bool,
    ) {
        let mut packet = TxPacket::new(iface, family);
        packet.authoritative = true;
        for id in services {
            TxPacket::push_unique(
                &mut packet.answers,
                OutAnswer {
                    data: AnswerData::ServicePtr(*id),
                    flush: true,
                    bye: true,
                },
            );
        }
        if include_ip {
            for data in [
                AnswerData::HostA(HostRef::Own),
                AnswerData::HostAaaa(HostRef::Own),
            ] {
                TxPacket::push_unique(
                    &mut packet.answers,
                    OutAnswer {
                        data,
                        flush: true,
                        bye: true,
                    },
                );
            }
        }
        self.dispatch_now(&packet);
    }

    /// Sends a goodbye for `services` on every PCB past probing.
    fn send_bye(&mut self, services: &[ServiceId], include_ip: bool) {
        for (iface, family) in self.ifaces.pairs() {
            let ready = self
                .ifaces
                .pcb(iface, family)
                .map(|p| p.addr.is_some() && p.state.is_past_probing())
                .unwrap_or(false);
            if ready {
                self.pcb_send_bye(iface, family, services, include_ip);
            }
        }
    }

    fn send_bye_all_no_instance(&mut self, include_ip: bool) {
        let services: Vec<ServiceId> = self
            .registry
            .services()
            .iter()
            .filter(|e| e.service.instance.is_none())
            .map(|e| e.id)
            .collect();
        self.send_bye(&services, include_ip);
    }

    fn final_bye(&mut self) {
        let services = self.registry.service_ids();
        self.send_bye(&services, true);
    }

    // ---- transmit path ---------------------------------------------------

    /// Serializes and sends a packet right away.
    fn dispatch_now(&mut self, packet: &TxPacket) {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (len, records) = match outbound::assemble(packet, &self.registry, &self.ifaces, &mut buf)
        {
            Ok(v) => v,
            Err(e) => {
                log::warn!(
                    "{}/{}: dropping oversized or unencodable packet: {}",
                    packet.iface,
                    packet.family,
                    e
                );
                return;
            }
        };
        if records == 0 && packet.questions.is_empty() {
            return;
        }
        let dst = packet.destination();
        log::trace!(
            "{}/{}: tx {} bytes to {}: {}",
            packet.iface,
            packet.family,
            len,
            dst,
            crate::hex::Hex(&buf[..len]),
        );
        if let Err(e) = self
            .transport
            .send(packet.iface, packet.family, dst, &buf[..len])
        {
            // Best effort; the state machine retransmits on its own schedule.
            log::warn!("{}/{}: send failed: {}", packet.iface, packet.family, e);
        }
    }

    /// Sends a due packet and advances the owning PCB's state machine.
    fn tx_handle(&mut self, packet: TxPacket) {
        let (iface, family) = (packet.iface, packet.family);
        let state = match self.ifaces.pcb(iface, family) {
            Some(pcb) => pcb.state,
            None => return,
        };
        if state == PcbState::Off || state == PcbState::Dup {
            return;
        }

        self.dispatch_now(&packet);
        let now = self.now();

        match state {
            PcbState::Probe1 | PcbState::Probe2 => {
                let mut packet = packet;
                if state == PcbState::Probe1 {
                    // Only the first probe may request unicast responses.
                    for q in &mut packet.questions {
                        q.unicast = false;
                    }
                }
                self.txq.schedule(packet, 250, now);
                if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                    pcb.state = state.next();
                }
            }
            PcbState::Probe3 => {
                let announce = self.create_announce_from_probe(&packet);
                if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                    pcb.probe_running = false;
                    pcb.probe_ip = false;
                    pcb.probe_services.clear();
                    pcb.failed_probes = 0;
                    pcb.state = PcbState::Announce1;
                }
                self.txq.schedule(announce, 250, now);
            }
            PcbState::Announce1 | PcbState::Announce2 => {
                self.txq.schedule(packet, 1000, now);
                if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                    pcb.state = state.next();
                }
            }
            PcbState::Announce3 => {
                if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                    pcb.state = PcbState::Running;
                }
            }
            _ => {}
        }
    }

    // ---- sweeps ----------------------------------------------------------

    /// Hands every due packet to the action loop.
    pub fn scheduler_run(&mut self) {
        let now = self.now();
        for id in self.txq.due(now) {
            if post(&self.actions, Action::TxHandle { packet: id }).is_err() {
                // Queue full; the rest stays for the next tick.
                break;
            }
            self.txq.mark_queued(id);
        }
    }

    /// Advances search lifecycles: timeouts and periodic re-sends.
    pub fn search_run(&mut self) {
        let now = self.now();
        let mut posts = Vec::new();
        for s in &mut self.searches {
            if s.state == SearchState::Off {
                continue;
            }
            if now > s.started_at + s.spec.timeout_ms {
                s.state = SearchState::Off;
                posts.push((Action::SearchEnd { id: s.id }, s.id, true));
            } else if s.state == SearchState::Init || now.saturating_sub(s.sent_at) > SEARCH_RESEND_MS
            {
                s.state = SearchState::Running;
                s.sent_at = now;
                posts.push((Action::SearchSend { id: s.id }, s.id, false));
            }
        }
        for (action, id, ending) in posts {
            if post(&self.actions, action).is_err() {
                // Retry on the next tick.
                if let Some(s) = self.searches.iter_mut().find(|s| s.id == id) {
                    if ending {
                        s.state = SearchState::Running;
                    } else {
                        s.sent_at = s.sent_at.saturating_sub(SEARCH_RESEND_MS);
                    }
                }
            }
        }
    }

    // ---- searches and browses -------------------------------------------

    fn search_send(&mut self, id: u64) {
        let Some(idx) = self.searches.iter().position(|s| s.id == id) else {
            return;
        };

        let mut packets = Vec::new();
        for (iface, family) in self.ifaces.pairs() {
            let ready = self
                .ifaces
                .pcb(iface, family)
                .map(|p| {
                    p.addr.is_some()
                        && p.state != PcbState::Off
                        && p.state != PcbState::Init
                        && p.state != PcbState::Dup
                })
                .unwrap_or(false);
            if !ready {
                continue;
            }

            let s = &self.searches[idx];
            let mut packet = TxPacket::new(iface, family);
            packet.questions.push(OutQuestion {
                qtype: s.spec.qtype,
                unicast: s.spec.unicast,
                sub: false,
                host: s.spec.instance.clone(),
                service: s.spec.service.clone(),
                proto: s.spec.proto.map(|p| p.as_str().to_owned()),
            });

            if s.spec.qtype == QType::PTR {
                // Known-answer suppression: attach complete results.
                for r in &s.results {
                    if r.iface != iface || r.family != family {
                        continue;
                    }
                    let Some(instance) = &r.instance else {
                        continue;
                    };
                    if r.hostname.is_none() || r.addrs.is_empty() {
                        continue;
                    }
                    packet.answers.push(OutAnswer {
                        data: AnswerData::KnownPtr {
                            instance: instance.clone(),
                            service: s.spec.service.clone().unwrap_or_default(),
                            proto: s
                                .spec
                                .proto
                                .map(|p| p.as_str().to_owned())
                                .unwrap_or_default(),
                        },
                        flush: false,
                        bye: false,
                    });
                }
            }
            packets.push(packet);
        }

        for packet in packets {
            self.dispatch_now(&packet);
        }
    }

    fn search_finish(&mut self, id: u64) {
        let Some(idx) = self.searches.iter().position(|s| s.id == id) else {
            return;
        };
        let mut search = self.searches.remove(idx);
        search.finish();
    }

    /// Ends every search that has collected its fill.
    fn finish_done_searches(&mut self) {
        let ids: Vec<u64> = self
            .searches
            .iter()
            .filter(|s| s.reached_cap())
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.search_finish(id);
        }
    }

    fn browse_add(&mut self, browse: Browse) {
        let id = browse.id;
        self.browses.push(browse);
        self.browse_send(id);
    }

    fn browse_send(&mut self, id: u64) {
        let Some(browse) = self.browses.iter().find(|b| b.id == id) else {
            return;
        };
        let service = browse.service.clone();
        let proto = browse.proto;

        let mut packets = Vec::new();
        for (iface, family) in self.ifaces.pairs() {
            let ready = self
                .ifaces
                .pcb(iface, family)
                .map(|p| p.addr.is_some() && p.state != PcbState::Off && p.state != PcbState::Dup)
                .unwrap_or(false);
            if !ready {
                continue;
            }
            let mut packet = TxPacket::new(iface, family);
            packet.questions.push(OutQuestion {
                qtype: QType::PTR,
                unicast: false,
                sub: false,
                host: None,
                service: Some(service.clone()),
                proto: Some(proto.as_str().to_owned()),
            });
            packets.push(packet);
        }
        for packet in packets {
            self.dispatch_now(&packet);
        }
    }

    // ---- public-API mutations (called under the engine mutex) ------------

    pub fn hostname_set(&mut self, hostname: String) {
        self.send_bye_all_no_instance(true);
        let old = self.registry.hostname.clone();
        if !old.is_empty() {
            self.registry.remap_service_hostname(&old, &hostname);
        }
        self.registry.hostname = hostname;
        self.restart_all_pcbs();
    }

    pub fn service_add(&mut self, service: Service) -> Result<ServiceId, Error> {
        let id = self.registry.add(service)?;
        self.probe_all_pcbs(&[id], false);
        Ok(id)
    }

    pub fn service_remove(&mut self, id: ServiceId) {
        self.send_bye(&[id], false);
        self.txq.remove_service_refs(id);
        for (iface, family) in self.ifaces.pairs() {
            if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                pcb.probe_services.retain(|s| *s != id);
            }
        }
        self.registry.remove(id);
    }

    pub fn service_remove_all(&mut self) {
        let ids = self.registry.service_ids();
        if ids.is_empty() {
            return;
        }
        self.send_bye(&ids, false);
        for id in ids {
            self.txq.remove_service_refs(id);
            self.registry.remove(id);
        }
    }

    pub fn service_announce(&mut self, id: ServiceId) {
        self.announce_all_pcbs(&[id], false);
    }

    pub fn service_instance_set(&mut self, id: ServiceId, instance: String) {
        self.send_bye(&[id], false);
        if let Some(entry) = self.registry.get_mut(id) {
            entry.service.instance = Some(instance);
        }
        self.probe_all_pcbs(&[id], false);
    }

    pub fn subtype_bye(&mut self, id: ServiceId, subtype: String) {
        for (iface, family) in self.ifaces.pairs() {
            let ready = self
                .ifaces
                .pcb(iface, family)
                .map(|p| p.addr.is_some() && p.state.is_past_probing())
                .unwrap_or(false);
            if !ready {
                continue;
            }
            let mut packet = TxPacket::new(iface, family);
            packet.authoritative = true;
            packet.answers.push(OutAnswer {
                data: AnswerData::SubtypePtr {
                    id,
                    subtype: subtype.clone(),
                },
                flush: false,
                bye: true,
            });
            self.dispatch_now(&packet);
        }
    }

    fn delegate_remove(&mut self, hostname: &str) {
        let bound: Vec<ServiceId> = self
            .registry
            .services()
            .iter()
            .filter(|e| e.service.hostname.eq_ignore_ascii_case(hostname))
            .map(|e| e.id)
            .collect();
        if !bound.is_empty() {
            self.send_bye(&bound, false);
            for id in &bound {
                self.txq.remove_service_refs(*id);
                self.registry.remove(*id);
            }
        }
        self.registry
            .delegated
            .retain(|d| !d.hostname.eq_ignore_ascii_case(hostname));
    }

    // ---- inbound path ----------------------------------------------------

    fn name_is_ours(&self, name: &WireName) -> bool {
        if name.invalid {
            return false;
        }
        if name.host_only() {
            return !name.host.is_empty() && self.registry.hostname_is_ours(&name.host);
        }
        if name.service.is_empty() || name.proto.is_empty() {
            return false;
        }
        let Some(proto) = Proto::from_label(&name.proto) else {
            return false;
        };
        if name.sub {
            self.registry
                .find_subtype(&name.host, &name.service, proto)
                .is_some()
        } else if name.host.is_empty() {
            self.registry.find(&name.service, proto, None).is_some()
        } else {
            self.registry
                .find_instance(Some(&name.host), &name.service, proto, None)
                .is_some()
        }
    }

    fn name_is_selfhosted(&self, name: &WireName) -> bool {
        if self.registry.hostname.is_empty() {
            return false;
        }
        if name.host_only() {
            return self.registry.hostname.eq_ignore_ascii_case(&name.host);
        }
        let Some(proto) = Proto::from_label(&name.proto) else {
            return false;
        };
        self.registry
            .find(&name.service, proto, None)
            .map(|e| {
                e.service
                    .hostname
                    .eq_ignore_ascii_case(&self.registry.hostname)
            })
            .unwrap_or(false)
    }

    /// Parses one inbound datagram and dispatches its contents.
    pub fn parse_packet(&mut self, frame: &RxFrame) {
        // Our own multicast comes back to us; ignore it.
        if self.suppress_own {
            let own = self
                .ifaces
                .pcb(frame.iface, frame.family)
                .and_then(|p| p.addr);
            if own == Some(frame.src) {
                return;
            }
        }
        if frame.payload.len() <= Header::SIZE {
            return;
        }

        match self.parse_packet_inner(frame) {
            Ok(()) => {}
            Err(e) => {
                log::debug!("{}/{}: dropped packet: {}", frame.iface, frame.family, e);
            }
        }
    }

    fn parse_packet_inner(&mut self, frame: &RxFrame) -> Result<(), crate::packet::Error> {
        let mut dec = MessageDecoder::new(&frame.payload)?;
        let header = *dec.header();
        let is_response = header.is_response();
        let authoritative = is_response && header.is_authority();
        log::trace!(
            "{}/{}: rx from {}:{}{}: {}",
            frame.iface,
            frame.family,
            frame.src,
            frame.src_port,
            if frame.multicast { " (multicast)" } else { "" },
            crate::hex::Hex(&frame.payload),
        );
        if log::log_enabled!(log::Level::Trace) {
            if let Ok(walker) = MessageDecoder::new(&frame.payload) {
                let _ = walker.format(|args| log::trace!("  {}", args));
            }
        }

        // Responses must come from the mDNS port to be trusted.
        if authoritative && frame.src_port != crate::MDNS_PORT {
            return Ok(());
        }
        // Without a hostname we cannot answer anything.
        if header.question_count() > 0
            && header.answer_count() == 0
            && self.registry.hostname.is_empty()
        {
            return Ok(());
        }

        let mut parsed = ParsedPacket {
            iface: frame.iface,
            family: frame.family,
            src: frame.src,
            src_port: frame.src_port,
            id: header.id(),
            authoritative,
            probe: false,
            discovery: false,
            questions: Vec::new(),
            records: Vec::new(),
        };

        while let Some(q) = dec.next() {
            let q = q?;
            let name = WireName::classify(q.qname(), self.reverse);
            if q.qclass() != QClass::IN || name.invalid {
                continue;
            }

            if name.is_discovery(q.qtype()) {
                parsed.discovery = true;
                for entry in self.registry.services() {
                    parsed.questions.push(ParsedQuestion {
                        qtype: QType::PTR,
                        unicast: q.unicast_response(),
                        sub: false,
                        discovery: true,
                        host: None,
                        service: Some(entry.service.service.clone()),
                        proto: Some(entry.service.proto.as_str().to_owned()),
                    });
                }
                continue;
            }
            if !self.name_is_ours(&name) {
                continue;
            }
            if q.qtype() == QType::ANY && !name.host.is_empty() {
                parsed.probe = true;
            }
            parsed.questions.push(ParsedQuestion {
                qtype: q.qtype(),
                unicast: q.unicast_response(),
                sub: name.sub,
                discovery: false,
                host: (!name.host.is_empty()).then(|| name.host.clone()),
                service: (!name.service.is_empty()).then(|| name.service.clone()),
                proto: (!name.proto.is_empty()).then(|| name.proto.clone()),
            });
        }

        let has_records = header.answer_count() > 0
            || header.authoritative_count() > 0
            || header.additional_count() > 0;
        if header.question_count() > 0
            && parsed.questions.is_empty()
            && !parsed.discovery
            && !has_records
        {
            return Ok(());
        }

        let mut do_not_reply = false;
        let mut browse_changes: Vec<(u64, u64)> = Vec::new();

        if has_records {
            let mut dec = dec.answers()?;
            let mut flow = ControlFlow::Continue(());
            while let Some(rr) = dec.next() {
                let rr = rr?;
                flow = self.handle_record(
                    &mut parsed,
                    false,
                    &rr,
                    is_response,
                    &mut browse_changes,
                    &mut do_not_reply,
                );
                if flow.is_break() {
                    break;
                }
            }
            if flow.is_continue() {
                let mut dec = dec.authority()?;
                while let Some(rr) = dec.next() {
                    let rr = rr?;
                    flow = self.handle_record(
                        &mut parsed,
                        true,
                        &rr,
                        is_response,
                        &mut browse_changes,
                        &mut do_not_reply,
                    );
                    if flow.is_break() {
                        break;
                    }
                }
                if flow.is_continue() {
                    let mut dec = dec.additional()?;
                    while let Some(rr) = dec.next() {
                        let rr = rr?;
                        flow = self.handle_record(
                            &mut parsed,
                            false,
                            &rr,
                            is_response,
                            &mut browse_changes,
                            &mut do_not_reply,
                        );
                        if flow.is_break() {
                            break;
                        }
                    }
                }
            }
            if flow.is_break() {
                // A subnet duplicate was detected; the packet is abandoned.
                return Ok(());
            }

            if parsed.authoritative {
                self.finish_done_searches();
            }
        }

        let past_probing = self
            .ifaces
            .pcb(frame.iface, frame.family)
            .map(|p| p.state.is_past_probing())
            .unwrap_or(false);
        if !do_not_reply && past_probing && !parsed.questions.is_empty() {
            self.create_answer_from_parsed(&parsed);
        }

        if !browse_changes.is_empty() {
            // One notification per result, no matter how many records of the
            // packet touched it.
            let mut changes: Vec<(u64, u64)> = Vec::new();
            for c in browse_changes {
                if !changes.contains(&c) {
                    changes.push(c);
                }
            }
            if post(&self.actions, Action::BrowseSync { changes }).is_err() {
                log::debug!("action queue full, dropping browse sync");
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_record(
        &mut self,
        parsed: &mut ParsedPacket,
        authority_section: bool,
        rr: &decoder::ResourceRecord<'_>,
        is_response: bool,
        browse_changes: &mut Vec<(u64, u64)>,
        do_not_reply: &mut bool,
    ) -> ControlFlow<()> {
        let rtype = rr.type_();
        if rtype == Type::NSEC || rtype == Type::OPT {
            return ControlFlow::Continue(());
        }

        let name = WireName::classify(rr.name(), self.reverse);
        let ttl = rr.ttl();
        let class_raw = rr.class().0;
        let iface = parsed.iface;
        let family = parsed.family;

        let mut discovery = false;
        let mut ours = false;
        let mut service_id: Option<ServiceId> = None;
        let mut search_hits: Vec<usize> = Vec::new();
        let mut browse_hit: Option<usize> = None;

        if parsed.discovery && name.is_discovery(QType(rtype.0)) {
            discovery = true;
        } else if !name.sub && self.name_is_ours(&name) {
            ours = true;
            if !name.service.is_empty() && !name.proto.is_empty() {
                if let Some(proto) = Proto::from_label(&name.proto) {
                    service_id = self
                        .registry
                        .find(&name.service, proto, None)
                        .map(|e| e.id);
                }
            }
        } else {
            // Records that are not about us are only interesting in
            // responses, and never from the authority section.
            if !is_response || authority_section {
                return ControlFlow::Continue(());
            }
            if rtype == Type::A || rtype == Type::AAAA {
                search_hits = self
                    .searches
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.matches(&name, rtype, iface, family))
                    .map(|(i, _)| i)
                    .collect();
            } else if let Some(i) = self
                .searches
                .iter()
                .position(|s| s.matches(&name, rtype, iface, family))
            {
                search_hits.push(i);
            }
            browse_hit = self
                .browses
                .iter()
                .position(|b| b.matches(&name, rtype, iface, family));

            let ptr_goodbye = rtype == Type::PTR && ttl == 0;
            if search_hits.is_empty() && browse_hit.is_none() && !ptr_goodbye {
                return ControlFlow::Continue(());
            }
        }

        match rtype {
            Type::PTR => {
                let Some(Ok(Record::PTR(ptr))) = rr.as_enum() else {
                    return ControlFlow::Continue(());
                };
                let target = WireName::classify(ptr.ptrdname(), self.reverse);

                if let Some(&si) = search_hits.first() {
                    self.searches[si].add_ptr(
                        &target.host,
                        &target.service,
                        &target.proto,
                        iface,
                        family,
                        ttl,
                    );
                } else if (discovery || ours) && !name.sub && self.name_is_ours(&target) {
                    let proto = Proto::from_label(&target.proto);
                    let service = proto.and_then(|p| {
                        if target.host.is_empty() {
                            self.registry.find(&target.service, p, None)
                        } else {
                            self.registry
                                .find_instance(Some(&target.host), &target.service, p, None)
                        }
                    });
                    let service = service.map(|e| e.id);
                    if let Some(id) = service {
                        if discovery {
                            self.remove_parsed_question(parsed, Type::PTR, Some(id), true);
                        } else if !parsed.questions.is_empty() && !parsed.probe {
                            self.remove_parsed_question(parsed, Type::PTR, Some(id), false);
                        } else if ttl > TTL_PTR / 2 {
                            self.txq.remove_answer(iface, family, Type::PTR, Some(id));
                        }
                        parsed.records.push(ParsedRecord {
                            rtype: Type::PTR,
                            ttl,
                            instance: (!target.host.is_empty()).then(|| target.host.clone()),
                            service: Some(target.service.clone()),
                            proto: Some(target.proto.clone()),
                        });
                    }
                }

                // A goodbye PTR removes the instance from matching browses.
                if ttl == 0 && is_response {
                    let instance = target.host.clone();
                    let mut changed = Vec::new();
                    for b in &mut self.browses {
                        if b.service.eq_ignore_ascii_case(&target.service)
                            && Proto::from_label(&target.proto) == Some(b.proto)
                        {
                            if let Some(key) = b.mark_removed(&instance, iface, family) {
                                changed.push((b.id, key));
                            }
                        }
                    }
                    browse_changes.extend(changed);
                }
            }
            Type::SRV => {
                let Some(Ok(Record::SRV(srv))) = rr.as_enum() else {
                    return ControlFlow::Continue(());
                };
                let target = WireName::classify(srv.target(), self.reverse);
                let port = srv.port();

                if let Some(bi) = browse_hit {
                    if let Some(key) = self.browses[bi].add_srv(
                        &target.host,
                        &name.host,
                        port,
                        iface,
                        family,
                        ttl,
                    ) {
                        browse_changes.push((self.browses[bi].id, key));
                    }
                }

                if let Some(&si) = search_hits.first() {
                    let s = &mut self.searches[si];
                    if s.spec.qtype == QType::PTR {
                        if let Some(idx) =
                            s.add_ptr(&name.host, &name.service, &name.proto, iface, family, ttl)
                        {
                            let r = &mut s.results[idx];
                            if r.hostname.is_none() {
                                r.hostname = Some(target.host.clone());
                                r.port = port;
                            }
                            r.merge_ttl(ttl);
                        }
                    } else {
                        s.add_srv(&target.host, port, iface, family, ttl);
                    }
                } else if ours {
                    if !parsed.questions.is_empty() && !parsed.probe {
                        self.remove_parsed_question(parsed, Type::SRV, service_id, false);
                        return ControlFlow::Continue(());
                    }
                    if !self.name_is_selfhosted(&name) {
                        return ControlFlow::Continue(());
                    }
                    let col = if class_raw > 1 {
                        Collision::TheyWin
                    } else if class_raw == 0 || ttl == 0 {
                        Collision::WeWin
                    } else if let Some(id) = service_id {
                        self.compare_srv(id, srv.priority(), srv.weight(), port, &target)
                    } else {
                        Collision::Tie
                    };

                    if let Some(id) = service_id {
                        if col != Collision::Tie && (parsed.probe || parsed.authoritative) {
                            if col == Collision::TheyWin {
                                *do_not_reply = true;
                                let probing = self
                                    .ifaces
                                    .pcb(iface, family)
                                    .map(|p| p.probe_running)
                                    .unwrap_or(false);
                                if probing {
                                    if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                                        pcb.failed_probes = pcb.failed_probes.saturating_add(1);
                                    }
                                    self.rename_after_collision(id);
                                } else {
                                    self.pcb_send_bye(iface, family, &[id], false);
                                    self.init_pcb_probe(iface, family, &[id], false);
                                }
                            }
                        } else if ttl > 60
                            && col == Collision::Tie
                            && !parsed.authoritative
                            && !parsed.probe
                            && parsed.questions.is_empty()
                        {
                            self.txq.remove_answer(iface, family, Type::SRV, Some(id));
                        }
                    }
                }
            }
            Type::TXT => {
                let Some(Ok(Record::TXT(txt))) = rr.as_enum() else {
                    return ControlFlow::Continue(());
                };
                let items = txt_items_from(&txt);

                if let Some(bi) = browse_hit {
                    if let Some(key) =
                        self.browses[bi].add_txt(&name.host, items.clone(), iface, family, ttl)
                    {
                        browse_changes.push((self.browses[bi].id, key));
                    }
                }

                if let Some(&si) = search_hits.first() {
                    let s = &mut self.searches[si];
                    if s.spec.qtype == QType::PTR {
                        if let Some(idx) =
                            s.add_ptr(&name.host, &name.service, &name.proto, iface, family, ttl)
                        {
                            let r = &mut s.results[idx];
                            if r.txt.is_empty() {
                                r.txt = items;
                            }
                            r.merge_ttl(ttl);
                        }
                    } else {
                        s.add_txt(items, iface, family, ttl);
                    }
                } else if ours {
                    if !parsed.questions.is_empty() && !parsed.probe && service_id.is_some() {
                        self.remove_parsed_question(parsed, Type::TXT, service_id, false);
                        return ControlFlow::Continue(());
                    }
                    if !self.name_is_selfhosted(&name) {
                        return ControlFlow::Continue(());
                    }
                    let col = if class_raw > 1 {
                        Collision::TheyWin
                    } else if class_raw == 0 || ttl == 0 {
                        Collision::WeWin
                    } else if let Some(id) = service_id {
                        self.compare_txt(id, rr.rdata())
                    } else {
                        Collision::Tie
                    };
                    let probing = self
                        .ifaces
                        .pcb(iface, family)
                        .map(|p| p.probe_running)
                        .unwrap_or(false);
                    if let Some(id) = service_id {
                        if col != Collision::Tie && !probing {
                            // Any TXT mismatch re-asserts our data by
                            // re-probing the service and our addresses.
                            *do_not_reply = true;
                            self.init_pcb_probe(iface, family, &[id], true);
                        } else if ttl > outbound::TTL_UNIQUE / 2
                            && col == Collision::Tie
                            && !parsed.authoritative
                            && !parsed.probe
                            && parsed.questions.is_empty()
                            && !probing
                        {
                            self.txq.remove_answer(iface, family, Type::TXT, Some(id));
                        }
                    }
                }
            }
            Type::A | Type::AAAA => {
                let addr: IpAddr = match rr.as_enum() {
                    Some(Ok(Record::A(a))) => IpAddr::V4(a.addr()),
                    Some(Ok(Record::AAAA(aaaa))) => IpAddr::V6(aaaa.addr()),
                    _ => return ControlFlow::Continue(()),
                };

                if let Some(bi) = browse_hit {
                    for key in self.browses[bi].add_ip(&name.host, addr, iface, family, ttl) {
                        browse_changes.push((self.browses[bi].id, key));
                    }
                }

                if !search_hits.is_empty() {
                    for si in search_hits {
                        self.searches[si].add_ip(&name.host, addr, iface, family, ttl);
                    }
                } else if ours {
                    if !parsed.questions.is_empty() && !parsed.probe {
                        self.remove_parsed_question(parsed, rtype, None, false);
                        return ControlFlow::Continue(());
                    }
                    if !self.name_is_selfhosted(&name) {
                        return ControlFlow::Continue(());
                    }
                    let col = if class_raw > 1 {
                        Some(Collision::TheyWin)
                    } else if class_raw == 0 || ttl == 0 {
                        Some(Collision::WeWin)
                    } else {
                        match self.check_addr_collision(addr, iface, family) {
                            AddrCheck::Collision(col) => Some(col),
                            AddrCheck::SubnetDuplicate => {
                                self.dup_interface(iface);
                                return ControlFlow::Break(());
                            }
                        }
                    };

                    let probing = self
                        .ifaces
                        .pcb(iface, family)
                        .map(|p| p.probe_running)
                        .unwrap_or(false);
                    if col == Some(Collision::TheyWin) {
                        *do_not_reply = true;
                        if probing {
                            if parsed.probe || parsed.authoritative {
                                if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                                    pcb.failed_probes = pcb.failed_probes.saturating_add(1);
                                }
                                self.rename_hostname();
                            }
                        } else {
                            self.init_pcb_probe(iface, family, &[], true);
                        }
                    } else if ttl > 60
                        && col == Some(Collision::Tie)
                        && !parsed.authoritative
                        && !parsed.probe
                        && parsed.questions.is_empty()
                        && !probing
                    {
                        self.txq.remove_answer(iface, family, rtype, None);
                    }
                }
            }
            _ => {}
        }

        ControlFlow::Continue(())
    }

    // ---- collision handling ----------------------------------------------

    /// Compares a conflicting SRV record against ours, serialized, length
    /// first, then bytewise. The larger data wins.
    fn compare_srv(
        &self,
        id: ServiceId,
        priority: u16,
        weight: u16,
        port: u16,
        target: &WireName,
    ) -> Collision {
        let Some(entry) = self.registry.get(id) else {
            return Collision::Tie;
        };
        let svc = &entry.service;

        let ours = srv_rdata(
            svc.priority,
            svc.weight,
            svc.port,
            &self.registry.hostname,
            "local",
        );
        let theirs = srv_rdata(priority, weight, port, &target.host, &target.domain);
        compare_rdata(&ours, &theirs)
    }

    fn compare_txt(&self, id: ServiceId, their_rdata: &[u8]) -> Collision {
        let Some(entry) = self.registry.get(id) else {
            return Collision::Tie;
        };
        let ours = entry.service.packed_txt();
        compare_rdata(&ours, their_rdata)
    }

    fn check_addr_collision(&self, addr: IpAddr, iface: IfaceId, family: IpFamily) -> AddrCheck {
        let Some(our) = self.ifaces.pcb(iface, family).and_then(|p| p.addr) else {
            return AddrCheck::Collision(Collision::TheyWin);
        };
        if our == addr {
            return AddrCheck::Collision(Collision::Tie);
        }
        let (ours, theirs) = (addr_octets(&our), addr_octets(&addr));
        match compare_rdata(&ours, &theirs) {
            Collision::WeWin => AddrCheck::Collision(Collision::WeWin),
            _ => {
                // Their address may actually be our other interface on the
                // same subnet.
                if let Some(other) = self.ifaces.other_if(iface) {
                    if self.ifaces.pcb(other, family).and_then(|p| p.addr) == Some(addr) {
                        return AddrCheck::SubnetDuplicate;
                    }
                }
                AddrCheck::Collision(Collision::TheyWin)
            }
        }
    }

    /// Silences this interface; the configured peer owns all responses.
    fn dup_interface(&mut self, iface: IfaceId) {
        let Some(other) = self.ifaces.other_if(iface) else {
            return;
        };
        for family in [IpFamily::V4, IpFamily::V6] {
            let other_up = self
                .ifaces
                .pcb(other, family)
                .map(|p| p.addr.is_some() && p.state != PcbState::Off)
                .unwrap_or(false);
            if !other_up {
                continue;
            }
            self.txq.clear_pcb(iface, family);
            if let Some(pcb) = self.ifaces.pcb_mut(iface, family) {
                if pcb.addr.is_some() {
                    pcb.state = PcbState::Dup;
                    pcb.clear_probe();
                }
            }
            let services = self.registry.service_ids();
            self.announce_pcb(other, family, &services, true);
        }
    }

    /// Picks the rename target after a lost service probe: the service's
    /// own instance name, the default instance name, or the hostname.
    fn rename_after_collision(&mut self, id: ServiceId) {
        let instance = self.registry.get(id).and_then(|e| e.service.instance.clone());
        if let Some(instance) = instance {
            let new = mangle_name(&instance);
            log::info!("instance name collision, renaming to {}", new);
            if let Some(entry) = self.registry.get_mut(id) {
                entry.service.instance = Some(new);
            }
            self.probe_all_pcbs(&[id], false);
        } else if let Some(instance) = self.registry.instance.clone() {
            let new = mangle_name(&instance);
            log::info!("default instance collision, renaming to {}", new);
            self.registry.instance = Some(new);
            self.restart_all_pcbs_no_instance();
        } else {
            self.rename_hostname();
        }
    }

    fn rename_hostname(&mut self) {
        let old = self.registry.hostname.clone();
        if old.is_empty() {
            return;
        }
        let new = mangle_name(&old);
        log::info!("hostname collision, renaming to {}", new);
        self.registry.remap_service_hostname(&old, &new);
        self.registry.hostname = new;
        self.restart_all_pcbs();
    }

    // ---- answering -------------------------------------------------------

    /// Drops the pending question that `rtype`+`service` satisfies.
    fn remove_parsed_question(
        &self,
        parsed: &mut ParsedPacket,
        rtype: Type,
        service: Option<ServiceId>,
        discovery: bool,
    ) {
        let entry = service.and_then(|id| self.registry.get(id));
        let pos = parsed.questions.iter().position(|q| {
            if q.discovery != discovery {
                return false;
            }
            match rtype {
                Type::A | Type::AAAA => q.qtype.0 == rtype.0,
                Type::PTR => {
                    let Some(entry) = entry else { return false };
                    if q.qtype != QType::PTR && !discovery {
                        return false;
                    }
                    let svc = &entry.service;
                    let service_match = q
                        .service
                        .as_deref()
                        .map(|s| svc.service.eq_ignore_ascii_case(s))
                        .unwrap_or(false)
                        && q.proto
                            .as_deref()
                            .map(|p| Proto::from_label(p) == Some(svc.proto))
                            .unwrap_or(false);
                    if !service_match {
                        return false;
                    }
                    match (&q.host, &svc.instance) {
                        (None, _) => true,
                        (Some(host), _) => self
                            .registry
                            .instance_name_of(svc)
                            .eq_ignore_ascii_case(host),
                    }
                }
                Type::SRV | Type::TXT => {
                    let Some(entry) = entry else { return false };
                    if q.qtype.0 != rtype.0 {
                        return false;
                    }
                    let svc = &entry.service;
                    q.host
                        .as_deref()
                        .map(|h| self.registry.instance_name_of(svc).eq_ignore_ascii_case(h))
                        .unwrap_or(false)
                        && q.service
                            .as_deref()
                            .map(|s| svc.service.eq_ignore_ascii_case(s))
                            .unwrap_or(false)
                        && q.proto
                            .as_deref()
                            .map(|p| Proto::from_label(p) == Some(svc.proto))
                            .unwrap_or(false)
                }
                _ => false,
            }
        });
        if let Some(pos) = pos {
            parsed.questions.remove(pos);
        }
    }

    /// Whether a PTR answer in the same packet already satisfies a PTR
    /// answer we would give for `id` (known-answer suppression).
    fn record_satisfies_service(&self, parsed: &ParsedPacket, id: ServiceId) -> bool {
        let Some(entry) = self.registry.get(id) else {
            return false;
        };
        let svc = &entry.service;
        parsed.records.iter().any(|r| {
            if r.rtype != Type::PTR || r.ttl <= TTL_PTR / 2 {
                return false;
            }
            let service_match = r
                .service
                .as_deref()
                .map(|s| svc.service.eq_ignore_ascii_case(s))
                .unwrap_or(false)
                && r.proto
                    .as_deref()
                    .map(|p| Proto::from_label(p) == Some(svc.proto))
                    .unwrap_or(false);
            if !service_match {
                return false;
            }
            match &r.instance {
                Some(instance) => self
                    .registry
                    .instance_name_of(svc)
                    .eq_ignore_ascii_case(instance),
                None => svc.instance.is_none(),
            }
        })
    }

    /// Builds and schedules (or immediately sends) the response to a parsed
    /// packet.
    fn create_answer_from_parsed(&mut self, parsed: &ParsedPacket) {
        if parsed.questions.is_empty() {
            return;
        }
        let send_flush = parsed.src_port == crate::MDNS_PORT;
        let mut unicast = false;
        let mut shared = false;

        let mut packet = TxPacket::new(parsed.iface, parsed.family);
        packet.authoritative = true;
        packet.msg_id = parsed.id;
        let mut records = 0usize;

        for q in &parsed.questions {
            shared = q.qtype == QType::PTR || q.discovery || !parsed.probe;

            if q.discovery {
                let proto = q.proto.as_deref().and_then(Proto::from_label);
                let entry = match (q.service.as_deref(), proto) {
                    (Some(service), Some(proto)) => self.registry.find(service, proto, None),
                    _ => None,
                };
                if let Some(entry) = entry {
                    TxPacket::push_unique(
                        &mut packet.answers,
                        OutAnswer {
                            data: AnswerData::ServiceSdPtr(entry.id),
                            flush: false,
                            bye: false,
                        },
                    );
                    records += 1;
                }
            } else if q.qtype == QType::SRV || q.qtype == QType::TXT {
                let proto = q.proto.as_deref().and_then(Proto::from_label);
                let entry = match (q.host.as_deref(), q.service.as_deref(), proto) {
                    (Some(host), Some(service), Some(proto)) => {
                        self.registry.find_instance(Some(host), service, proto, None)
                    }
                    _ => None,
                };
                let Some(entry) = entry else { continue };
                let id = entry.id;
                records +=
                    self.answer_from_service(&mut packet, id, q.qtype, shared, send_flush);
            } else if q.service.is_some() && q.proto.is_some() {
                // PTR (or subtype) question over a service type.
                let proto = q.proto.as_deref().and_then(Proto::from_label);
                let Some(proto) = proto else { continue };
                let service_name = q.service.clone().unwrap_or_default();

                let matching: Vec<ServiceId> = self
                    .registry
                    .services()
                    .iter()
                    .filter(|e| {
                        let svc = &e.service;
                        if !svc.service.eq_ignore_ascii_case(&service_name) || svc.proto != proto {
                            return false;
                        }
                        if q.sub {
                            return q
                                .host
                                .as_deref()
                                .map(|sub| {
                                    svc.subtypes.iter().any(|s| s.eq_ignore_ascii_case(sub))
                                })
                                .unwrap_or(false);
                        }
                        match q.host.as_deref() {
                            Some(host) => self
                                .registry
                                .instance_name_of(svc)
                                .eq_ignore_ascii_case(host),
                            None => true,
                        }
                    })
                    .map(|e| e.id)
                    .collect();

                for id in matching {
                    if self.record_satisfies_service(parsed, id) {
                        continue;
                    }
                    if q.sub {
                        if let Some(sub) = q.host.clone() {
                            TxPacket::push_unique(
                                &mut packet.answers,
                                OutAnswer {
                                    data: AnswerData::SubtypePtr { id, subtype: sub },
                                    flush: false,
                                    bye: false,
                                },
                            );
                            records += 1;
                        }
                    }
                    records +=
                        self.answer_from_service(&mut packet, id, QType::PTR, shared, send_flush);
                }
            } else if q.qtype == QType::A || q.qtype == QType::AAAA {
                if let Some(host) = q.host.as_deref() {
                    records += self.answer_from_hostname(&mut packet, host, send_flush);
                }
            } else if q.qtype == QType::ANY {
                // Probe defence: ship every record for the probed host.
                if let Some(host) = q.host.as_deref() {
                    records += self.answer_from_hostname(&mut packet, host, send_flush);
                }
            } else if q.qtype == QType::PTR && self.reverse {
                if let Some(host) = q.host.as_deref() {
                    if host.contains("in-addr") || host.contains("ip6") {
                        TxPacket::push_unique(
                            &mut packet.answers,
                            OutAnswer {
                                data: AnswerData::ReversePtr(host.to_owned()),
                                flush: false,
                                bye: false,
                            },
                        );
                        records += 1;
                    }
                }
            }

            // Legacy one-shot queriers get the question echoed back.
            if parsed.src_port != crate::MDNS_PORT
                && matches!(q.qtype, QType::ANY | QType::A | QType::AAAA | QType::PTR)
            {
                let out = OutQuestion {
                    qtype: q.qtype,
                    unicast: q.unicast,
                    sub: q.sub,
                    host: q.host.clone(),
                    service: q.service.clone(),
                    proto: q.proto.clone(),
                };
                if !out.exists_in(&packet.questions) {
                    packet.questions.push(out);
                }
            }
            if q.unicast {
                unicast = true;
            }
        }

        if records == 0 {
            return;
        }
        if unicast || !send_flush {
            packet.dst = Some(std::net::SocketAddr::new(parsed.src, parsed.src_port));
        }

        if shared {
            let delay = 25 + u64::from(self.share_step) * 25;
            self.share_step = (self.share_step + 1) & 0x03;
            let now = self.now();
            self.txq.schedule(packet, delay, now);
        } else {
            self.dispatch_now(&packet);
        }
    }

    /// Adds the answer set for one service per the composition policy.
    /// Returns the number of symbolic answers added.
    fn answer_from_service(
        &self,
        packet: &mut TxPacket,
        id: ServiceId,
        qtype: QType,
        shared: bool,
        send_flush: bool,
    ) -> usize {
        let Some(entry) = self.registry.get(id) else {
            return 0;
        };
        let svc = &entry.service;
        let selfhost = svc.hostname.eq_ignore_ascii_case(&self.registry.hostname);
        let host = if selfhost {
            HostRef::Own
        } else {
            HostRef::Delegated(svc.hostname.clone())
        };
        let mut added = 0;

        let mut push = |answers: &mut Vec<OutAnswer>, data: AnswerData, flush: bool| {
            TxPacket::push_unique(
                answers,
                OutAnswer {
                    data,
                    flush,
                    bye: false,
                },
            );
        };

        if qtype == QType::PTR || qtype == QType::ANY {
            push(&mut packet.answers, AnswerData::ServicePtr(id), false);
            // Delegated services are not ours from a DNS-SD standpoint;
            // their details ride along in the additional section.
            let detail = if selfhost {
                &mut packet.answers
            } else {
                &mut packet.additional
            };
            push(detail, AnswerData::ServiceSrv(id), send_flush);
            let detail = if selfhost {
                &mut packet.answers
            } else {
                &mut packet.additional
            };
            push(detail, AnswerData::ServiceTxt(id), send_flush);
            let addr_section = if shared || !selfhost {
                &mut packet.additional
            } else {
                &mut packet.answers
            };
            push(addr_section, AnswerData::HostA(host.clone()), send_flush);
            let addr_section = if shared || !selfhost {
                &mut packet.additional
            } else {
                &mut packet.answers
            };
            push(addr_section, AnswerData::HostAaaa(host), send_flush);
            added += 5;
        } else if qtype == QType::SRV {
            push(&mut packet.answers, AnswerData::ServiceSrv(id), send_flush);
            push(
                &mut packet.additional,
                AnswerData::HostA(host.clone()),
                send_flush,
            );
            push(&mut packet.additional, AnswerData::HostAaaa(host), send_flush);
            added += 3;
        } else if qtype == QType::TXT {
            push(&mut packet.answers, AnswerData::ServiceTxt(id), send_flush);
            added += 1;
        }

        added
    }

    /// Adds A/AAAA answers for a host question.
    fn answer_from_hostname(&self, packet: &mut TxPacket, host: &str, send_flush: bool) -> usize {
        let host_ref = if self.registry.hostname.eq_ignore_ascii_case(host) {
            HostRef::Own
        } else if self.registry.delegated(host).is_some() {
            HostRef::Delegated(host.to_owned())
        } else {
            return 0;
        };
        for data in [
            AnswerData::HostA(host_ref.clone()),
            AnswerData::HostAaaa(host_ref),
        ] {
            TxPacket::push_unique(
                &mut packet.answers,
                OutAnswer {
                    data,
                    flush: send_flush,
                    bye: false,
                },
            );
        }
        2
    }
}

enum AddrCheck {
    Collision(Collision),
    SubnetDuplicate,
}

fn addr_octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Length-first, then bytewise comparison of two serialized rdatas; the
/// lexicographically larger data wins (RFC 6762 §8.2).
fn compare_rdata(ours: &[u8], theirs: &[u8]) -> Collision {
    if theirs.len() > ours.len() {
        return Collision::TheyWin;
    }
    if theirs.len() < ours.len() {
        return Collision::WeWin;
    }
    match ours.cmp(theirs) {
        std::cmp::Ordering::Greater => Collision::WeWin,
        std::cmp::Ordering::Less => Collision::TheyWin,
        std::cmp::Ordering::Equal => Collision::Tie,
    }
}

/// Serializes SRV rdata the way it appears on the wire, for collision
/// comparison.
fn srv_rdata(priority: u16, weight: u16, port: u16, host: &str, domain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + host.len() + domain.len());
    out.extend_from_slice(&priority.to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&port.to_be_bytes());
    out.push(host.len() as u8);
    out.extend_from_slice(host.as_bytes());
    out.push(domain.len() as u8);
    out.extend_from_slice(domain.as_bytes());
    out.push(0);
    out
}

/// Splits TXT record entries into key/value items, skipping malformed ones.
fn txt_items_from(txt: &TXT<'_>) -> Vec<TxtItem> {
    let mut items = Vec::new();
    for entry in txt.entries() {
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.iter().position(|&b| b == b'=') {
            Some(pos) => (&entry[..pos], Some(entry[pos + 1..].to_vec())),
            None => (entry, None),
        };
        let Ok(key) = std::str::from_utf8(key) else {
            log::debug!("non-UTF-8 TXT key, ignoring");
            continue;
        };
        match TxtItem::new(key, value) {
            Ok(item) => items.push(item),
            Err(_) => log::debug!("malformed TXT item, ignoring"),
        }
    }
    items
}

/// The dotted reverse-lookup name (without the `arpa` suffix) for an
/// address: `d.c.b.a.in-addr` or the 32-nibble `ip6` form.
fn reverse_name(addr: &IpAddr) -> String {
    use std::fmt::Write;

    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(68);
            for byte in v6.octets().iter().rev() {
                write!(out, "{:x}.{:x}.", byte & 0xF, byte >> 4).unwrap();
            }
            out.push_str("ip6");
            out
        }
    }
}

/// `DomainName` of `<labels...>.local`, for tests.
#[cfg(test)]
pub(crate) fn local_domain(parts: &[&str]) -> crate::name::DomainName {
    let mut name = crate::name::DomainName::ROOT;
    for p in parts {
        name.push_label(crate::name::Label::new(p));
    }
    name.push_label(crate::name::Label::new("local"));
    name
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::mpsc::{self, Receiver};
    use std::sync::{Arc, Mutex};

    use crate::clock::{FixedRng, ManualClock};
    use crate::name::DomainName;
    use crate::packet::encoder::{MessageEncoder, Question as WireQuestion, ResourceRecord};
    use crate::packet::records::{A, PTR, SRV, TXT};
    use crate::responder::query::{QuerySpec, SearchShared};
    use crate::transport::Capture;

    use super::*;

    const IF0: IfaceId = IfaceId(0);
    const IF1: IfaceId = IfaceId(1);
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 7);

    struct Fixture {
        engine: Engine,
        capture: Capture,
        clock: ManualClock,
        rx: Receiver<Action>,
    }

    fn fixture() -> Fixture {
        fixture_with(|opts| opts)
    }

    fn fixture_with(tweak: impl FnOnce(EngineOpts) -> EngineOpts) -> Fixture {
        let (tx, rx) = mpsc::sync_channel(64);
        let capture = Capture::new();
        let clock = ManualClock::new();
        let opts = tweak(EngineOpts {
            max_services: 16,
            max_interfaces: 3,
            respond_reverse_queries: false,
            suppress_own_queries: true,
            duplicate_pairs: Vec::new(),
        });
        let engine = Engine::new(
            opts,
            Box::new(clock.clone()),
            Box::new(FixedRng(0)),
            Box::new(capture.clone()),
            tx,
        );
        Fixture {
            engine,
            capture,
            clock,
            rx,
        }
    }

    impl Fixture {
        fn drain(&mut self) {
            while let Ok(action) = self.rx.try_recv() {
                self.engine.execute(action);
            }
        }

        /// Simulates `ms` milliseconds of timer ticks.
        fn run_for(&mut self, ms: u64) {
            let mut elapsed = 0;
            while elapsed < ms {
                self.clock.advance(50);
                elapsed += 50;
                self.engine.scheduler_run();
                self.engine.search_run();
                self.drain();
            }
        }

        fn up(&mut self, iface: IfaceId, addr: Ipv4Addr) {
            self.engine.execute(Action::SystemEvent {
                iface,
                family: IpFamily::V4,
                event: NetifEvent::Up(IpAddr::V4(addr)),
            });
        }

        fn inject(&mut self, payload: Vec<u8>, src_port: u16) {
            self.engine.parse_packet(&RxFrame {
                iface: IF0,
                family: IpFamily::V4,
                src: IpAddr::V4(PEER_IP),
                src_port,
                multicast: true,
                payload,
            });
            self.drain();
        }

        fn pcb_state(&self, iface: IfaceId) -> PcbState {
            self.engine.ifaces.pcb(iface, IpFamily::V4).unwrap().state
        }

        /// Decodes every captured frame into the decoder's text form.
        fn frames(&self) -> Vec<(SocketAddr, Vec<String>)> {
            self.capture
                .take()
                .into_iter()
                .map(|f| {
                    let mut lines = Vec::new();
                    MessageDecoder::new(&f.payload)
                        .unwrap()
                        .format(|args| lines.push(args.to_string()))
                        .unwrap();
                    (f.dst, lines)
                })
                .collect()
        }
    }

    fn response_packet(records: &[(DomainName, Record<'static>, u32)]) -> Vec<u8> {
        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let mut header = Header::default();
        header.set_response(true);
        header.set_authority(true);
        let mut enc = MessageEncoder::new(&mut buf);
        enc.set_header(header);
        let mut enc = enc.answers();
        for (name, record, ttl) in records {
            enc.add_answer(ResourceRecord::new(name, record).ttl(*ttl));
        }
        let len = enc.finish().unwrap();
        buf[..len].to_vec()
    }

    fn query_packet(
        questions: &[(DomainName, QType)],
        answers: &[(DomainName, Record<'static>, u32)],
    ) -> Vec<u8> {
        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let mut enc = MessageEncoder::new(&mut buf);
        for (name, qtype) in questions {
            enc.question(WireQuestion::new(name).ty(*qtype));
        }
        let mut enc = enc.answers();
        for (name, record, ttl) in answers {
            enc.add_answer(ResourceRecord::new(name, record).ttl(*ttl));
        }
        let len = enc.finish().unwrap();
        buf[..len].to_vec()
    }

    fn http_service(instance: &str) -> Service {
        Service {
            instance: Some(instance.to_owned()),
            service: "_http".into(),
            proto: Proto::Tcp,
            hostname: "alpha".into(),
            port: 80,
            priority: 0,
            weight: 0,
            txt: Vec::new(),
            subtypes: Vec::new(),
        }
    }

    /// Scenario S1: probing runs to completion without a conflict.
    #[test]
    fn probe_without_conflict_reaches_running() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        assert_eq!(f.pcb_state(IF0), PcbState::Probe1);

        f.run_for(3100);
        assert_eq!(f.pcb_state(IF0), PcbState::Running);

        let frames = f.frames();
        let probes: Vec<_> = frames
            .iter()
            .filter(|(_, lines)| lines[0].starts_with("query"))
            .collect();
        assert_eq!(probes.len(), 3, "{:#?}", frames);
        for (_, lines) in &probes {
            assert!(
                lines.iter().any(|l| l == "Q: alpha.local.\tIN\tANY"),
                "{:#?}",
                lines
            );
        }

        let announces: Vec<_> = frames
            .iter()
            .filter(|(_, lines)| lines[0].starts_with("response"))
            .collect();
        assert_eq!(announces.len(), 3);
        for (_, lines) in &announces {
            assert!(
                lines
                    .iter()
                    .any(|l| l.contains("alpha.local.\t120\tIN\tA\t192.0.2.1")),
                "{:#?}",
                lines
            );
        }
    }

    /// Scenario S2: a peer claims our hostname with a larger address while
    /// we probe; we rename and probe again.
    #[test]
    fn host_collision_during_probe_renames() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(200); // first probe is out, PCB in PROBE_2
        assert_eq!(f.pcb_state(IF0), PcbState::Probe2);
        f.capture.take();

        let peer = Record::A(A::new(Ipv4Addr::new(240, 0, 0, 1)));
        let packet = response_packet(&[(local_domain(&["alpha"]), peer, 120)]);
        f.inject(packet, crate::MDNS_PORT);

        assert_eq!(f.engine.registry.hostname, "alpha-2");
        assert_eq!(f.pcb_state(IF0), PcbState::Probe1);

        f.run_for(400);
        let frames = f.frames();
        assert!(frames
            .iter()
            .any(|(_, lines)| lines.iter().any(|l| l == "Q: alpha-2.local.\tIN\tANY")));
    }

    /// A goodbye (TTL 0) for our name is not a collision.
    #[test]
    fn goodbye_for_our_name_keeps_it() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(200);

        let peer = Record::A(A::new(Ipv4Addr::new(240, 0, 0, 1)));
        let packet = response_packet(&[(local_domain(&["alpha"]), peer, 0)]);
        f.inject(packet, crate::MDNS_PORT);

        assert_eq!(f.engine.registry.hostname, "alpha");
    }

    /// Scenario S3: one-shot PTR query aggregates PTR, SRV and A records
    /// from separate packets into one result.
    #[test]
    fn ptr_query_aggregates_fragmented_records() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);

        let shared = SearchShared::new();
        let search = Search::new(
            1,
            QuerySpec {
                instance: None,
                service: Some("_http".into()),
                proto: Some(Proto::Tcp),
                qtype: QType::PTR,
                unicast: false,
                timeout_ms: 2000,
                max_results: 10,
            },
            f.engine.now(),
            shared.clone(),
        );
        f.engine.execute(Action::SearchAdd(Box::new(search)));

        let instance = local_domain(&["kitchen", "_http", "_tcp"]);
        let ptr = Record::PTR(PTR::new(instance.clone()));
        f.inject(
            response_packet(&[(local_domain(&["_http", "_tcp"]), ptr, 4500)]),
            crate::MDNS_PORT,
        );

        let srv = Record::SRV(SRV::new(0, 0, 80, local_domain(&["kitchen"])));
        f.inject(response_packet(&[(instance.clone(), srv, 120)]), crate::MDNS_PORT);

        let a = Record::A(A::new(Ipv4Addr::new(192, 0, 2, 5)));
        f.inject(
            response_packet(&[(local_domain(&["kitchen"]), a, 120)]),
            crate::MDNS_PORT,
        );

        f.run_for(2200); // exceed the timeout

        let results = shared.results.lock().unwrap().take().expect("query ended");
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.instance.as_deref(), Some("kitchen"));
        assert_eq!(r.hostname.as_deref(), Some("kitchen"));
        assert_eq!(r.port, 80);
        assert_eq!(r.addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))]);
        assert!(r.ttl <= 4500 && r.ttl > 0);
        assert!(f.engine.searches.is_empty());
    }

    /// A query stops as soon as it has `max_results` and an authoritative
    /// packet arrives.
    #[test]
    fn query_ends_at_max_results() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);

        let shared = SearchShared::new();
        let search = Search::new(
            1,
            QuerySpec {
                instance: None,
                service: Some("_http".into()),
                proto: Some(Proto::Tcp),
                qtype: QType::PTR,
                unicast: false,
                timeout_ms: 60_000,
                max_results: 1,
            },
            f.engine.now(),
            shared.clone(),
        );
        f.engine.execute(Action::SearchAdd(Box::new(search)));

        let ptr = Record::PTR(PTR::new(local_domain(&["kitchen", "_http", "_tcp"])));
        f.inject(
            response_packet(&[(local_domain(&["_http", "_tcp"]), ptr, 4500)]),
            crate::MDNS_PORT,
        );

        let results = shared.results.lock().unwrap().take().expect("query ended");
        assert_eq!(results.len(), 1);
    }

    /// Scenario S4: a peer's answer in the query packet suppresses ours.
    #[test]
    fn known_answer_suppression() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.engine.service_add(http_service("foo")).unwrap();
        f.run_for(3100);
        assert_eq!(f.pcb_state(IF0), PcbState::Running);
        f.capture.take();

        let ptr = Record::PTR(PTR::new(local_domain(&["foo", "_http", "_tcp"])));
        let packet = query_packet(
            &[(local_domain(&["_http", "_tcp"]), QType::PTR)],
            &[(local_domain(&["_http", "_tcp"]), ptr, 4500)],
        );
        f.inject(packet, crate::MDNS_PORT);
        f.run_for(500);

        assert!(f.frames().is_empty(), "answer should have been suppressed");
    }

    /// Without the known answer, the same query gets a delayed shared
    /// response carrying PTR, SRV, TXT and address records.
    #[test]
    fn ptr_query_is_answered() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.engine.service_add(http_service("foo")).unwrap();
        f.run_for(3100);
        f.capture.take();

        let packet = query_packet(&[(local_domain(&["_http", "_tcp"]), QType::PTR)], &[]);
        f.inject(packet, crate::MDNS_PORT);
        // Shared answers are delayed by 25..100 ms.
        assert!(f.frames().is_empty());
        f.run_for(200);

        let frames = f.frames();
        assert_eq!(frames.len(), 1);
        let (dst, lines) = &frames[0];
        assert_eq!(*dst, IpFamily::V4.multicast_dst());
        assert!(lines
            .iter()
            .any(|l| l.contains("_http._tcp.local.\t4500\tIN\tPTR\tfoo._http._tcp.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("foo._http._tcp.local.\t120\tIN\tSRV\t0\t0\t80\talpha.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("ADDL: alpha.local.\t120\tIN\tA\t192.0.2.1")));
    }

    /// Legacy one-shot queries (source port != 5353) get a unicast reply
    /// with the question echoed.
    #[test]
    fn legacy_query_gets_unicast_reply() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.capture.take();

        let packet = query_packet(&[(local_domain(&["alpha"]), QType::A)], &[]);
        f.inject(packet, 40000);
        f.run_for(200);

        let frames = f.frames();
        assert_eq!(frames.len(), 1);
        let (dst, lines) = &frames[0];
        assert_eq!(*dst, SocketAddr::new(IpAddr::V4(PEER_IP), 40000));
        assert!(lines.iter().any(|l| l.starts_with("Q: alpha.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("alpha.local.\t120\tIN\tA\t192.0.2.1")));
    }

    /// A probe (ANY) for our hostname is defended immediately, not delayed.
    #[test]
    fn probe_defence_is_immediate() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.capture.take();

        let packet = query_packet(&[(local_domain(&["alpha"]), QType::ANY)], &[]);
        f.inject(packet, crate::MDNS_PORT);

        let frames = f.frames();
        assert_eq!(frames.len(), 1, "unique answers go out immediately");
        assert!(frames[0]
            .1
            .iter()
            .any(|l| l.contains("alpha.local.\t120\tIN\tA\t192.0.2.1")));
    }

    /// Scenario S5: removing a service emits an immediate goodbye.
    #[test]
    fn service_remove_sends_goodbye() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        let id = f.engine.service_add(http_service("foo")).unwrap();
        f.run_for(3100);
        f.capture.take();

        f.engine.service_remove(id);

        let frames = f.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0]
            .1
            .iter()
            .any(|l| l.contains("_http._tcp.local.\t0\tIN\tPTR\tfoo._http._tcp.local.")));
        assert!(f.engine.registry.get(id).is_none());
    }

    /// Scenario S6: a browse delivers one notification for a new result and
    /// one more when the peer says goodbye.
    #[test]
    fn browse_notifies_update_then_remove() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);

        let log: Arc<Mutex<Vec<crate::responder::QueryResult>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let browse = Browse::new(
            7,
            "_http".into(),
            Proto::Tcp,
            Box::new(move |r| log2.lock().unwrap().push(r.clone())),
        );
        f.engine.execute(Action::BrowseAdd(Box::new(browse)));

        let instance = local_domain(&["kitchen", "_http", "_tcp"]);
        let packet = response_packet(&[
            (
                local_domain(&["_http", "_tcp"]),
                Record::PTR(PTR::new(instance.clone())),
                4500,
            ),
            (
                instance.clone(),
                Record::SRV(SRV::new(0, 0, 80, local_domain(&["kitchen"]))),
                120,
            ),
            (
                instance.clone(),
                Record::TXT(TXT::new([&b"path=/"[..]])),
                120,
            ),
            (
                local_domain(&["kitchen"]),
                Record::A(A::new(Ipv4Addr::new(192, 0, 2, 5))),
                120,
            ),
        ]);
        f.inject(packet, crate::MDNS_PORT);

        {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 1, "one notification for the whole packet");
            let r = &log[0];
            assert_eq!(r.instance.as_deref(), Some("kitchen"));
            assert_eq!(r.hostname.as_deref(), Some("kitchen"));
            assert_eq!(r.port, 80);
            assert_eq!(r.addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))]);
            assert!(r.ttl > 0);
        }

        let bye = response_packet(&[(
            local_domain(&["_http", "_tcp"]),
            Record::PTR(PTR::new(instance)),
            0,
        )]);
        f.inject(bye, crate::MDNS_PORT);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].ttl, 0);
        assert!(f.engine.browses[0].results.is_empty());
    }

    /// A new service on a RUNNING PCB sends it back through probing.
    #[test]
    fn service_add_reprobes_running_pcb() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        assert_eq!(f.pcb_state(IF0), PcbState::Running);

        f.engine.service_add(http_service("foo")).unwrap();
        assert_eq!(f.pcb_state(IF0), PcbState::Probe1);

        f.run_for(3100);
        assert_eq!(f.pcb_state(IF0), PcbState::Running);
    }

    /// An SRV probe race we lose renames the service instance.
    #[test]
    fn service_collision_mangles_instance() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        let id = f.engine.service_add(http_service("foo")).unwrap();
        f.run_for(200); // probing the new service

        // A peer claims foo._http._tcp with a larger SRV rdata (longer
        // target hostname wins on length).
        let srv = Record::SRV(SRV::new(0, 0, 80, local_domain(&["a-much-longer-host"])));
        let packet = response_packet(&[(local_domain(&["foo", "_http", "_tcp"]), srv, 120)]);
        f.inject(packet, crate::MDNS_PORT);

        assert_eq!(
            f.engine.registry.get(id).unwrap().service.instance.as_deref(),
            Some("foo-2")
        );
    }

    /// Detecting our other interface's address marks this PCB as a subnet
    /// duplicate, and an interface-down promotes it back.
    #[test]
    fn subnet_duplicate_demotes_and_promotes() {
        let mut f = fixture_with(|mut opts| {
            opts.duplicate_pairs = vec![(IF0, IF1)];
            opts
        });
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.up(IF1, Ipv4Addr::new(192, 0, 2, 9));
        f.run_for(3100);
        assert_eq!(f.pcb_state(IF0), PcbState::Running);
        assert_eq!(f.pcb_state(IF1), PcbState::Running);

        // Someone (really our own other leg) advertises alpha.local with
        // IF1's address; IF0 goes silent.
        let a = Record::A(A::new(Ipv4Addr::new(192, 0, 2, 9)));
        let packet = response_packet(&[(local_domain(&["alpha"]), a, 120)]);
        f.inject(packet, crate::MDNS_PORT);
        assert_eq!(f.pcb_state(IF0), PcbState::Dup);

        // IF1 goes away; IF0 is re-probed.
        f.engine.execute(Action::SystemEvent {
            iface: IF1,
            family: IpFamily::V4,
            event: NetifEvent::Down,
        });
        assert_eq!(f.pcb_state(IF0), PcbState::Probe1);
    }

    /// Reverse queries are answered when enabled.
    #[test]
    fn reverse_query_answered_when_enabled() {
        let mut f = fixture_with(|mut opts| {
            opts.respond_reverse_queries = true;
            opts
        });
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.capture.take();

        let mut name = DomainName::ROOT;
        for part in ["1", "2", "0", "192", "in-addr", "arpa"] {
            name.push_label(crate::name::Label::new(part));
        }
        let packet = query_packet(&[(name, QType::PTR)], &[]);
        f.inject(packet, crate::MDNS_PORT);
        f.run_for(200);

        let frames = f.frames();
        assert_eq!(frames.len(), 1, "{:#?}", frames);
        assert!(frames[0]
            .1
            .iter()
            .any(|l| l.contains("1.2.0.192.in-addr.arpa.\t10\tIN\tPTR\talpha.local.")));
    }

    /// The same reverse query is ignored with the default configuration.
    #[test]
    fn reverse_query_ignored_by_default() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.capture.take();

        let mut name = DomainName::ROOT;
        for part in ["1", "2", "0", "192", "in-addr", "arpa"] {
            name.push_label(crate::name::Label::new(part));
        }
        let packet = query_packet(&[(name, QType::PTR)], &[]);
        f.inject(packet, crate::MDNS_PORT);
        f.run_for(200);

        assert!(f.frames().is_empty());
    }

    /// Datagrams with our own source address are dropped.
    #[test]
    fn own_packets_suppressed() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.capture.take();

        let packet = query_packet(&[(local_domain(&["alpha"]), QType::A)], &[]);
        f.engine.parse_packet(&RxFrame {
            iface: IF0,
            family: IpFamily::V4,
            src: IpAddr::V4(OUR_IP),
            src_port: crate::MDNS_PORT,
            multicast: true,
            payload: packet,
        });
        f.drain();
        f.run_for(200);

        assert!(f.frames().is_empty());
    }

    /// Service enumeration queries are answered with one SDPTR per service.
    #[test]
    fn service_enumeration_answered() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.engine.service_add(http_service("foo")).unwrap();
        f.run_for(3100);
        f.capture.take();

        let mut name = DomainName::ROOT;
        for part in ["_services", "_dns-sd", "_udp", "local"] {
            name.push_label(crate::name::Label::new(part));
        }
        let packet = query_packet(&[(name, QType::PTR)], &[]);
        f.inject(packet, crate::MDNS_PORT);
        f.run_for(200);

        let frames = f.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].1.iter().any(|l| l
            .contains("_services._dns-sd._udp.local.\t4500\tIN\tPTR\t_http._tcp.local.")));
    }

    /// Stop drains into a final goodbye and unblocks pending searches.
    #[test]
    fn stop_sends_final_goodbye() {
        let mut f = fixture();
        f.engine.hostname_set("alpha".into());
        f.up(IF0, OUR_IP);
        f.run_for(3100);
        f.engine.service_add(http_service("foo")).unwrap();
        f.run_for(3100);
        f.capture.take();

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        f.engine.execute(Action::Stop { done: done_tx });
        assert!(f.engine.stopped);
        done_rx.try_recv().unwrap();

        let frames = f.frames();
        assert!(!frames.is_empty());
        assert!(frames
            .iter()
            .any(|(_, lines)| lines.iter().any(|l| l.contains("\t0\tIN\tPTR"))));
    }
}
