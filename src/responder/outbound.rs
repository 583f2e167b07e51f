//! Outbound packet construction.
//!
//! Scheduled packets carry *symbolic* questions and answers (references into
//! the registry) instead of wire bytes; records are resolved and serialized
//! when the packet is actually dispatched, so renames and TXT edits that
//! happen while a packet sits in the queue are reflected in what goes out.

use std::net::{IpAddr, SocketAddr};

use crate::name::{DomainName, Label};
use crate::packet::encoder::{MessageEncoder, Question as WireQuestion, ResourceRecord};
use crate::packet::records::{Record, A, AAAA, PTR, SRV, TXT};
use crate::packet::{self, Header, QType, Type};
use crate::transport::{IfaceId, IpFamily};

use super::iface::IfaceTable;
use super::registry::{Registry, ServiceId};

/// Default TTL of shared (PTR) records.
pub(crate) const TTL_PTR: u32 = 4500;
/// Default TTL of unique records (SRV, TXT, A, AAAA).
pub(crate) const TTL_UNIQUE: u32 = 120;
/// TTL of reverse-lookup PTR answers.
pub(crate) const TTL_REVERSE: u32 = 10;

/// A question scheduled for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutQuestion {
    pub qtype: QType,
    pub unicast: bool,
    pub sub: bool,
    pub host: Option<String>,
    pub service: Option<String>,
    pub proto: Option<String>,
}

impl OutQuestion {
    /// Builds the wire name for this question.
    fn name(&self) -> Option<DomainName> {
        // Reverse-lookup names are kept as dotted strings under `arpa`.
        if let Some(host) = &self.host {
            if host.contains("in-addr") || host.contains("ip6") {
                let mut name = dotted_name(host)?;
                name.push_label(Label::new("arpa"));
                return Some(name);
            }
        }

        let mut name = DomainName::ROOT;
        if let Some(host) = &self.host {
            name.push_label(Label::try_new(host).ok()?);
        }
        if self.sub {
            name.push_label(Label::new("_sub"));
        }
        if let Some(service) = &self.service {
            name.push_label(Label::try_new(service).ok()?);
        }
        if let Some(proto) = &self.proto {
            name.push_label(Label::try_new(proto).ok()?);
        }
        name.push_label(Label::new("local"));
        Some(name)
    }

    /// Whether an equivalent question is already present in `haystack`.
    pub fn exists_in(&self, haystack: &[OutQuestion]) -> bool {
        haystack.iter().any(|q| q == self)
    }
}

/// Who an address record is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostRef {
    /// The responder's own hostname; addresses come from the interface.
    Own,
    /// A delegated host with a static address list.
    Delegated(String),
}

/// The payload of a scheduled answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AnswerData {
    /// `<svc>.<proto>.local PTR <instance>...` plus one PTR per subtype.
    ServicePtr(ServiceId),
    /// A single `<subtype>._sub.<svc>.<proto>.local PTR` record.
    SubtypePtr { id: ServiceId, subtype: String },
    /// `_services._dns-sd._udp.local PTR <svc>.<proto>.local`.
    ServiceSdPtr(ServiceId),
    ServiceSrv(ServiceId),
    ServiceTxt(ServiceId),
    HostA(HostRef),
    HostAaaa(HostRef),
    /// Reverse PTR: the dotted name (under `arpa`) answering with our
    /// hostname.
    ReversePtr(String),
    /// A known answer attached to an outgoing PTR question.
    KnownPtr {
        instance: String,
        service: String,
        proto: String,
    },
}

/// An answer scheduled for transmission.
#[derive(Debug, Clone)]
pub(crate) struct OutAnswer {
    pub data: AnswerData,
    pub flush: bool,
    pub bye: bool,
}

impl OutAnswer {
    /// Whether this answer would produce a record of `rtype` for the given
    /// service (or for a host when `service` is `None`). Used to drop
    /// answers that a peer's response already satisfies.
    pub fn matches(&self, rtype: Type, service: Option<ServiceId>) -> bool {
        match (&self.data, rtype) {
            (AnswerData::ServicePtr(id), Type::PTR)
            | (AnswerData::SubtypePtr { id, .. }, Type::PTR)
            | (AnswerData::ServiceSdPtr(id), Type::PTR)
            | (AnswerData::ServiceSrv(id), Type::SRV)
            | (AnswerData::ServiceTxt(id), Type::TXT) => service == Some(*id),
            (AnswerData::HostA(_), Type::A) | (AnswerData::HostAaaa(_), Type::AAAA) => {
                service.is_none()
            }
            _ => false,
        }
    }

    /// Whether this answer references the given service at all.
    pub fn is_for_service(&self, id: ServiceId) -> bool {
        matches!(
            &self.data,
            AnswerData::ServicePtr(s)
                | AnswerData::SubtypePtr { id: s, .. }
                | AnswerData::ServiceSdPtr(s)
                | AnswerData::ServiceSrv(s)
                | AnswerData::ServiceTxt(s)
            if *s == id
        )
    }
}

/// A packet scheduled for (or about to undergo) transmission.
pub(crate) struct TxPacket {
    /// Serial identifying this packet in TX_HANDLE actions.
    pub id: u64,
    pub iface: IfaceId,
    pub family: IpFamily,
    /// `None` sends to the mDNS multicast group of `family`.
    pub dst: Option<SocketAddr>,
    /// DNS message id; nonzero only when echoing a legacy query.
    pub msg_id: u16,
    pub authoritative: bool,
    pub questions: Vec<OutQuestion>,
    pub answers: Vec<OutAnswer>,
    pub authority: Vec<OutAnswer>,
    pub additional: Vec<OutAnswer>,
    pub send_at: u64,
    pub queued: bool,
}

impl TxPacket {
    pub fn new(iface: IfaceId, family: IpFamily) -> Self {
        Self {
            id: 0,
            iface,
            family,
            dst: None,
            msg_id: 0,
            authoritative: false,
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
            send_at: 0,
            queued: false,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.dst.unwrap_or_else(|| self.family.multicast_dst())
    }

    /// Adds an answer to `section` unless an equal one is already there.
    pub fn push_unique(section: &mut Vec<OutAnswer>, answer: OutAnswer) {
        if !section
            .iter()
            .any(|a| a.data == answer.data && a.bye == answer.bye)
        {
            section.push(answer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authority.is_empty()
            && self.additional.is_empty()
    }
}

/// A fully resolved record, ready for serialization.
struct Resolved {
    name: DomainName,
    record: Record<'static>,
    ttl: u32,
    flush: bool,
}

/// Splits a dotted string into a domain name. Returns `None` when a part is
/// not a valid label.
fn dotted_name(s: &str) -> Option<DomainName> {
    let mut name = DomainName::ROOT;
    for part in s.split('.') {
        name.push_label(Label::try_new(part).ok()?);
    }
    Some(name)
}

fn local_name(labels: &[&str]) -> Option<DomainName> {
    let mut name = DomainName::ROOT;
    for l in labels {
        name.push_label(Label::try_new(l).ok()?);
    }
    name.push_label(Label::new("local"));
    Some(name)
}

/// Resolves one symbolic answer into concrete records.
fn resolve(
    answer: &OutAnswer,
    reg: &Registry,
    ifaces: &IfaceTable,
    iface: IfaceId,
    out: &mut Vec<Resolved>,
) {
    let ttl = |base: u32| if answer.bye { 0 } else { base };

    match &answer.data {
        AnswerData::ServicePtr(id) => {
            let Some(entry) = reg.get(*id) else { return };
            let svc = &entry.service;
            let instance = reg.instance_name_of(svc);
            let Some(owner) = local_name(&[&svc.service, svc.proto.as_str()]) else {
                return;
            };
            let Some(target) = local_name(&[instance, &svc.service, svc.proto.as_str()]) else {
                return;
            };
            out.push(Resolved {
                name: owner,
                record: Record::PTR(PTR::new(target.clone())),
                ttl: ttl(TTL_PTR),
                flush: false,
            });
            for subtype in &svc.subtypes {
                let Some(owner) = sub_owner(subtype, svc.service.as_str(), svc.proto.as_str())
                else {
                    continue;
                };
                out.push(Resolved {
                    name: owner,
                    record: Record::PTR(PTR::new(target.clone())),
                    ttl: ttl(TTL_PTR),
                    flush: false,
                });
            }
        }
        AnswerData::SubtypePtr { id, subtype } => {
            let Some(entry) = reg.get(*id) else { return };
            let svc = &entry.service;
            let instance = reg.instance_name_of(svc);
            let Some(owner) = sub_owner(subtype, &svc.service, svc.proto.as_str()) else {
                return;
            };
            let Some(target) = local_name(&[instance, &svc.service, svc.proto.as_str()]) else {
                return;
            };
            out.push(Resolved {
                name: owner,
                record: Record::PTR(PTR::new(target)),
                ttl: ttl(TTL_PTR),
                flush: false,
            });
        }
        AnswerData::ServiceSdPtr(id) => {
            let Some(entry) = reg.get(*id) else { return };
            let svc = &entry.service;
            let Some(owner) = local_name(&["_services", "_dns-sd", "_udp"]) else {
                return;
            };
            let Some(target) = local_name(&[&svc.service, svc.proto.as_str()]) else {
                return;
            };
            out.push(Resolved {
                name: owner,
                record: Record::PTR(PTR::new(target)),
                ttl: ttl(TTL_PTR),
                flush: false,
            });
        }
        AnswerData::ServiceSrv(id) => {
            let Some(entry) = reg.get(*id) else { return };
            let svc = &entry.service;
            let instance = reg.instance_name_of(svc);
            let Some(owner) = local_name(&[instance, &svc.service, svc.proto.as_str()]) else {
                return;
            };
            let Some(target) = local_name(&[&svc.hostname]) else {
                return;
            };
            out.push(Resolved {
                name: owner,
                record: Record::SRV(SRV::new(svc.priority, svc.weight, svc.port, target)),
                ttl: ttl(TTL_UNIQUE),
                flush: answer.flush,
            });
        }
        AnswerData::ServiceTxt(id) => {
            let Some(entry) = reg.get(*id) else { return };
            let svc = &entry.service;
            let instance = reg.instance_name_of(svc);
            let Some(owner) = local_name(&[instance, &svc.service, svc.proto.as_str()]) else {
                return;
            };
            let txt = if svc.txt.is_empty() {
                // An empty TXT still carries one zero-length entry.
                TXT::new([Vec::new()])
            } else {
                TXT::new(svc.txt.iter().map(|item| item.packed()))
            };
            out.push(Resolved {
                name: owner,
                record: Record::TXT(txt),
                ttl: ttl(TTL_UNIQUE),
                flush: answer.flush,
            });
        }
        AnswerData::HostA(host) => {
            resolve_host(answer, host, reg, ifaces, iface, IpFamily::V4, out);
        }
        AnswerData::HostAaaa(host) => {
            resolve_host(answer, host, reg, ifaces, iface, IpFamily::V6, out);
        }
        AnswerData::ReversePtr(dotted) => {
            let Some(mut owner) = dotted_name(dotted) else {
                return;
            };
            owner.push_label(Label::new("arpa"));
            let Some(target) = local_name(&[&reg.hostname]) else {
                return;
            };
            out.push(Resolved {
                name: owner,
                record: Record::PTR(PTR::new(target)),
                ttl: ttl(TTL_REVERSE),
                flush: false,
            });
        }
        AnswerData::KnownPtr {
            instance,
            service,
            proto,
        } => {
            let Some(owner) = local_name(&[service, proto]) else {
                return;
            };
            let Some(target) = local_name(&[instance, service, proto]) else {
                return;
            };
            out.push(Resolved {
                name: owner,
                record: Record::PTR(PTR::new(target)),
                ttl: TTL_PTR,
                flush: false,
            });
        }
    }
}

fn sub_owner(subtype: &str, service: &str, proto: &str) -> Option<DomainName> {
    let mut name = DomainName::ROOT;
    name.push_label(Label::try_new(subtype).ok()?);
    name.push_label(Label::new("_sub"));
    name.push_label(Label::try_new(service).ok()?);
    name.push_label(Label::try_new(proto).ok()?);
    name.push_label(Label::new("local"));
    Some(name)
}

fn resolve_host(
    answer: &OutAnswer,
    host: &HostRef,
    reg: &Registry,
    ifaces: &IfaceTable,
    iface: IfaceId,
    family: IpFamily,
    out: &mut Vec<Resolved>,
) {
    let ttl = if answer.bye { 0 } else { TTL_UNIQUE };
    let (hostname, addrs): (&str, Vec<IpAddr>) = match host {
        HostRef::Own => {
            let addr = ifaces.pcb(iface, family).and_then(|pcb| pcb.addr);
            (&reg.hostname, addr.into_iter().collect())
        }
        HostRef::Delegated(name) => match reg.delegated(name) {
            Some(host) => (
                host.hostname.as_str(),
                host.addrs
                    .iter()
                    .copied()
                    .filter(|a| IpFamily::of(a) == family)
                    .collect(),
            ),
            None => return,
        },
    };
    if hostname.is_empty() {
        return;
    }
    let Some(owner) = local_name(&[hostname]) else {
        return;
    };
    for addr in addrs {
        let record = match addr {
            IpAddr::V4(v4) => Record::A(A::new(v4)),
            IpAddr::V6(v6) => Record::AAAA(AAAA::new(v6)),
        };
        out.push(Resolved {
            name: owner.clone(),
            record,
            ttl,
            flush: answer.flush,
        });
    }
}

/// Serializes `packet` into `buf`, resolving all symbolic answers against
/// the current registry state.
///
/// Returns the number of answer records written along with the length, so
/// the caller can skip transmission of packets that resolved to nothing.
pub(crate) fn assemble(
    packet: &TxPacket,
    reg: &Registry,
    ifaces: &IfaceTable,
    buf: &mut [u8],
) -> Result<(usize, usize), packet::Error> {
    let mut header = Header::default();
    header.set_id(packet.msg_id);
    if packet.authoritative {
        header.set_response(true);
        header.set_authority(true);
    }

    let mut enc = MessageEncoder::new(buf);
    enc.set_header(header);

    for q in &packet.questions {
        let Some(name) = q.name() else { continue };
        enc.question(
            WireQuestion::new(&name)
                .ty(q.qtype)
                .unicast_response(q.unicast),
        );
    }

    let mut records = 0;
    let mut resolved = Vec::new();

    let mut enc = enc.answers();
    for a in &packet.answers {
        resolved.clear();
        resolve(a, reg, ifaces, packet.iface, &mut resolved);
        records += resolved.len();
        for r in &resolved {
            enc.add_answer(
                ResourceRecord::new(&r.name, &r.record)
                    .ttl(r.ttl)
                    .cache_flush(r.flush),
            );
        }
    }

    let mut enc = enc.authority();
    for a in &packet.authority {
        resolved.clear();
        resolve(a, reg, ifaces, packet.iface, &mut resolved);
        records += resolved.len();
        for r in &resolved {
            enc.add_authority(
                ResourceRecord::new(&r.name, &r.record)
                    .ttl(r.ttl)
                    .cache_flush(r.flush),
            );
        }
    }

    let mut enc = enc.additional();
    for a in &packet.additional {
        resolved.clear();
        resolve(a, reg, ifaces, packet.iface, &mut resolved);
        records += resolved.len();
        for r in &resolved {
            enc.add_additional(
                ResourceRecord::new(&r.name, &r.record)
                    .ttl(r.ttl)
                    .cache_flush(r.flush),
            );
        }
    }

    let len = enc.finish()?;
    Ok((len, records))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::packet::decoder::MessageDecoder;
    use crate::responder::registry::{Proto, Service, TxtItem};

    use super::*;

    fn setup() -> (Registry, IfaceTable, ServiceId) {
        let mut reg = Registry::new(16);
        reg.hostname = "alpha".into();
        let id = reg
            .add(Service {
                instance: Some("kitchen".into()),
                service: "_http".into(),
                proto: Proto::Tcp,
                hostname: "alpha".into(),
                port: 80,
                priority: 0,
                weight: 0,
                txt: vec![TxtItem::new("path", Some(b"/".to_vec())).unwrap()],
                subtypes: vec!["_printer".into()],
            })
            .unwrap();
        let mut ifaces = IfaceTable::new(3);
        let pcb = ifaces.pcb_mut(IfaceId(0), IpFamily::V4).unwrap();
        pcb.addr = Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        (reg, ifaces, id)
    }

    fn walk(buf: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        MessageDecoder::new(buf)
            .unwrap()
            .format(|args| lines.push(args.to_string()))
            .unwrap();
        lines
    }

    #[test]
    fn assemble_announcement() {
        let (reg, ifaces, id) = setup();
        let mut pkt = TxPacket::new(IfaceId(0), IpFamily::V4);
        pkt.authoritative = true;
        pkt.answers = vec![
            OutAnswer {
                data: AnswerData::ServiceSdPtr(id),
                flush: false,
                bye: false,
            },
            OutAnswer {
                data: AnswerData::ServicePtr(id),
                flush: false,
                bye: false,
            },
            OutAnswer {
                data: AnswerData::ServiceSrv(id),
                flush: true,
                bye: false,
            },
            OutAnswer {
                data: AnswerData::ServiceTxt(id),
                flush: true,
                bye: false,
            },
            OutAnswer {
                data: AnswerData::HostA(HostRef::Own),
                flush: true,
                bye: false,
            },
        ];

        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let (len, records) = assemble(&pkt, &reg, &ifaces, &mut buf).unwrap();
        // PTR + subtype PTR + SDPTR + SRV + TXT + A
        assert_eq!(records, 6);
        let lines = walk(&buf[..len]);
        assert!(lines[0].starts_with("response"));
        assert!(lines
            .iter()
            .any(|l| l.contains("_http._tcp.local.\t4500\tIN\tPTR\tkitchen._http._tcp.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("_printer._sub._http._tcp.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("_services._dns-sd._udp.local.\t4500\tIN\tPTR\t_http._tcp.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("kitchen._http._tcp.local.\t120\tIN\tSRV\t0\t0\t80\talpha.local.")));
        assert!(lines
            .iter()
            .any(|l| l.contains("alpha.local.\t120\tIN\tA\t192.0.2.1")));
    }

    #[test]
    fn bye_zeroes_ttl() {
        let (reg, ifaces, id) = setup();
        let mut pkt = TxPacket::new(IfaceId(0), IpFamily::V4);
        pkt.authoritative = true;
        pkt.answers = vec![OutAnswer {
            data: AnswerData::ServicePtr(id),
            flush: false,
            bye: true,
        }];
        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let (len, _) = assemble(&pkt, &reg, &ifaces, &mut buf).unwrap();
        let lines = walk(&buf[..len]);
        assert!(lines
            .iter()
            .any(|l| l.contains("_http._tcp.local.\t0\tIN\tPTR")));
    }

    #[test]
    fn removed_service_resolves_to_nothing() {
        let (mut reg, ifaces, id) = setup();
        let mut pkt = TxPacket::new(IfaceId(0), IpFamily::V4);
        pkt.answers = vec![OutAnswer {
            data: AnswerData::ServiceSrv(id),
            flush: false,
            bye: false,
        }];
        reg.remove(id);
        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let (_, records) = assemble(&pkt, &reg, &ifaces, &mut buf).unwrap();
        assert_eq!(records, 0);
    }

    #[test]
    fn probe_question_layout() {
        let (reg, ifaces, id) = setup();
        let mut pkt = TxPacket::new(IfaceId(0), IpFamily::V4);
        pkt.questions = vec![OutQuestion {
            qtype: QType::ANY,
            unicast: true,
            sub: false,
            host: Some("kitchen".into()),
            service: Some("_http".into()),
            proto: Some("_tcp".into()),
        }];
        pkt.authority = vec![OutAnswer {
            data: AnswerData::ServiceSrv(id),
            flush: false,
            bye: false,
        }];
        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let (len, records) = assemble(&pkt, &reg, &ifaces, &mut buf).unwrap();
        assert_eq!(records, 1);
        let lines = walk(&buf[..len]);
        assert!(lines[0].starts_with("query"));
        assert!(lines
            .iter()
            .any(|l| l.contains("Q: kitchen._http._tcp.local.")));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("AUTH: kitchen._http._tcp.local.")));
    }

    #[test]
    fn reverse_ptr_answer() {
        let (reg, ifaces, _) = setup();
        let mut pkt = TxPacket::new(IfaceId(0), IpFamily::V4);
        pkt.authoritative = true;
        pkt.answers = vec![OutAnswer {
            data: AnswerData::ReversePtr("1.2.0.192.in-addr".into()),
            flush: false,
            bye: false,
        }];
        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let (len, records) = assemble(&pkt, &reg, &ifaces, &mut buf).unwrap();
        assert_eq!(records, 1);
        let lines = walk(&buf[..len]);
        assert!(lines
            .iter()
            .any(|l| l.contains("1.2.0.192.in-addr.arpa.\t10\tIN\tPTR\talpha.local.")));
    }
}
