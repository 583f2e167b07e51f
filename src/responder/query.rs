//! One-shot search engine.
//!
//! A search sends questions out of every enabled PCB, aggregates matching
//! records from response packets into [`QueryResult`]s, and ends when its
//! timeout elapses or it collected `max_results` entries.

use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex};

use crate::packet::{QType, Type};
use crate::transport::{IfaceId, IpFamily};

use super::parsed::WireName;
use super::registry::{Proto, TxtItem};

/// What a query is looking for.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    /// Instance name (PTR/SRV/TXT queries) or hostname (A/AAAA queries).
    pub instance: Option<String>,
    /// Service type, e.g. `_http`.
    pub service: Option<String>,
    pub proto: Option<Proto>,
    /// The record type queried for.
    pub qtype: QType,
    /// Request unicast responses.
    pub unicast: bool,
    /// Give up after this long.
    pub timeout_ms: u64,
    /// Stop early after this many results. 0 disables the cap.
    pub max_results: usize,
}

/// One discovered entity.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Interface the records arrived on.
    pub iface: IfaceId,
    pub family: IpFamily,
    pub instance: Option<String>,
    pub service: Option<String>,
    pub proto: Option<String>,
    pub hostname: Option<String>,
    pub port: u16,
    pub txt: Vec<TxtItem>,
    pub addrs: Vec<IpAddr>,
    /// Minimum TTL over all records that contributed to this result.
    pub ttl: u32,
}

impl QueryResult {
    pub(crate) fn new(iface: IfaceId, family: IpFamily, ttl: u32) -> Self {
        Self {
            iface,
            family,
            instance: None,
            service: None,
            proto: None,
            hostname: None,
            port: 0,
            txt: Vec::new(),
            addrs: Vec::new(),
            ttl,
        }
    }

    /// Merges a contributing record's TTL; the result keeps the minimum.
    pub(crate) fn merge_ttl(&mut self, ttl: u32) {
        if self.ttl == 0 {
            self.ttl = ttl;
        } else {
            self.ttl = self.ttl.min(ttl);
        }
    }

    /// Adds an address unless it is already present.
    pub(crate) fn add_addr(&mut self, addr: IpAddr) -> bool {
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchState {
    Init,
    Running,
    Off,
}

/// Rendezvous between the engine and the caller waiting for results.
pub(crate) struct SearchShared {
    pub results: Mutex<Option<Vec<QueryResult>>>,
    pub done: Condvar,
}

impl SearchShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(None),
            done: Condvar::new(),
        })
    }
}

pub(crate) struct Search {
    pub id: u64,
    pub spec: QuerySpec,
    pub state: SearchState,
    pub started_at: u64,
    pub sent_at: u64,
    pub results: Vec<QueryResult>,
    pub shared: Arc<SearchShared>,
    pub notifier: Option<Box<dyn Fn(&[QueryResult]) + Send>>,
}

impl Search {
    pub fn new(id: u64, spec: QuerySpec, now: u64, shared: Arc<SearchShared>) -> Self {
        Self {
            id,
            spec,
            state: SearchState::Init,
            started_at: now,
            sent_at: 0,
            results: Vec::new(),
            shared,
            notifier: None,
        }
    }

    fn proto_matches(&self, label: &str) -> bool {
        match self.spec.proto {
            Some(proto) => Proto::from_label(label) == Some(proto),
            None => false,
        }
    }

    fn service_matches(&self, name: &WireName) -> bool {
        match &self.spec.service {
            Some(service) => {
                service.eq_ignore_ascii_case(&name.service) && self.proto_matches(&name.proto)
            }
            None => false,
        }
    }

    /// Whether an inbound record of `rtype` named `name` is of interest to
    /// this search.
    pub fn matches(&self, name: &WireName, rtype: Type, iface: IfaceId, family: IpFamily) -> bool {
        if self.state == SearchState::Off {
            return false;
        }

        let qtype = self.spec.qtype;
        match rtype {
            Type::A | Type::AAAA => {
                if qtype == QType::ANY && self.spec.service.is_some() {
                    return false;
                }
                if qtype != QType::ANY
                    && qtype.0 != rtype.0
                    && qtype != QType::PTR
                    && qtype != QType::SRV
                {
                    return false;
                }
                if qtype != QType::PTR && qtype != QType::SRV {
                    // Address query: the hostname itself is the filter.
                    return self
                        .spec
                        .instance
                        .as_deref()
                        .map(|i| i.eq_ignore_ascii_case(&name.host))
                        .unwrap_or(false);
                }
                // PTR/SRV search: the address belongs to a hostname we
                // already discovered.
                self.results.iter().any(|r| {
                    r.iface == iface
                        && r.family == family
                        && r.hostname
                            .as_deref()
                            .map(|h| h.eq_ignore_ascii_case(&name.host))
                            .unwrap_or(false)
                })
            }
            Type::SRV | Type::TXT => {
                if qtype == QType::ANY && self.spec.service.is_none() {
                    return false;
                }
                if qtype != QType::ANY && qtype.0 != rtype.0 && qtype != QType::PTR {
                    return false;
                }
                if !self.service_matches(name) {
                    return false;
                }
                if qtype != QType::PTR {
                    return self
                        .spec
                        .instance
                        .as_deref()
                        .map(|i| i.eq_ignore_ascii_case(&name.host))
                        .unwrap_or(false);
                }
                true
            }
            Type::PTR => qtype == QType::PTR && self.service_matches(name),
            _ => false,
        }
    }

    pub fn reached_cap(&self) -> bool {
        self.spec.max_results != 0 && self.results.len() >= self.spec.max_results
    }

    /// Finds or creates the result for a PTR answer naming `instance`.
    pub fn add_ptr(
        &mut self,
        instance: &str,
        service: &str,
        proto: &str,
        iface: IfaceId,
        family: IpFamily,
        ttl: u32,
    ) -> Option<usize> {
        if let Some(idx) = self.results.iter().position(|r| {
            r.iface == iface
                && r.family == family
                && r.instance
                    .as_deref()
                    .map(|i| i.eq_ignore_ascii_case(instance))
                    .unwrap_or(false)
        }) {
            self.results[idx].merge_ttl(ttl);
            return Some(idx);
        }

        if self.reached_cap() {
            return None;
        }
        let mut result = QueryResult::new(iface, family, ttl);
        result.instance = Some(instance.to_owned());
        result.service = Some(service.to_owned());
        result.proto = Some(proto.to_owned());
        self.results.push(result);
        Some(self.results.len() - 1)
    }

    /// Records an SRV answer for an SRV-type search, keyed by hostname.
    pub fn add_srv(
        &mut self,
        hostname: &str,
        port: u16,
        iface: IfaceId,
        family: IpFamily,
        ttl: u32,
    ) {
        if let Some(r) = self.results.iter_mut().find(|r| {
            r.iface == iface
                && r.family == family
                && r.hostname
                    .as_deref()
                    .map(|h| h.eq_ignore_ascii_case(hostname))
                    .unwrap_or(false)
        }) {
            r.merge_ttl(ttl);
            return;
        }
        if self.reached_cap() {
            return;
        }
        let mut result = QueryResult::new(iface, family, ttl);
        result.hostname = Some(hostname.to_owned());
        result.port = port;
        self.results.push(result);
    }

    /// Records a TXT answer for a TXT-type search.
    pub fn add_txt(&mut self, txt: Vec<TxtItem>, iface: IfaceId, family: IpFamily, ttl: u32) {
        if txt.is_empty() {
            return;
        }
        if let Some(r) = self
            .results
            .iter_mut()
            .find(|r| r.iface == iface && r.family == family)
        {
            if r.txt.is_empty() {
                r.txt = txt;
            }
            r.merge_ttl(ttl);
            return;
        }
        if self.reached_cap() {
            return;
        }
        let mut result = QueryResult::new(iface, family, ttl);
        result.txt = txt;
        self.results.push(result);
    }

    /// Records an A/AAAA answer.
    pub fn add_ip(
        &mut self,
        hostname: &str,
        addr: IpAddr,
        iface: IfaceId,
        family: IpFamily,
        ttl: u32,
    ) {
        let qtype = self.spec.qtype;
        let wanted = match addr {
            IpAddr::V4(_) => qtype == QType::A || qtype == QType::ANY,
            IpAddr::V6(_) => qtype == QType::AAAA || qtype == QType::ANY,
        };
        if wanted {
            // Address search results are keyed per (interface, family).
            if let Some(r) = self
                .results
                .iter_mut()
                .find(|r| r.iface == iface && r.family == family)
            {
                r.add_addr(addr);
                r.merge_ttl(ttl);
                return;
            }
            if self.reached_cap() {
                return;
            }
            let mut result = QueryResult::new(iface, family, ttl);
            result.hostname = Some(hostname.to_owned());
            result.addrs.push(addr);
            self.results.push(result);
        } else if qtype == QType::PTR || qtype == QType::SRV {
            if let Some(r) = self.results.iter_mut().find(|r| {
                r.iface == iface
                    && r.family == family
                    && r.hostname
                        .as_deref()
                        .map(|h| h.eq_ignore_ascii_case(hostname))
                        .unwrap_or(false)
            }) {
                r.add_addr(addr);
                r.merge_ttl(ttl);
            }
        }
    }

    /// Ends the search: delivers the results to the waiting caller and fires
    /// the notifier.
    pub fn finish(&mut self) {
        self.state = SearchState::Off;
        if let Some(notifier) = &self.notifier {
            notifier(&self.results);
        }
        let mut slot = self.shared.results.lock().unwrap();
        *slot = Some(self.results.clone());
        self.shared.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ptr_search() -> Search {
        Search::new(
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
            0,
            SearchShared::new(),
        )
    }

    fn name(host: &str, service: &str, proto: &str) -> WireName {
        WireName {
            host: host.into(),
            service: service.into(),
            proto: proto.into(),
            domain: "local".into(),
            sub: false,
            invalid: false,
        }
    }

    const IF0: IfaceId = IfaceId(0);

    #[test]
    fn ptr_aggregation_chain() {
        let mut s = ptr_search();
        let n = name("kitchen", "_http", "_tcp");
        assert!(s.matches(&n, Type::PTR, IF0, IpFamily::V4));
        let idx = s
            .add_ptr("kitchen", "_http", "_tcp", IF0, IpFamily::V4, 4500)
            .unwrap();

        // SRV fills hostname and port.
        s.results[idx].hostname = Some("kitchen".into());
        s.results[idx].port = 80;

        // Now an A record for the hostname matches too.
        let host = WireName {
            host: "kitchen".into(),
            domain: "local".into(),
            ..Default::default()
        };
        assert!(s.matches(&host, Type::A, IF0, IpFamily::V4));
        s.add_ip(
            "kitchen",
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
            IF0,
            IpFamily::V4,
            120,
        );

        assert_eq!(s.results.len(), 1);
        let r = &s.results[0];
        assert_eq!(r.instance.as_deref(), Some("kitchen"));
        assert_eq!(r.port, 80);
        assert_eq!(r.addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))]);
        assert!(r.ttl <= 4500);
    }

    #[test]
    fn max_results_cap() {
        let mut s = ptr_search();
        s.spec.max_results = 2;
        for i in 0..5 {
            s.add_ptr(
                &format!("svc{}", i),
                "_http",
                "_tcp",
                IF0,
                IpFamily::V4,
                4500,
            );
        }
        assert_eq!(s.results.len(), 2);
        assert!(s.reached_cap());
    }

    #[test]
    fn duplicate_ptr_merges() {
        let mut s = ptr_search();
        s.add_ptr("kitchen", "_http", "_tcp", IF0, IpFamily::V4, 4500);
        s.add_ptr("KITCHEN", "_http", "_tcp", IF0, IpFamily::V4, 100);
        assert_eq!(s.results.len(), 1);
        assert_eq!(s.results[0].ttl, 100);
    }

    #[test]
    fn address_search_matches_hostname() {
        let mut s = ptr_search();
        s.spec = QuerySpec {
            instance: Some("alpha".into()),
            service: None,
            proto: None,
            qtype: QType::A,
            unicast: false,
            timeout_ms: 1000,
            max_results: 0,
        };
        let host = WireName {
            host: "alpha".into(),
            domain: "local".into(),
            ..Default::default()
        };
        assert!(s.matches(&host, Type::A, IF0, IpFamily::V4));
        let other = WireName {
            host: "beta".into(),
            domain: "local".into(),
            ..Default::default()
        };
        assert!(!s.matches(&other, Type::A, IF0, IpFamily::V4));
    }

    #[test]
    fn finish_delivers_results() {
        let mut s = ptr_search();
        s.add_ptr("kitchen", "_http", "_tcp", IF0, IpFamily::V4, 4500);
        let shared = s.shared.clone();
        s.finish();
        let results = shared.results.lock().unwrap().take().unwrap();
        assert_eq!(results.len(), 1);
    }
}
