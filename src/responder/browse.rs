//! Continuous browse subscriptions.
//!
//! A browse is a long-lived PTR subscription. While a packet is parsed, the
//! records it carries update the browse's result set; every result that was
//! created or materially changed is queued for one notification, delivered by
//! a BROWSE_SYNC action once the whole packet has been processed. A result
//! whose TTL drops to 0 (peer goodbye) is delivered once more and detached.

use std::net::IpAddr;

use crate::packet::Type;
use crate::transport::{IfaceId, IpFamily};

use super::parsed::WireName;
use super::query::QueryResult;
use super::registry::{Proto, TxtItem};

/// Callback invoked with every created, changed, or removed browse result.
pub type BrowseNotifier = Box<dyn Fn(&QueryResult) + Send>;

pub(crate) struct BrowseResult {
    /// Stable key identifying this result in sync actions.
    pub key: u64,
    pub result: QueryResult,
}

pub(crate) struct Browse {
    pub id: u64,
    pub service: String,
    pub proto: Proto,
    pub results: Vec<BrowseResult>,
    pub notifier: BrowseNotifier,
    next_key: u64,
}

impl Browse {
    pub fn new(id: u64, service: String, proto: Proto, notifier: BrowseNotifier) -> Self {
        Self {
            id,
            service,
            proto,
            results: Vec::new(),
            notifier,
            next_key: 0,
        }
    }

    fn service_matches(&self, name: &WireName) -> bool {
        self.service.eq_ignore_ascii_case(&name.service)
            && Proto::from_label(&name.proto) == Some(self.proto)
    }

    /// Whether an inbound record is of interest to this browse. Browses only
    /// consume SRV, TXT, A and AAAA records (the PTR itself carries no data
    /// beyond the instance name, which the SRV repeats).
    pub fn matches(&self, name: &WireName, rtype: Type, iface: IfaceId, family: IpFamily) -> bool {
        match rtype {
            Type::SRV | Type::TXT => self.service_matches(name),
            Type::A | Type::AAAA => self.results.iter().any(|r| {
                r.result.iface == iface
                    && r.result.family == family
                    && r.result
                        .hostname
                        .as_deref()
                        .map(|h| h.eq_ignore_ascii_case(&name.host))
                        .unwrap_or(false)
            }),
            _ => false,
        }
    }

    fn find_instance(&mut self, instance: &str, iface: IfaceId, family: IpFamily) -> Option<usize> {
        self.results.iter().position(|r| {
            r.result.iface == iface
                && r.result.family == family
                && r.result
                    .instance
                    .as_deref()
                    .map(|i| i.eq_ignore_ascii_case(instance))
                    .unwrap_or(false)
        })
    }

    /// Feeds an SRV record. Returns the key of the result to sync, if it was
    /// created or changed.
    pub fn add_srv(
        &mut self,
        hostname: &str,
        instance: &str,
        port: u16,
        iface: IfaceId,
        family: IpFamily,
        ttl: u32,
    ) -> Option<u64> {
        if let Some(idx) = self.find_instance(instance, iface, family) {
            let mut changed = false;
            {
                let r = &mut self.results[idx].result;
                let host_changed = r
                    .hostname
                    .as_deref()
                    .map(|h| !h.eq_ignore_ascii_case(hostname))
                    .unwrap_or(true);
                if host_changed {
                    r.hostname = Some(hostname.to_owned());
                    r.port = port;
                    changed = true;
                }
                let prev_ttl = r.ttl;
                r.merge_ttl(ttl);
                if r.ttl != prev_ttl {
                    changed = true;
                }
            }
            if changed {
                // A rename to an already-known host can reuse its addresses.
                if self.results[idx].result.addrs.is_empty() {
                    let addrs = self.addrs_of(hostname, iface, family);
                    self.results[idx].result.addrs = addrs;
                }
                return Some(self.results[idx].key);
            }
            return None;
        }

        let key = self.next_key;
        self.next_key += 1;
        let mut result = QueryResult::new(iface, family, ttl);
        result.instance = Some(instance.to_owned());
        result.service = Some(self.service.clone());
        result.proto = Some(self.proto.as_str().to_owned());
        result.hostname = Some(hostname.to_owned());
        result.port = port;
        result.addrs = self.addrs_of(hostname, iface, family);
        self.results.push(BrowseResult { key, result });
        Some(key)
    }

    /// Feeds a TXT record. Returns the key of the result to sync if the TXT
    /// data changed.
    pub fn add_txt(
        &mut self,
        instance: &str,
        txt: Vec<TxtItem>,
        iface: IfaceId,
        family: IpFamily,
        ttl: u32,
    ) -> Option<u64> {
        match self.find_instance(instance, iface, family) {
            Some(idx) => {
                let key = self.results[idx].key;
                let r = &mut self.results[idx].result;
                let mut changed = false;
                if r.txt != txt {
                    r.txt = txt;
                    changed = true;
                }
                let prev_ttl = r.ttl;
                r.merge_ttl(ttl);
                changed |= r.ttl != prev_ttl;
                changed.then_some(key)
            }
            None => {
                let key = self.next_key;
                self.next_key += 1;
                let mut result = QueryResult::new(iface, family, ttl);
                result.instance = Some(instance.to_owned());
                result.service = Some(self.service.clone());
                result.proto = Some(self.proto.as_str().to_owned());
                result.txt = txt;
                self.results.push(BrowseResult { key, result });
                Some(key)
            }
        }
    }

    /// Feeds an A/AAAA record for a hostname. Returns the keys of results
    /// that gained an address.
    pub fn add_ip(
        &mut self,
        hostname: &str,
        addr: IpAddr,
        iface: IfaceId,
        family: IpFamily,
        ttl: u32,
    ) -> Vec<u64> {
        let mut changed = Vec::new();
        for r in &mut self.results {
            if r.result.iface != iface || r.result.family != family {
                continue;
            }
            let matches = r
                .result
                .hostname
                .as_deref()
                .map(|h| h.eq_ignore_ascii_case(hostname))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if r.result.add_addr(addr) {
                r.result.merge_ttl(ttl);
                changed.push(r.key);
            }
        }
        changed
    }

    fn addrs_of(&self, hostname: &str, iface: IfaceId, family: IpFamily) -> Vec<IpAddr> {
        for r in &self.results {
            if r.result.iface == iface
                && r.result.family == family
                && r.result
                    .hostname
                    .as_deref()
                    .map(|h| h.eq_ignore_ascii_case(hostname))
                    .unwrap_or(false)
                && !r.result.addrs.is_empty()
            {
                return r.result.addrs.clone();
            }
        }
        Vec::new()
    }

    /// Delivers one result to the notifier; a TTL-0 result is detached from
    /// the result set afterwards.
    pub fn sync_one(&mut self, key: u64) {
        let Some(idx) = self.results.iter().position(|r| r.key == key) else {
            return;
        };
        (self.notifier)(&self.results[idx].result);
        if self.results[idx].result.ttl == 0 {
            self.results.remove(idx);
        }
    }

    /// Marks the result for `instance` as removed (TTL 0). Returns its key.
    pub fn mark_removed(&mut self, instance: &str, iface: IfaceId, family: IpFamily) -> Option<u64> {
        let idx = self.find_instance(instance, iface, family)?;
        self.results[idx].result.ttl = 0;
        Some(self.results[idx].key)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use super::*;

    const IF0: IfaceId = IfaceId(0);

    fn browse_with_log() -> (Browse, Arc<Mutex<Vec<QueryResult>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let browse = Browse::new(
            1,
            "_http".into(),
            Proto::Tcp,
            Box::new(move |r| log2.lock().unwrap().push(r.clone())),
        );
        (browse, log)
    }

    #[test]
    fn srv_creates_then_updates() {
        let (mut b, _) = browse_with_log();
        let k1 = b.add_srv("kitchen", "kitchen", 80, IF0, IpFamily::V4, 120);
        assert!(k1.is_some());
        // Same data again: no change, no sync.
        let k2 = b.add_srv("kitchen", "kitchen", 80, IF0, IpFamily::V4, 120);
        assert!(k2.is_none());
        // Host change is material.
        let k3 = b.add_srv("pantry", "kitchen", 80, IF0, IpFamily::V4, 120);
        assert_eq!(k3, k1);
    }

    #[test]
    fn txt_change_is_material() {
        let (mut b, _) = browse_with_log();
        b.add_srv("kitchen", "kitchen", 80, IF0, IpFamily::V4, 120);
        let txt = vec![TxtItem::new("path", Some(b"/".to_vec())).unwrap()];
        assert!(b
            .add_txt("kitchen", txt.clone(), IF0, IpFamily::V4, 120)
            .is_some());
        assert!(b.add_txt("kitchen", txt, IF0, IpFamily::V4, 120).is_none());
    }

    #[test]
    fn goodbye_detaches_after_sync() {
        let (mut b, log) = browse_with_log();
        let key = b
            .add_srv("kitchen", "kitchen", 80, IF0, IpFamily::V4, 120)
            .unwrap();
        b.sync_one(key);
        assert_eq!(b.results.len(), 1);

        let key = b.mark_removed("kitchen", IF0, IpFamily::V4).unwrap();
        b.sync_one(key);
        assert!(b.results.is_empty());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].ttl > 0);
        assert_eq!(log[1].ttl, 0);
    }

    #[test]
    fn ip_attaches_to_matching_hostname() {
        let (mut b, _) = browse_with_log();
        b.add_srv("kitchen", "kitchen", 80, IF0, IpFamily::V4, 120);
        let changed = b.add_ip(
            "kitchen",
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
            IF0,
            IpFamily::V4,
            120,
        );
        assert_eq!(changed.len(), 1);
        // Same address again is not a change.
        let changed = b.add_ip(
            "kitchen",
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
            IF0,
            IpFamily::V4,
            120,
        );
        assert!(changed.is_empty());
    }
}
