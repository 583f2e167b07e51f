//! The responder's owned data: hostname, delegated hosts, and services.

use std::fmt;
use std::net::IpAddr;

use crate::name::Label;
use crate::Error;

/// Transport protocol of an advertised service (`_tcp` or `_udp`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Proto {
    /// Service uses TCP.
    Tcp,
    /// Anything but TCP (UDP, SCTP, etc.).
    Udp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "_tcp",
            Proto::Udp => "_udp",
        }
    }

    /// Maps a wire label to the protocol it names.
    pub fn from_label(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("_tcp") {
            Some(Proto::Tcp)
        } else if s.eq_ignore_ascii_case("_udp") {
            Some(Proto::Udp)
        } else {
            None
        }
    }

    pub fn to_label(&self) -> Label {
        Label::new(self.as_str())
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `key[=value]` item of a service's TXT record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtItem {
    key: String,
    value: Option<Vec<u8>>,
}

impl TxtItem {
    /// Creates a TXT item, validating the DNS TXT rules: the key must be
    /// non-empty and free of `=`, and `key=value` must fit a 255-byte
    /// character string.
    pub fn new(key: impl Into<String>, value: Option<Vec<u8>>) -> Result<Self, Error> {
        let key = key.into();
        if key.is_empty() || key.contains('=') {
            return Err(Error::InvalidArg);
        }
        let value_len = value.as_ref().map(|v| v.len() + 1).unwrap_or(0);
        if key.len() + value_len > 255 {
            return Err(Error::InvalidArg);
        }
        Ok(Self { key, value })
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Returns the `key[=value]` byte string this item contributes to the
    /// TXT record data.
    pub fn packed(&self) -> Vec<u8> {
        let mut out = self.key.as_bytes().to_vec();
        if let Some(value) = &self.value {
            out.push(b'=');
            out.extend_from_slice(value);
        }
        out
    }
}

/// Stable identifier of a registered service.
pub(crate) type ServiceId = u32;

/// An advertised service instance.
#[derive(Clone, Debug)]
pub(crate) struct Service {
    /// Instance name override. When `None`, the default instance name (or
    /// the hostname) identifies this instance.
    pub instance: Option<String>,
    /// Service type, e.g. `_http`.
    pub service: String,
    pub proto: Proto,
    /// The host the service runs on. Either our own hostname or a delegated
    /// one.
    pub hostname: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    /// Ordered, unique by key.
    pub txt: Vec<TxtItem>,
    pub subtypes: Vec<String>,
}

impl Service {
    /// Returns the packed TXT record data of this service, which is what
    /// collisions compare. An empty item list packs to a single zero byte.
    pub fn packed_txt(&self) -> Vec<u8> {
        if self.txt.is_empty() {
            return vec![0];
        }
        let mut out = Vec::new();
        for item in &self.txt {
            let packed = item.packed();
            out.push(packed.len() as u8);
            out.extend_from_slice(&packed);
        }
        out
    }
}

pub(crate) struct ServiceEntry {
    pub id: ServiceId,
    pub service: Service,
}

/// A hostname we answer for on behalf of another (non-mDNS) entity, with a
/// static address list.
#[derive(Clone, Debug)]
pub(crate) struct DelegatedHost {
    pub hostname: String,
    pub addrs: Vec<IpAddr>,
}

/// Everything this responder claims to own on the network.
pub(crate) struct Registry {
    /// Our hostname (without the `.local` suffix). Empty until set.
    pub hostname: String,
    /// Default instance name used by services without an explicit one.
    pub instance: Option<String>,
    services: Vec<ServiceEntry>,
    next_id: ServiceId,
    pub delegated: Vec<DelegatedHost>,
    max_services: usize,
}

impl Registry {
    pub fn new(max_services: usize) -> Self {
        Self {
            hostname: String::new(),
            instance: None,
            services: Vec::new(),
            next_id: 0,
            delegated: Vec::new(),
            max_services,
        }
    }

    /// The instance name a service advertises: its own, the default one, or
    /// the hostname.
    pub fn instance_name_of<'a>(&'a self, service: &'a Service) -> &'a str {
        service
            .instance
            .as_deref()
            .or(self.instance.as_deref())
            .unwrap_or(&self.hostname)
    }

    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.iter().map(|e| e.id).collect()
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceEntry> {
        self.services.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut ServiceEntry> {
        self.services.iter_mut().find(|e| e.id == id)
    }

    /// Registers a service, enforcing the instance/type/proto/host
    /// uniqueness rule and the service cap.
    pub fn add(&mut self, service: Service) -> Result<ServiceId, Error> {
        if self.services.len() >= self.max_services {
            return Err(Error::InvalidState);
        }
        if self
            .find_instance(
                service.instance.as_deref(),
                &service.service,
                service.proto,
                Some(&service.hostname),
            )
            .is_some()
        {
            return Err(Error::AlreadyExists);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.services.push(ServiceEntry { id, service });
        Ok(id)
    }

    pub fn remove(&mut self, id: ServiceId) -> Option<ServiceEntry> {
        let idx = self.services.iter().position(|e| e.id == id)?;
        Some(self.services.remove(idx))
    }

    /// Finds a service by type and protocol (and host, when given).
    pub fn find(
        &self,
        service: &str,
        proto: Proto,
        hostname: Option<&str>,
    ) -> Option<&ServiceEntry> {
        self.services.iter().find(|e| {
            e.service.service.eq_ignore_ascii_case(service)
                && e.service.proto == proto
                && hostname
                    .map(|h| e.service.hostname.eq_ignore_ascii_case(h))
                    .unwrap_or(true)
        })
    }

    /// Finds a service by instance name, type and protocol.
    ///
    /// A `None` instance matches a service advertising under the default
    /// instance name.
    pub fn find_instance(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        hostname: Option<&str>,
    ) -> Option<&ServiceEntry> {
        self.services.iter().find(|e| {
            e.service.service.eq_ignore_ascii_case(service)
                && e.service.proto == proto
                && hostname
                    .map(|h| e.service.hostname.eq_ignore_ascii_case(h))
                    .unwrap_or(true)
                && match instance {
                    Some(instance) => self
                        .instance_name_of(&e.service)
                        .eq_ignore_ascii_case(instance),
                    None => e.service.instance.is_none(),
                }
        })
    }

    /// Finds a service carrying the given subtype.
    pub fn find_subtype(&self, subtype: &str, service: &str, proto: Proto) -> Option<&ServiceEntry> {
        self.services.iter().find(|e| {
            e.service.service.eq_ignore_ascii_case(service)
                && e.service.proto == proto
                && e.service
                    .subtypes
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(subtype))
        })
    }

    /// Returns whether `hostname` is the responder's own name or one it
    /// answers for by delegation.
    pub fn hostname_is_ours(&self, hostname: &str) -> bool {
        (!self.hostname.is_empty() && self.hostname.eq_ignore_ascii_case(hostname))
            || self
                .delegated
                .iter()
                .any(|d| d.hostname.eq_ignore_ascii_case(hostname))
    }

    pub fn delegated(&self, hostname: &str) -> Option<&DelegatedHost> {
        self.delegated
            .iter()
            .find(|d| d.hostname.eq_ignore_ascii_case(hostname))
    }

    /// Rebinds services from one hostname to another; used when our own
    /// hostname is renamed after a collision.
    pub fn remap_service_hostname(&mut self, old: &str, new: &str) {
        for entry in &mut self.services {
            if entry.service.hostname.eq_ignore_ascii_case(old) {
                entry.service.hostname = new.to_owned();
            }
        }
    }
}

/// Derives a new name after a collision: `name` becomes `name-2`, and
/// `name-N` becomes `name-(N+1)`. The result is truncated to the maximum
/// label length if necessary.
pub(crate) fn mangle_name(name: &str) -> String {
    let mut mangled = match name.rsplit_once('-') {
        Some((base, suffix)) => match suffix.parse::<u32>() {
            Ok(n) => format!("{}-{}", base, n + 1),
            // Suffix is not numerical, append a fresh one.
            Err(_) => format!("{}-2", name),
        },
        None => format!("{}-2", name),
    };
    mangled.truncate(Label::MAX_LEN);
    mangled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(instance: Option<&str>, port: u16) -> Service {
        Service {
            instance: instance.map(String::from),
            service: "_http".into(),
            proto: Proto::Tcp,
            hostname: "alpha".into(),
            port,
            priority: 0,
            weight: 0,
            txt: Vec::new(),
            subtypes: Vec::new(),
        }
    }

    #[test]
    fn mangle() {
        assert_eq!(mangle_name("alpha"), "alpha-2");
        assert_eq!(mangle_name("alpha-2"), "alpha-3");
        assert_eq!(mangle_name("alpha-9"), "alpha-10");
        assert_eq!(mangle_name("alpha-x"), "alpha-x-2");
        // Stays within the label length limit.
        let long = "a".repeat(Label::MAX_LEN);
        assert_eq!(mangle_name(&long).len(), Label::MAX_LEN);
    }

    #[test]
    fn duplicate_service_rejected() {
        let mut reg = Registry::new(16);
        reg.hostname = "alpha".into();
        reg.add(service(None, 80)).unwrap();
        assert_eq!(reg.add(service(None, 8080)), Err(Error::AlreadyExists));
        // A different instance name is fine.
        reg.add(service(Some("printer"), 80)).unwrap();
    }

    #[test]
    fn service_cap() {
        let mut reg = Registry::new(1);
        reg.hostname = "alpha".into();
        reg.add(service(None, 80)).unwrap();
        assert_eq!(
            reg.add(service(Some("other"), 81)),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn instance_fallback() {
        let mut reg = Registry::new(16);
        reg.hostname = "alpha".into();
        let id = reg.add(service(None, 80)).unwrap();
        let entry = reg.get(id).unwrap();
        assert_eq!(reg.instance_name_of(&entry.service), "alpha");
        reg.instance = Some("Living Room".into());
        let entry = reg.get(id).unwrap();
        assert_eq!(reg.instance_name_of(&entry.service), "Living Room");
    }

    #[test]
    fn txt_item_rules() {
        assert!(TxtItem::new("path", Some(b"/".to_vec())).is_ok());
        assert!(TxtItem::new("", None).is_err());
        assert!(TxtItem::new("a=b", None).is_err());
        assert!(TxtItem::new("k", Some(vec![0; 254])).is_err());
        assert!(TxtItem::new("k", Some(vec![0; 253])).is_ok());
    }

    #[test]
    fn packed_txt() {
        let mut svc = service(None, 80);
        assert_eq!(svc.packed_txt(), vec![0]);
        svc.txt = vec![
            TxtItem::new("path", Some(b"/".to_vec())).unwrap(),
            TxtItem::new("tls", None).unwrap(),
        ];
        assert_eq!(svc.packed_txt(), b"\x06path=/\x03tls".to_vec());
    }

    #[test]
    fn remap_hostname() {
        let mut reg = Registry::new(16);
        reg.hostname = "alpha".into();
        let id = reg.add(service(None, 80)).unwrap();
        reg.remap_service_hostname("alpha", "alpha-2");
        assert_eq!(reg.get(id).unwrap().service.hostname, "alpha-2");
    }
}
