//! Classification of wire names and parsed inbound packets.

use std::net::IpAddr;

use crate::name::DomainName;
use crate::packet::{QType, Type};
use crate::transport::{IfaceId, IpFamily};

/// A wire name split into the four parts mDNS cares about:
/// `host.service.proto.domain`.
///
/// Shorter names shift towards the domain: `alpha.local` is host + domain,
/// `_http._tcp.local` is service + proto + domain. A `_sub` label sets the
/// subtype marker without consuming a part. Names with more than four parts
/// are marked invalid but parsing continues, so the rest of the packet is
/// still processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WireName {
    pub host: String,
    pub service: String,
    pub proto: String,
    pub domain: String,
    pub sub: bool,
    pub invalid: bool,
}

impl WireName {
    pub fn classify(name: &DomainName, reverse_enabled: bool) -> Self {
        let mut out = WireName::default();
        let mut parts: Vec<String> = Vec::new();

        for label in name.labels() {
            let s = String::from_utf8_lossy(label.as_bytes()).into_owned();

            // Dotted hostnames accumulate into the host part. This is how
            // reverse names such as `4.3.2.1.in-addr.arpa` come out with
            // host "4.3.2.1.in-addr".
            let joins_host = parts.len() == 1
                && !s.starts_with('_')
                && !s.eq_ignore_ascii_case("local")
                && !s.eq_ignore_ascii_case("arpa")
                && (reverse_enabled
                    || (!s.eq_ignore_ascii_case("ip6") && !s.eq_ignore_ascii_case("in-addr")));

            if joins_host {
                parts[0].push('.');
                parts[0].push_str(&s);
            } else if s.eq_ignore_ascii_case("_sub") {
                out.sub = true;
            } else if !out.invalid {
                if parts.len() == 4 {
                    out.invalid = true;
                } else {
                    parts.push(s);
                }
            }
        }

        // Shorter names slide towards the domain end.
        let mut parts = parts.into_iter();
        match parts.len() {
            0 => {}
            1 => out.host = parts.next().unwrap(),
            2 => {
                out.host = parts.next().unwrap();
                out.domain = parts.next().unwrap();
            }
            3 => {
                out.service = parts.next().unwrap();
                out.proto = parts.next().unwrap();
                out.domain = parts.next().unwrap();
            }
            _ => {
                out.host = parts.next().unwrap();
                out.service = parts.next().unwrap();
                out.proto = parts.next().unwrap();
                out.domain = parts.next().unwrap();
            }
        }

        if !out.invalid {
            let domain_ok = out.domain.eq_ignore_ascii_case("local")
                || (reverse_enabled && out.domain.eq_ignore_ascii_case("arpa"));
            if !domain_ok {
                out.invalid = true;
            }
        }

        out
    }

    /// Whether this is the DNS-SD service enumeration name
    /// `_services._dns-sd._udp.local` queried with PTR.
    pub fn is_discovery(&self, qtype: QType) -> bool {
        qtype == QType::PTR
            && self.host.eq_ignore_ascii_case("_services")
            && self.service.eq_ignore_ascii_case("_dns-sd")
            && self.proto.eq_ignore_ascii_case("_udp")
            && self.domain.eq_ignore_ascii_case("local")
    }

    /// Whether the name consists of a host part only.
    pub fn host_only(&self) -> bool {
        self.service.is_empty() && self.proto.is_empty()
    }
}

/// A question from an inbound packet that we own an answer for.
///
/// A service-enumeration (`_services._dns-sd._udp.local`) question is
/// expanded into one `discovery` question per registered service, so
/// known-answer suppression can drop them individually.
#[derive(Debug, Clone)]
pub(crate) struct ParsedQuestion {
    pub qtype: QType,
    pub unicast: bool,
    pub sub: bool,
    pub discovery: bool,
    pub host: Option<String>,
    pub service: Option<String>,
    pub proto: Option<String>,
}

/// Metadata of an inbound PTR answer matching one of our services, kept for
/// known-answer suppression while the rest of the packet is processed.
#[derive(Debug, Clone)]
pub(crate) struct ParsedRecord {
    pub rtype: Type,
    pub ttl: u32,
    pub instance: Option<String>,
    pub service: Option<String>,
    pub proto: Option<String>,
}

/// Everything collected from one inbound datagram before the answer packet
/// is composed.
pub(crate) struct ParsedPacket {
    pub iface: IfaceId,
    pub family: IpFamily,
    pub src: IpAddr,
    pub src_port: u16,
    pub id: u16,
    pub authoritative: bool,
    pub probe: bool,
    pub discovery: bool,
    pub questions: Vec<ParsedQuestion>,
    pub records: Vec<ParsedRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(s: &str, reverse: bool) -> WireName {
        WireName::classify(&DomainName::from_str(s).unwrap(), reverse)
    }

    #[test]
    fn full_instance_name() {
        let name = classify("kitchen._http._tcp.local", false);
        assert_eq!(name.host, "kitchen");
        assert_eq!(name.service, "_http");
        assert_eq!(name.proto, "_tcp");
        assert_eq!(name.domain, "local");
        assert!(!name.sub && !name.invalid);
    }

    #[test]
    fn service_name() {
        let name = classify("_http._tcp.local", false);
        assert_eq!(name.host, "");
        assert_eq!(name.service, "_http");
        assert_eq!(name.proto, "_tcp");
        assert_eq!(name.domain, "local");
        assert!(!name.invalid);
    }

    #[test]
    fn host_name() {
        let name = classify("alpha.local", false);
        assert_eq!(name.host, "alpha");
        assert_eq!(name.domain, "local");
        assert!(name.host_only());
        assert!(!name.invalid);
    }

    #[test]
    fn subtype_query() {
        let name = classify("_printer._sub._http._tcp.local", false);
        assert!(name.sub);
        assert_eq!(name.host, "_printer");
        assert_eq!(name.service, "_http");
        assert_eq!(name.proto, "_tcp");
        assert!(!name.invalid);
    }

    #[test]
    fn too_many_parts() {
        let name = classify("a._b._c._d.local", false);
        assert!(name.invalid);
    }

    #[test]
    fn wrong_domain() {
        assert!(classify("alpha.example", false).invalid);
        assert!(classify("4.3.2.1.in-addr.arpa", false).invalid);
    }

    #[test]
    fn reverse_name() {
        let name = classify("4.3.2.1.in-addr.arpa", true);
        assert_eq!(name.host, "4.3.2.1.in-addr");
        assert_eq!(name.domain, "arpa");
        assert!(!name.invalid);
    }

    #[test]
    fn discovery_name() {
        let name = classify("_services._dns-sd._udp.local", false);
        assert!(name.is_discovery(QType::PTR));
        assert!(!name.is_discovery(QType::A));
    }
}
