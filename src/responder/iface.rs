//! Per-interface protocol control blocks.

use std::net::IpAddr;

use crate::transport::{IfaceId, IpFamily};

use super::registry::ServiceId;

/// State of a protocol control block, one per (interface, address family).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PcbState {
    Off,
    Init,
    Probe1,
    Probe2,
    Probe3,
    Announce1,
    Announce2,
    Announce3,
    Running,
    /// This interface shares a subnet with another one that owns all
    /// responses; this PCB stays silent.
    Dup,
}

impl PcbState {
    /// Whether the PCB is between INIT and the last probe.
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            PcbState::Init | PcbState::Probe1 | PcbState::Probe2 | PcbState::Probe3
        )
    }

    /// Whether probing completed (announcing or running).
    pub fn is_past_probing(&self) -> bool {
        matches!(
            self,
            PcbState::Announce1
                | PcbState::Announce2
                | PcbState::Announce3
                | PcbState::Running
        )
    }

    /// Advances PROBE_1 → PROBE_2 → PROBE_3 and ANNOUNCE_1 → … → RUNNING.
    pub fn next(&self) -> PcbState {
        match self {
            PcbState::Probe1 => PcbState::Probe2,
            PcbState::Probe2 => PcbState::Probe3,
            PcbState::Probe3 => PcbState::Announce1,
            PcbState::Announce1 => PcbState::Announce2,
            PcbState::Announce2 => PcbState::Announce3,
            PcbState::Announce3 => PcbState::Running,
            other => *other,
        }
    }
}

/// Protocol control block for one (interface, address family).
pub(crate) struct Pcb {
    pub state: PcbState,
    /// The interface's own address for this family, if the interface is up.
    pub addr: Option<IpAddr>,
    /// Services covered by the probe currently in flight.
    pub probe_services: Vec<ServiceId>,
    /// Whether the running probe also probes our A/AAAA records.
    pub probe_ip: bool,
    pub probe_running: bool,
    pub failed_probes: u8,
}

impl Pcb {
    fn new() -> Self {
        Self {
            state: PcbState::Off,
            addr: None,
            probe_services: Vec::new(),
            probe_ip: false,
            probe_running: false,
            failed_probes: 0,
        }
    }

    pub fn clear_probe(&mut self) {
        self.probe_services.clear();
        self.probe_ip = false;
        self.probe_running = false;
    }
}

struct IfaceEntry {
    id: IfaceId,
    pcbs: [Pcb; 2],
    /// The interface this one mirrors when both sit on the same subnet.
    dup_peer: Option<IfaceId>,
}

/// Static table of known interfaces.
pub(crate) struct IfaceTable {
    entries: Vec<IfaceEntry>,
    max_interfaces: usize,
    // Configured subnet-sharing pairs, applied as interfaces appear.
    dup_cfg: Vec<(IfaceId, IfaceId)>,
}

fn family_index(family: IpFamily) -> usize {
    match family {
        IpFamily::V4 => 0,
        IpFamily::V6 => 1,
    }
}

impl IfaceTable {
    pub fn new(max_interfaces: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_interfaces,
            dup_cfg: Vec::new(),
        }
    }

    /// Returns the PCB for `(iface, family)`, registering the interface on
    /// first use. Returns `None` when the interface table is full.
    pub fn pcb_mut(&mut self, iface: IfaceId, family: IpFamily) -> Option<&mut Pcb> {
        if !self.entries.iter().any(|e| e.id == iface) {
            if self.entries.len() >= self.max_interfaces {
                return None;
            }
            let dup_peer = self.dup_cfg.iter().find_map(|(a, b)| {
                if *a == iface {
                    Some(*b)
                } else if *b == iface {
                    Some(*a)
                } else {
                    None
                }
            });
            self.entries.push(IfaceEntry {
                id: iface,
                pcbs: [Pcb::new(), Pcb::new()],
                dup_peer,
            });
        }
        self.entries
            .iter_mut()
            .find(|e| e.id == iface)
            .map(|e| &mut e.pcbs[family_index(family)])
    }

    pub fn pcb(&self, iface: IfaceId, family: IpFamily) -> Option<&Pcb> {
        self.entries
            .iter()
            .find(|e| e.id == iface)
            .map(|e| &e.pcbs[family_index(family)])
    }

    /// All (interface, family) pairs currently registered.
    pub fn pairs(&self) -> Vec<(IfaceId, IpFamily)> {
        self.entries
            .iter()
            .flat_map(|e| [(e.id, IpFamily::V4), (e.id, IpFamily::V6)])
            .collect()
    }

    /// Marks two interfaces as sharing a subnet.
    pub fn set_dup_pair(&mut self, a: IfaceId, b: IfaceId) {
        self.dup_cfg.push((a, b));
        for entry in &mut self.entries {
            if entry.id == a {
                entry.dup_peer = Some(b);
            } else if entry.id == b {
                entry.dup_peer = Some(a);
            }
        }
    }

    /// The interface that may duplicate `iface`'s subnet, if configured.
    pub fn other_if(&self, iface: IfaceId) -> Option<IfaceId> {
        self.entries
            .iter()
            .find(|e| e.id == iface)?
            .dup_peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_progression() {
        let mut s = PcbState::Probe1;
        let expected = [
            PcbState::Probe2,
            PcbState::Probe3,
            PcbState::Announce1,
            PcbState::Announce2,
            PcbState::Announce3,
            PcbState::Running,
            PcbState::Running,
        ];
        for e in expected {
            s = s.next();
            assert_eq!(s, e);
        }
    }

    #[test]
    fn probing_predicates() {
        assert!(PcbState::Probe2.is_probing());
        assert!(!PcbState::Probe2.is_past_probing());
        assert!(PcbState::Announce1.is_past_probing());
        assert!(PcbState::Running.is_past_probing());
        assert!(!PcbState::Dup.is_probing());
        assert!(!PcbState::Dup.is_past_probing());
    }

    #[test]
    fn table_is_bounded() {
        let mut table = IfaceTable::new(2);
        assert!(table.pcb_mut(IfaceId(0), IpFamily::V4).is_some());
        assert!(table.pcb_mut(IfaceId(1), IpFamily::V6).is_some());
        assert!(table.pcb_mut(IfaceId(2), IpFamily::V4).is_none());
        // Known interfaces still resolve.
        assert!(table.pcb_mut(IfaceId(0), IpFamily::V6).is_some());
    }

    #[test]
    fn dup_pairs() {
        let mut table = IfaceTable::new(3);
        table.pcb_mut(IfaceId(0), IpFamily::V4);
        table.pcb_mut(IfaceId(1), IpFamily::V4);
        table.set_dup_pair(IfaceId(0), IfaceId(1));
        assert_eq!(table.other_if(IfaceId(0)), Some(IfaceId(1)));
        assert_eq!(table.other_if(IfaceId(1)), Some(IfaceId(0)));
        assert_eq!(table.other_if(IfaceId(2)), None);
    }
}
