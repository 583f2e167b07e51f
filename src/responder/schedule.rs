//! The transmit queue.
//!
//! Packets waiting to go out are held in a single list ordered by their
//! send-at time. The periodic scheduler sweep marks due packets and hands
//! them to the action loop by id; a packet whose id no longer matches the
//! queue head by the time its action runs is silently skipped (it was
//! cancelled or superseded in the meantime).

use crate::packet::Type;
use crate::transport::{IfaceId, IpFamily};

use super::outbound::TxPacket;
use super::registry::ServiceId;

pub(crate) struct TxQueue {
    // Ordered by `send_at`, ties FIFO.
    items: Vec<TxPacket>,
    next_id: u64,
}

impl TxQueue {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
        }
    }

    /// Schedules `packet` to be sent `after_ms` milliseconds from `now`.
    pub fn schedule(&mut self, mut packet: TxPacket, after_ms: u64, now: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        packet.id = id;
        packet.send_at = now + after_ms;
        packet.queued = false;
        let pos = self
            .items
            .iter()
            .position(|p| p.send_at > packet.send_at)
            .unwrap_or(self.items.len());
        self.items.insert(pos, packet);
        id
    }

    /// Returns the ids of due, not-yet-queued packets in send order.
    pub fn due(&self, now: u64) -> Vec<u64> {
        self.items
            .iter()
            .filter(|p| !p.queued && p.send_at <= now)
            .map(|p| p.id)
            .collect()
    }

    /// Marks a packet as handed to the action loop; [`TxQueue::take_head`]
    /// only surrenders marked packets.
    pub fn mark_queued(&mut self, id: u64) {
        if let Some(p) = self.items.iter_mut().find(|p| p.id == id) {
            p.queued = true;
        }
    }

    /// Removes and returns the queue head, but only if it is the packet the
    /// action was enqueued for.
    pub fn take_head(&mut self, id: u64) -> Option<TxPacket> {
        match self.items.first() {
            Some(head) if head.id == id && head.queued => Some(self.items.remove(0)),
            _ => None,
        }
    }

    /// Drops every packet scheduled against `(iface, family)`.
    pub fn clear_pcb(&mut self, iface: IfaceId, family: IpFamily) {
        self.items
            .retain(|p| !(p.iface == iface && p.family == family));
    }

    /// Removes scheduled answers of `rtype` for `service` from pending
    /// answer packets on `(iface, family)`; peers already answered them.
    /// Packets that become empty are dropped.
    pub fn remove_answer(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        rtype: Type,
        service: Option<ServiceId>,
    ) {
        for p in &mut self.items {
            if p.iface != iface || p.family != family || p.queued {
                continue;
            }
            if !p.authoritative || !p.questions.is_empty() {
                continue;
            }
            p.answers.retain(|a| !a.matches(rtype, service));
        }
        self.items.retain(|p| p.queued || !p.is_empty());
    }

    /// Drops every reference to a removed service from pending packets.
    pub fn remove_service_refs(&mut self, id: ServiceId) {
        for p in &mut self.items {
            p.answers.retain(|a| !a.is_for_service(id));
            p.authority.retain(|a| !a.is_for_service(id));
            p.additional.retain(|a| !a.is_for_service(id));
        }
        self.items.retain(|p| p.queued || !p.is_empty());
    }

    /// The queue is non-decreasing in send-at time from head to tail.
    #[cfg(test)]
    pub fn is_ordered(&self) -> bool {
        self.items.windows(2).all(|w| w[0].send_at <= w[1].send_at)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> TxPacket {
        TxPacket::new(IfaceId(0), IpFamily::V4)
    }

    fn mark_all(q: &mut TxQueue, now: u64) -> Vec<u64> {
        let due = q.due(now);
        for id in &due {
            q.mark_queued(*id);
        }
        due
    }

    #[test]
    fn ordering_and_fifo_ties() {
        let mut q = TxQueue::new();
        let a = q.schedule(packet(), 100, 0);
        let b = q.schedule(packet(), 50, 0);
        let c = q.schedule(packet(), 100, 0);
        assert!(q.is_ordered());

        // b first (earliest), then a before c (FIFO among equal send-ats).
        assert_eq!(q.due(200), vec![b, a, c]);
    }

    #[test]
    fn take_head_requires_matching_id() {
        let mut q = TxQueue::new();
        let a = q.schedule(packet(), 10, 0);
        let b = q.schedule(packet(), 20, 0);
        mark_all(&mut q, 30);
        assert!(q.take_head(b).is_none(), "b is not the head");
        assert!(q.take_head(a).is_some());
        assert!(q.take_head(b).is_some());
    }

    #[test]
    fn take_head_requires_queued() {
        let mut q = TxQueue::new();
        let a = q.schedule(packet(), 10, 0);
        assert!(q.take_head(a).is_none(), "not marked as handed over yet");
        mark_all(&mut q, 10);
        assert!(q.take_head(a).is_some());
    }

    #[test]
    fn due_skips_already_queued() {
        let mut q = TxQueue::new();
        let a = q.schedule(packet(), 10, 0);
        assert_eq!(q.due(10), vec![a]);
        q.mark_queued(a);
        assert!(q.due(10).is_empty());
    }

    #[test]
    fn clear_pcb_only_touches_that_pcb() {
        let mut q = TxQueue::new();
        q.schedule(packet(), 10, 0);
        q.schedule(TxPacket::new(IfaceId(1), IpFamily::V4), 10, 0);
        q.clear_pcb(IfaceId(0), IpFamily::V4);
        assert_eq!(q.len(), 1);
    }
}
