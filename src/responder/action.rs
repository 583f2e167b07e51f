//! The action queue.
//!
//! Every mutation of responder state is expressed as an [`Action`] and
//! applied by the single executor loop, in enqueue order. The queue is
//! bounded; posting to a full queue fails with [`Error::QueueFull`] and the
//! caller decides whether to retry, drop, or revert bookkeeping.

use std::net::IpAddr;
use std::sync::mpsc::{SyncSender, TrySendError};

use crate::transport::{IfaceId, IpFamily, RxFrame};
use crate::Error;

use super::browse::Browse;
use super::query::Search;

/// Interface lifecycle events delivered by the embedding application.
#[derive(Debug, Clone)]
pub enum NetifEvent {
    /// The interface came up (or changed address) for this family.
    Up(IpAddr),
    /// The interface went away for this family.
    Down,
    /// Re-announce all records without re-probing.
    Announce,
}

pub(crate) enum Action {
    SystemEvent {
        iface: IfaceId,
        family: IpFamily,
        event: NetifEvent,
    },
    HostnameSet {
        hostname: String,
        done: SyncSender<()>,
    },
    InstanceSet {
        instance: Option<String>,
    },
    SearchAdd(Box<Search>),
    SearchSend {
        id: u64,
    },
    SearchEnd {
        id: u64,
    },
    BrowseAdd(Box<Browse>),
    /// `(browse id, result key)` pairs accumulated while parsing one packet.
    BrowseSync {
        changes: Vec<(u64, u64)>,
    },
    BrowseEnd {
        id: u64,
    },
    TxHandle {
        packet: u64,
    },
    RxHandle(RxFrame),
    DelegateAdd {
        hostname: String,
        addrs: Vec<IpAddr>,
        done: SyncSender<()>,
    },
    DelegateSetAddrs {
        hostname: String,
        addrs: Vec<IpAddr>,
    },
    DelegateRemove {
        hostname: String,
        done: SyncSender<()>,
    },
    Stop {
        done: SyncSender<()>,
    },
}

/// Posts an action without blocking, mapping a full queue to
/// [`Error::QueueFull`].
pub(crate) fn post(tx: &SyncSender<Action>, action: Action) -> Result<(), Error> {
    match tx.try_send(action) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(Error::QueueFull),
        Err(TrySendError::Disconnected(_)) => Err(Error::InvalidState),
    }
}
