//! Multicast DNS responder, resolver and DNS-SD browser.
//!
//! This crate implements the mDNS / DNS-SD protocol machinery for small
//! networked devices: it probes for and announces owned names on the
//! link-local multicast group, answers queries from peers, resolves name
//! collisions by renaming, and runs one-shot queries as well as long-lived
//! browse subscriptions.
//!
//! The entry point is [`responder::Responder`]. Network I/O, time and
//! randomness are collaborators behind the [`transport::Transport`],
//! [`clock::Clock`] and [`clock::Rng`] traits, so the whole protocol core
//! can be driven deterministically in tests.

mod hex;

pub mod clock;
pub mod name;
pub mod packet;
pub mod responder;
pub mod transport;

use std::fmt;

/// Size of packet buffers, and the largest datagram the encoder will produce.
///
/// mDNS works entirely within a local network, so it is not limited to the
/// 512 bytes of classic unicast DNS. We stay below the common Ethernet MTU
/// minus IP and UDP headers.
pub const MAX_PACKET_SIZE: usize = 1460;

/// The UDP port used by mDNS.
pub const MDNS_PORT: u16 = 5353;

/// Errors returned by the public [`responder`] API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A string argument was missing, empty, malformed, or over a length limit.
    InvalidArg,
    /// The operation is not valid in the responder's current state.
    InvalidState,
    /// The named service, hostname or subscription does not exist.
    NotFound,
    /// A service with the same instance, type, protocol and hostname is
    /// already registered.
    AlreadyExists,
    /// The action queue is at capacity; the operation can be retried.
    QueueFull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidArg => "invalid argument",
            Error::InvalidState => "operation invalid in the current state",
            Error::NotFound => "no such entry",
            Error::AlreadyExists => "entry already registered",
            Error::QueueFull => "action queue is full",
        })
    }
}

impl std::error::Error for Error {}
