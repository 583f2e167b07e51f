use std::fmt;

/// Errors produced by the packet codec.
///
/// Decoding errors abort the offending inbound datagram, which the
/// responder then drops silently (mDNS is best-effort; whatever the packet
/// carried will be retransmitted on the sender's own schedule). The one
/// encoding error is [`Error::Truncated`], raised when a probe,
/// announcement or response does not fit the outgoing datagram buffer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// The datagram ended while more data was expected: a truncated packet,
    /// or a record whose data claims to extend past the end.
    Eof,
    /// A name compression pointer referenced its own or a later offset.
    /// Honest encoders only point backwards; anything else would allow
    /// pointer loops.
    PointerLoop,
    /// A label length byte used the reserved `01`/`10` upper-bit patterns.
    InvalidValue,
    /// The message did not fit the outgoing datagram buffer. Only returned
    /// from [`MessageEncoder::finish`]; the packet is dropped rather than
    /// fragmented.
    ///
    /// [`MessageEncoder::finish`]: super::encoder::MessageEncoder::finish
    Truncated,
    /// An empty label was encountered where it is not allowed.
    InvalidEmptyLabel,
    /// A label exceeded the 63-byte label limit.
    LabelTooLong,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::Eof => "unexpected end of packet",
            Error::PointerLoop => "compression pointer does not point backwards",
            Error::InvalidValue => "reserved label length bits",
            Error::Truncated => "message does not fit the datagram buffer",
            Error::InvalidEmptyLabel => "invalid empty label",
            Error::LabelTooLong => "label exceeds the maximum label length",
        })
    }
}

impl std::error::Error for Error {}
