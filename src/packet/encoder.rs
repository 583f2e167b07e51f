//! DNS packet encoder.
//!
//! The encoder mirrors the decoder's typestate design: a [`MessageEncoder`]
//! starts out in the *Question* section and is advanced through the *Answer*,
//! *Authority* and *Additional Records* sections.
//!
//! Domain names are compressed: every name written to the message is
//! remembered together with its offset, and later names reuse the longest
//! matching suffix via a 14-bit back-pointer. Pointers can only reference
//! offsets that have already been written, so an encoded message never
//! contains a pointer to its own or a later position.

use core::marker::PhantomData;
use std::mem::{align_of, size_of};

use bytemuck::Zeroable;

use super::{
    records::{Record, ResourceRecordEncoder},
    section::{self, Section},
    Class, Error, Header, QClass, QType,
};
use crate::name::DomainName;

pub(crate) struct Writer<'a> {
    pub(crate) buf: &'a mut [u8],
    pub(crate) pos: usize,
    pub(crate) trunc: bool,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            trunc: false,
        }
    }

    fn modify_header(&mut self, with: impl FnOnce(&mut Header)) {
        assert_eq!(align_of::<Header>(), 1);

        let h = bytemuck::from_bytes_mut(&mut self.buf[..size_of::<Header>()]);
        with(h);
    }

    pub(crate) fn write_slice(&mut self, data: &[u8]) {
        let buf = &mut self.buf[self.pos..];
        if data.len() > buf.len() {
            self.trunc = true;
            buf.copy_from_slice(&data[..buf.len()]);
            self.pos += buf.len();
        } else {
            buf[..data.len()].copy_from_slice(data);
            self.pos += data.len();
        }
    }

    pub(crate) fn write_u8(&mut self, b: u8) {
        self.write_slice(&[b]);
    }

    pub(crate) fn write_u16(&mut self, v: u16) {
        self.write_slice(&v.to_be_bytes());
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.write_slice(&v.to_be_bytes());
    }

    /// Writes a domain name as plain length-prefixed labels, without
    /// compression.
    pub(crate) fn write_domain_name_plain(&mut self, name: &DomainName) {
        for label in name.labels() {
            self.write_u8(label.as_bytes().len() as u8);
            self.write_slice(label.as_bytes());
        }
        // Implicit root label at the end.
        self.write_u8(0);
    }

    /// Writes a domain name, compressing against (and extending) `comp`.
    pub(crate) fn write_domain_name(&mut self, name: &DomainName, comp: &mut NameCompressor) {
        let labels = name.labels();
        // The first suffix that was seen before ends the label run.
        let (run, pointer) = match comp.find_longest_suffix(name) {
            Some((skip, offset)) => (skip, Some(offset)),
            None => (labels.len(), None),
        };

        for i in 0..run {
            if !self.trunc && self.pos < NameCompressor::MAX_OFFSET {
                comp.remember(self.pos as u16, labels[i..].iter().collect());
            }
            self.write_u8(labels[i].as_bytes().len() as u8);
            self.write_slice(labels[i].as_bytes());
        }

        match pointer {
            Some(offset) => self.write_u16(0xC000 | offset),
            None => self.write_u8(0),
        }
    }

    pub(crate) fn write_character_string(&mut self, string: &[u8]) {
        assert!(string.len() <= 255);
        self.write_u8(string.len() as u8);
        self.write_slice(string);
    }
}

/// Remembers the offsets of domain names already written to a message.
#[derive(Default)]
pub(crate) struct NameCompressor {
    // Offset and label suffix of every name position written so far.
    seen: Vec<(u16, DomainName)>,
}

impl NameCompressor {
    // Compression pointers carry a 14-bit offset.
    const MAX_OFFSET: usize = 0x3FFF;

    fn remember(&mut self, offset: u16, suffix: DomainName) {
        self.seen.push((offset, suffix));
    }

    /// Finds the longest already-written suffix of `name`.
    ///
    /// Returns the number of leading labels that have to be written out,
    /// and the offset the remaining suffix can point at.
    fn find_longest_suffix(&self, name: &DomainName) -> Option<(usize, u16)> {
        let labels = name.labels();
        for skip in 0..labels.len() {
            let suffix: DomainName = labels[skip..].iter().collect();
            if let Some((offset, _)) = self
                .seen
                .iter()
                .find(|(_, seen)| seen.eq_ignore_ascii_case(&suffix))
            {
                return Some((skip, *offset));
            }
        }
        None
    }
}

struct EncoderInner<'a> {
    w: Writer<'a>,
    comp: NameCompressor,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl<'a> Drop for EncoderInner<'a> {
    fn drop(&mut self) {
        let trunc = self.w.trunc;
        self.w.modify_header(|h| {
            h.set_qdcount(self.qdcount);
            h.set_ancount(self.ancount);
            h.set_nscount(self.nscount);
            h.set_arcount(self.arcount);
            h.set_truncated(trunc);
        });
    }
}

pub struct MessageEncoder<'a, S: Section> {
    inner: EncoderInner<'a>,
    _p: PhantomData<S>,
}

impl<'a, S: Section> MessageEncoder<'a, S> {
    /// Overrides the whole message header.
    ///
    /// Note that the [`MessageEncoder`] will modify some header fields on
    /// drop, to ensure that the message can be parsed correctly.
    pub fn set_header(&mut self, header: Header) {
        self.inner.w.modify_header(|h| *h = header);
    }

    /// Finishes encoding the packet, and returns the number of bytes that
    /// were written to the buffer.
    ///
    /// If the message was truncated because the provided buffer was too
    /// small, this will return [`Error::Truncated`], and the message's
    /// truncation bit will be set. In that case, the user can still decide to
    /// send the message.
    pub fn finish(self) -> Result<usize, Error> {
        let bytes_written = self.inner.w.pos;

        if self.inner.w.trunc {
            Err(Error::Truncated)
        } else {
            Ok(bytes_written)
        }
    }
}

impl<'a> MessageEncoder<'a, section::Question> {
    /// Creates a new message encoder that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let mut w = Writer::new(buf);
        w.write_slice(bytemuck::bytes_of(&Header::zeroed()));
        Self {
            inner: EncoderInner {
                w,
                comp: NameCompressor::default(),
                qdcount: 0,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            _p: PhantomData,
        }
    }

    /// Adds a question to the *Question* section.
    pub fn question(&mut self, question: Question<'_>) {
        self.inner
            .w
            .write_domain_name(question.name, &mut self.inner.comp);
        self.inner.w.write_u16(question.ty.0);
        let mut class = question.class.0;
        if question.unicast_response {
            class |= 0x8000;
        }
        self.inner.w.write_u16(class);
        self.inner.qdcount += 1;
    }

    /// Moves the encoder to the *Answer* section.
    #[inline]
    pub fn answers(self) -> MessageEncoder<'a, section::Answer> {
        MessageEncoder {
            inner: self.inner,
            _p: PhantomData,
        }
    }
}

impl<'a, S: Section> MessageEncoder<'a, S> {
    fn write_rr(&mut self, rr: ResourceRecord<'_>) {
        let w = &mut self.inner.w;
        w.write_domain_name(rr.name, &mut self.inner.comp);
        w.write_u16(rr.rdata.record_type().0);
        let mut class = rr.class.0;
        if rr.cache_flush {
            class |= 0x8000;
        }
        w.write_u16(class);
        w.write_u32(rr.ttl);
        // a little inscrutable seek dance :3
        let lenpos = w.pos;
        w.write_u16(0); // dummy length
        let before_rdata = w.pos;
        let mut enc = ResourceRecordEncoder {
            w,
            comp: &mut self.inner.comp,
        };
        rr.rdata.encode(&mut enc);
        let w = &mut self.inner.w;
        let rdata_len = w.pos - before_rdata;
        if !w.trunc {
            let finished_pos = w.pos;
            w.pos = lenpos;
            w.write_u16(rdata_len.try_into().expect("RDATA length overflows u16"));
            w.pos = finished_pos;
        }
    }
}

impl<'a> MessageEncoder<'a, section::Answer> {
    pub fn add_answer(&mut self, rr: ResourceRecord<'_>) {
        self.write_rr(rr);
        self.inner.ancount += 1;
    }

    /// Moves the encoder to the *Authority* section.
    #[inline]
    pub fn authority(self) -> MessageEncoder<'a, section::Authority> {
        MessageEncoder {
            inner: self.inner,
            _p: PhantomData,
        }
    }

    /// Moves the encoder to the *Additional Records* section.
    #[inline]
    pub fn additional(self) -> MessageEncoder<'a, section::Additional> {
        self.authority().additional()
    }
}

impl<'a> MessageEncoder<'a, section::Authority> {
    pub fn add_authority(&mut self, rr: ResourceRecord<'_>) {
        self.write_rr(rr);
        self.inner.nscount += 1;
    }

    /// Moves the encoder to the *Additional Records* section.
    #[inline]
    pub fn additional(self) -> MessageEncoder<'a, section::Additional> {
        MessageEncoder {
            inner: self.inner,
            _p: PhantomData,
        }
    }
}

impl<'a> MessageEncoder<'a, section::Additional> {
    pub fn add_additional(&mut self, rr: ResourceRecord<'_>) {
        self.write_rr(rr);
        self.inner.arcount += 1;
    }
}

pub struct Question<'a> {
    name: &'a DomainName,
    class: QClass,
    ty: QType,
    unicast_response: bool,
}

impl<'a> Question<'a> {
    /// Creates a question asking for all records ([`QType::ANY`]) in the
    /// internet class ([`QClass::IN`]) pertaining to `name`.
    #[inline]
    pub fn new(name: &'a DomainName) -> Self {
        Self {
            name,
            class: QClass::IN,
            ty: QType::ANY,
            unicast_response: false,
        }
    }

    /// Sets the record class to query.
    #[inline]
    pub fn class(self, class: QClass) -> Self {
        Self { class, ..self }
    }

    /// Sets the resource type to query.
    #[inline]
    pub fn ty(self, ty: QType) -> Self {
        Self { ty, ..self }
    }

    /// Requests a direct unicast response by setting the top bit of the
    /// class field.
    #[inline]
    pub fn unicast_response(self, unicast: bool) -> Self {
        Self {
            unicast_response: unicast,
            ..self
        }
    }
}

pub struct ResourceRecord<'a> {
    name: &'a DomainName,
    class: Class,
    cache_flush: bool,
    ttl: u32,
    rdata: &'a Record<'a>,
}

impl<'a> ResourceRecord<'a> {
    pub fn new(name: &'a DomainName, rdata: &'a Record<'a>) -> Self {
        Self {
            name,
            class: Class::IN,
            cache_flush: false,
            ttl: 0,
            rdata,
        }
    }

    #[inline]
    pub fn class(self, class: Class) -> Self {
        Self { class, ..self }
    }

    #[inline]
    pub fn ttl(self, ttl: u32) -> Self {
        Self { ttl, ..self }
    }

    /// Sets the mDNS cache-flush bit (top bit of the class field).
    #[inline]
    pub fn cache_flush(self, cache_flush: bool) -> Self {
        Self {
            cache_flush,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::packet::decoder::MessageDecoder;
    use crate::packet::records::{A, PTR, SRV};

    use super::*;

    fn domain(s: &str) -> DomainName {
        DomainName::from_str(s).unwrap()
    }

    #[test]
    fn encode_query_roundtrip() {
        let mut buf = [0; 512];
        let name = domain("alpha.local");
        let mut enc = MessageEncoder::new(&mut buf);
        enc.question(Question::new(&name).ty(QType::A));
        enc.question(Question::new(&name).ty(QType::AAAA).unicast_response(true));
        let len = enc.finish().unwrap();

        let mut dec = MessageDecoder::new(&buf[..len]).unwrap();
        let q1 = dec.next().unwrap().unwrap();
        assert_eq!(q1.qname().to_string(), "alpha.local.");
        assert_eq!(q1.qtype(), QType::A);
        assert!(!q1.unicast_response());
        let q2 = dec.next().unwrap().unwrap();
        assert_eq!(q2.qname().to_string(), "alpha.local.");
        assert_eq!(q2.qtype(), QType::AAAA);
        assert!(q2.unicast_response());
        assert!(dec.next().is_none());
    }

    #[test]
    fn compression_reuses_suffixes() {
        let mut buf = [0; 512];
        let service = domain("_http._tcp.local");
        let instance = domain("kitchen._http._tcp.local");
        let host = domain("kitchen.local");

        let enc = MessageEncoder::new(&mut buf);
        let mut enc = enc.answers();
        let ptr = Record::PTR(PTR::new(instance.clone()));
        enc.add_answer(ResourceRecord::new(&service, &ptr).ttl(4500));
        let srv = Record::SRV(SRV::new(0, 0, 80, host.clone()));
        enc.add_answer(ResourceRecord::new(&instance, &srv).ttl(120));
        let a = Record::A(A::new(Ipv4Addr::new(192, 0, 2, 5)));
        enc.add_answer(ResourceRecord::new(&host, &a).ttl(120));
        let len = enc.finish().unwrap();

        // The instance name in the SRV owner must be a single pointer to the
        // PTR rdata; without compression this message is far larger.
        let plain = service.encoded_len()
            + instance.encoded_len() * 2
            + host.encoded_len() * 2
            + Header::SIZE
            + 3 * 10 // type/class/ttl/rdlength
            + 6 // SRV prio/weight/port
            + 4; // A rdata
        assert!(len < plain, "{} >= {}", len, plain);

        // No pointer may reference its own offset or beyond.
        let mut i = Header::SIZE;
        while i + 1 < len {
            if buf[i] & 0xC0 == 0xC0 {
                let target = usize::from(u16::from_be_bytes([buf[i] & 0x3F, buf[i + 1]]));
                assert!(target < i, "forward pointer at {}: {}", i, target);
            }
            i += 1;
        }

        // And the message still decodes to the same records.
        let dec = MessageDecoder::new(&buf[..len]).unwrap();
        let mut dec = dec.answers().unwrap();
        let rr = dec.next().unwrap().unwrap();
        assert_eq!(rr.name().to_string(), "_http._tcp.local.");
        match rr.as_enum().unwrap().unwrap() {
            Record::PTR(ptr) => {
                assert_eq!(ptr.ptrdname().to_string(), "kitchen._http._tcp.local.")
            }
            other => panic!("{:?}", other),
        }
        let rr = dec.next().unwrap().unwrap();
        assert_eq!(rr.name().to_string(), "kitchen._http._tcp.local.");
        match rr.as_enum().unwrap().unwrap() {
            Record::SRV(srv) => {
                assert_eq!(srv.port(), 80);
                assert_eq!(srv.target().to_string(), "kitchen.local.");
            }
            other => panic!("{:?}", other),
        }
        let rr = dec.next().unwrap().unwrap();
        assert_eq!(rr.name().to_string(), "kitchen.local.");
    }

    #[test]
    fn truncation_is_reported() {
        let mut buf = [0; 16];
        let name = domain("a-name-that-does-not-fit.local");
        let mut enc = MessageEncoder::new(&mut buf);
        enc.question(Question::new(&name));
        assert_eq!(enc.finish(), Err(Error::Truncated));
    }

    #[test]
    fn cache_flush_roundtrip() {
        let mut buf = [0; 128];
        let name = domain("alpha.local");
        let a = Record::A(A::new(Ipv4Addr::new(192, 0, 2, 1)));
        let enc = MessageEncoder::new(&mut buf);
        let mut enc = enc.answers();
        enc.add_answer(ResourceRecord::new(&name, &a).ttl(120).cache_flush(true));
        let len = enc.finish().unwrap();

        let dec = MessageDecoder::new(&buf[..len]).unwrap();
        let mut dec = dec.answers().unwrap();
        let rr = dec.next().unwrap().unwrap();
        assert!(rr.cache_flush());
        assert_eq!(rr.class(), Class::IN);
    }
}
