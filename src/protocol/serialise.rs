//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If a section has more entries than its 16-bit counter can
    /// hold, or some RDATA is longer than 65535 octets.
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// See `to_octets`.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        let flags1 = flag(self.is_response, HEADER_MASK_QR)
            | (HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE))
            | flag(self.is_authoritative, HEADER_MASK_AA)
            | flag(self.is_truncated, HEADER_MASK_TC)
            | flag(self.recursion_desired, HEADER_MASK_RD);
        let flags2 = flag(self.recursion_available, HEADER_MASK_RA)
            | (HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE));

        buffer.write_u16(self.id);
        buffer.write_u8(flags1);
        buffer.write_u8(flags2);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        buffer.write_u16(self.rtype_with_data.rtype().into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);

        // patched once the RDATA is written
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        self.rtype_with_data.serialise(buffer);

        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        buffer.octets[rdlength_index..rdlength_index + 2].copy_from_slice(&rdlength.to_be_bytes());

        Ok(())
    }
}

impl RecordTypeWithData {
    /// Write the RDATA.  Names inside RDATA are never compressed, as
    /// RFC 3597 forbids it for types the receiver may not know.
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        match self {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname: name }
            | RecordTypeWithData::CNAME { cname: name }
            | RecordTypeWithData::PTR { ptrdname: name } => name.serialise(buffer, false),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                for field in [serial, refresh, retry, expire, minimum] {
                    buffer.write_u32(*field);
                }
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, false);
            }
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, false);
            }
            RecordTypeWithData::TXT { octets } | RecordTypeWithData::Unknown { octets, .. } => {
                buffer.write_octets(octets);
            }
        }
    }
}

impl DomainName {
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        if compress {
            if let Some(ptr) = buffer.name_pointer(self) {
                buffer.write_u16(ptr);
                return;
            }
        }

        buffer.memoise_name(self);
        for label in &self.labels {
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Error {
    /// A counter does not fit in the desired width.
    #[error("'{counter}' cannot be converted to a u{bits}")]
    CounterTooLarge { counter: usize, bits: u32 },
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(UDP_MAX_LEN),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Remember where a name starts, so later occurrences can point
    /// back to it.  Offsets beyond the 14-bit pointer range are not
    /// remembered.
    pub fn memoise_name(&mut self, name: &DomainName) {
        if name.is_root() || self.name_pointers.contains_key(name) {
            return;
        }

        if let Ok(index) = u16::try_from(self.index()) {
            if index <= 0b0011_1111_1111_1111 {
                self.name_pointers
                    .insert(name.clone(), 0b1100_0000_0000_0000 | index);
            }
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.put_u32(value);
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

fn flag(set: bool, mask: u8) -> u8 {
    if set {
        mask
    } else {
        0
    }
}

/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}
