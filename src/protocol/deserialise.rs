//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let id = wire_header.header.id;

        // the counts come off the wire, so don't trust them for
        // preallocation beyond what the datagram could hold
        let mut questions = Vec::with_capacity(wire_header.qdcount.min(16).into());
        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }

        let mut records = |count: u16| -> Result<Vec<ResourceRecord>, Error> {
            let mut rrs = Vec::with_capacity(count.min(16).into());
            for _ in 0..count {
                rrs.push(ResourceRecord::deserialise(id, buffer)?);
            }
            Ok(rrs)
        };
        let answers = records(wire_header.ancount)?;
        let authority = records(wire_header.nscount)?;
        let additional = records(wire_header.arcount)?;

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

/// A `Header` plus the four section counts, as it appears on the
/// wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WireHeader {
    pub header: Header,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let too_short = Error::HeaderTooShort(id);
        let flags1 = buffer.next_u8().ok_or(too_short)?;
        let flags2 = buffer.next_u8().ok_or(too_short)?;
        let qdcount = buffer.next_u16().ok_or(too_short)?;
        let ancount = buffer.next_u16().ok_or(too_short)?;
        let nscount = buffer.next_u16().ok_or(too_short)?;
        let arcount = buffer.next_u16().ok_or(too_short)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        let qclass = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;

        Ok(Self {
            name,
            qtype: QueryType::from(qtype),
            qclass: QueryClass::from(qclass),
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let too_short = Error::ResourceRecordTooShort(id);

        let name = DomainName::deserialise(id, buffer)?;
        let rtype = RecordType::from(buffer.next_u16().ok_or(too_short)?);
        let rclass = RecordClass::from(buffer.next_u16().ok_or(too_short)?);
        let ttl = buffer.next_u32().ok_or(too_short)?;
        let rdlength = usize::from(buffer.next_u16().ok_or(too_short)?);

        let rdata_start = buffer.position;

        // records which contain names are parsed field by field, so
        // that compression pointers get expanded.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(buffer.next_u32().ok_or(too_short)?),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: buffer.next_u32().ok_or(too_short)?,
                refresh: buffer.next_u32().ok_or(too_short)?,
                retry: buffer.next_u32().ok_or(too_short)?,
                expire: buffer.next_u32().ok_or(too_short)?,
                minimum: buffer.next_u32().ok_or(too_short)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or(too_short)?,
                exchange: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: buffer.take_bytes(rdlength).ok_or(too_short)?,
            },
            RecordType::AAAA => {
                let octets: [u8; 16] = buffer
                    .take(16)
                    .and_then(|os| os.try_into().ok())
                    .ok_or(too_short)?;
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(octets),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or(too_short)?,
                weight: buffer.next_u16().ok_or(too_short)?,
                port: buffer.next_u16().ok_or(too_short)?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: buffer.take_bytes(rdlength).ok_or(too_short)?,
            },
        };

        if buffer.position == rdata_start + rdlength {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut len = 0;
        let start = buffer.position;

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            if size == 0 {
                labels.push(Label::new());
                len += 1;
                break;
            } else if usize::from(size) <= LABEL_MAX_LEN {
                let octets = buffer
                    .take(size.into())
                    .ok_or(Error::DomainTooShort(id))?;
                let label = Label::try_from(octets).map_err(|_| Error::DomainLabelInvalid(id))?;
                len += 1 + label.len() as usize;
                labels.push(label);

                if len > DOMAINNAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }
            } else if size >= 0b1100_0000 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                // the target must come strictly before this name
                // (RFC 1035 section 4.1.4), which also rules out loops
                if ptr >= start {
                    return Err(Error::DomainPointerInvalid(id));
                }

                let other = DomainName::deserialise(id, &mut buffer.at_offset(ptr))?;
                len += other.len;
                labels.extend(other.labels);
                break;
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        if len <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { labels, len })
        } else {
            Err(Error::DomainTooLong(id))
        }
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header, so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  No error can be sent back, as it could
    /// not be linked with the query.
    #[error("datagram too short to contain an ID")]
    CompletelyBusted,

    #[error("header is missing one or more fields")]
    HeaderTooShort(u16),

    #[error("question ends with an incomplete field")]
    QuestionTooShort(u16),

    #[error("resource record ends with an incomplete field")]
    ResourceRecordTooShort(u16),

    /// The RDATA did not occupy exactly RDLENGTH octets.
    #[error("resource record RDATA does not match RDLENGTH")]
    ResourceRecordInvalid(u16),

    #[error("domain name is incomplete")]
    DomainTooShort(u16),

    #[error("domain name is over 255 octets")]
    DomainTooLong(u16),

    #[error("domain name pointer does not point backwards")]
    DomainPointerInvalid(u16),

    /// A length octet with one of the two reserved high-bit
    /// patterns.
    #[error("domain name label has a reserved length prefix")]
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        let octet = *self.octets.get(self.position)?;
        self.position += 1;
        Some(octet)
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let octets = self.take(2)?;
        Some(u16::from_be_bytes([octets[0], octets[1]]))
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let octets = self.take(4)?;
        Some(u32::from_be_bytes([
            octets[0], octets[1], octets[2], octets[3],
        ]))
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        let slice = self.octets.get(self.position..self.position.checked_add(size)?)?;
        self.position += size;
        Some(slice)
    }

    pub fn take_bytes(&mut self, size: usize) -> Option<Bytes> {
        self.take(size).map(Bytes::copy_from_slice)
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}
