use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};

use crate::dns_message::WireError;

/// The only class this server answers for
pub const CLASS_IN: u16 = 1;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 16;

/// DNS Question Section
/// Format: QNAME + QTYPE (2 bytes) + QCLASS (2 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String, // Fully qualified, always ends with '.'
    pub qtype: RecordType,
    pub qclass: u16,
}

/// DNS Resource Record
/// Format: NAME + TYPE (2 bytes) + CLASS (2 bytes) + TTL (4 bytes) + RDLENGTH (2 bytes) + RDATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>, // Already in wire format
}

/// Record types with a presentation form this server understands.
/// Anything else is carried as `Unknown` with its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    SOA,
    NS,
    A,
    AAAA,
    CNAME,
    MX,
    TXT,
    SRV,
    PTR,
    HINFO,
    CAA,
    SSHFP,
    URI,
    LOC,
    OPT,
    Unknown(u16),
}

const NAMED_TYPES: [(RecordType, u16, &str); 15] = [
    (RecordType::A, 1, "A"),
    (RecordType::NS, 2, "NS"),
    (RecordType::CNAME, 5, "CNAME"),
    (RecordType::SOA, 6, "SOA"),
    (RecordType::PTR, 12, "PTR"),
    (RecordType::HINFO, 13, "HINFO"),
    (RecordType::MX, 15, "MX"),
    (RecordType::TXT, 16, "TXT"),
    (RecordType::AAAA, 28, "AAAA"),
    (RecordType::LOC, 29, "LOC"),
    (RecordType::SRV, 33, "SRV"),
    (RecordType::OPT, 41, "OPT"),
    (RecordType::SSHFP, 44, "SSHFP"),
    (RecordType::URI, 256, "URI"),
    (RecordType::CAA, 257, "CAA"),
];

/// Registered types carried as opaque rdata. Values need the `\# len hex` form.
const OPAQUE_TYPES: [(u16, &str); 32] = [
    (3, "MD"),
    (4, "MF"),
    (7, "MB"),
    (8, "MG"),
    (9, "MR"),
    (11, "WKS"),
    (14, "MINFO"),
    (17, "RP"),
    (18, "AFSDB"),
    (24, "SIG"),
    (25, "KEY"),
    (35, "NAPTR"),
    (36, "KX"),
    (37, "CERT"),
    (39, "DNAME"),
    (42, "APL"),
    (43, "DS"),
    (45, "IPSECKEY"),
    (46, "RRSIG"),
    (47, "NSEC"),
    (48, "DNSKEY"),
    (49, "DHCID"),
    (50, "NSEC3"),
    (51, "NSEC3PARAM"),
    (52, "TLSA"),
    (53, "SMIMEA"),
    (59, "CDS"),
    (60, "CDNSKEY"),
    (61, "OPENPGPKEY"),
    (64, "SVCB"),
    (65, "HTTPS"),
    (99, "SPF"),
];

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        NAMED_TYPES
            .iter()
            .find(|(_, code, _)| *code == value)
            .map(|(rtype, _, _)| *rtype)
            .unwrap_or(RecordType::Unknown(value))
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::Unknown(code) => code,
            named => NAMED_TYPES
                .iter()
                .find(|(rtype, _, _)| *rtype == named)
                .map(|(_, code, _)| *code)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((_, _, mnemonic)) = NAMED_TYPES.iter().find(|(rtype, _, _)| rtype == self) {
            return f.write_str(mnemonic);
        }

        let code = self.to_u16();
        match OPAQUE_TYPES.iter().find(|(opaque, _)| *opaque == code) {
            Some((_, mnemonic)) => f.write_str(mnemonic),
            None => write!(f, "TYPE{}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown record type: {0}")]
pub struct UnknownRecordType(pub String);

impl FromStr for RecordType {
    type Err = UnknownRecordType;

    /// Accepts mnemonics in any case and the generic `TYPEnnn` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();

        if let Some((rtype, _, _)) = NAMED_TYPES.iter().find(|(_, _, m)| *m == upper) {
            return Ok(*rtype);
        }
        if let Some((code, _)) = OPAQUE_TYPES.iter().find(|(_, m)| *m == upper) {
            return Ok(RecordType::Unknown(*code));
        }

        upper
            .strip_prefix("TYPE")
            .and_then(|code| code.parse::<u16>().ok())
            .map(RecordType::from_u16)
            .ok_or_else(|| UnknownRecordType(s.to_string()))
    }
}

impl DnsQuestion {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        DnsQuestion {
            name: fqdn(name),
            qtype,
            qclass: CLASS_IN,
        }
    }

    /// Parse a DNS question from bytes starting at the given offset
    /// Returns the question and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        let mut fixed = bytes
            .get(new_offset..new_offset + 4)
            .ok_or(WireError::Truncated("question"))?;

        let qtype = RecordType::from_u16(fixed.get_u16());
        let qclass = fixed.get_u16();

        Ok((
            DnsQuestion {
                name,
                qtype,
                qclass,
            },
            new_offset + 4,
        ))
    }

    pub fn write_to<B: BufMut>(&self, out: &mut B) -> Result<(), WireError> {
        encode_domain_name(&self.name, out)?;
        out.put_u16(self.qtype.to_u16());
        out.put_u16(self.qclass);
        Ok(())
    }
}

impl DnsAnswer {
    /// Create an IN-class record with rdata already encoded
    pub fn new(name: &str, rtype: RecordType, ttl: u32, rdata: Vec<u8>) -> Self {
        DnsAnswer {
            name: fqdn(name),
            rtype,
            rclass: CLASS_IN,
            ttl,
            rdata,
        }
    }

    /// Parse a resource record from bytes starting at the given offset
    /// Returns the record and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        let mut fixed = bytes
            .get(new_offset..new_offset + 10)
            .ok_or(WireError::Truncated("resource record"))?;

        let rtype = RecordType::from_u16(fixed.get_u16());
        let rclass = fixed.get_u16();
        let ttl = fixed.get_u32();
        let rdlength = fixed.get_u16() as usize;

        let data_offset = new_offset + 10;
        let rdata = bytes
            .get(data_offset..data_offset + rdlength)
            .ok_or(WireError::Truncated("rdata"))?
            .to_vec();

        Ok((
            DnsAnswer {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            data_offset + rdlength,
        ))
    }

    pub fn write_to<B: BufMut>(&self, out: &mut B) -> Result<(), WireError> {
        let rdlength =
            u16::try_from(self.rdata.len()).map_err(|_| WireError::RdataTooLong(self.rdata.len()))?;

        encode_domain_name(&self.name, out)?;
        out.put_u16(self.rtype.to_u16());
        out.put_u16(self.rclass);
        out.put_u32(self.ttl);
        out.put_u16(rdlength);
        out.put_slice(&self.rdata);
        Ok(())
    }
}

/// Append the root label separator if the name does not already end with one
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Parse a domain name from DNS message format
/// Supports DNS name compression (pointers)
/// Returns the fully qualified name (trailing '.') and the offset just past it
pub fn parse_domain_name(bytes: &[u8], mut offset: usize) -> Result<(String, usize), WireError> {
    let mut labels = Vec::new();
    let mut resume_offset = None;
    let mut jumps = 0;

    loop {
        let length = *bytes.get(offset).ok_or(WireError::Truncated("domain name"))?;

        // Compression pointer: the next 14 bits are an offset into the message
        if length & 0xC0 == 0xC0 {
            let low = *bytes
                .get(offset + 1)
                .ok_or(WireError::Truncated("compression pointer"))?;

            if resume_offset.is_none() {
                resume_offset = Some(offset + 2);
            }

            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WireError::PointerLoop);
            }

            offset = u16::from_be_bytes([length & 0x3F, low]) as usize;
            continue;
        }

        offset += 1;
        if length == 0 {
            break;
        }

        let label = bytes
            .get(offset..offset + length as usize)
            .ok_or(WireError::Truncated("label"))?;
        let label = std::str::from_utf8(label).map_err(|_| WireError::InvalidLabel)?;

        labels.push(label.to_string());
        offset += length as usize;
    }

    let mut name = labels.join(".");
    name.push('.');
    Ok((name, resume_offset.unwrap_or(offset)))
}

/// Encode a domain name to DNS message format
/// Format: length-prefixed labels terminated with a null byte
/// Example: "example.com." -> [7]example[3]com[0]
pub fn encode_domain_name<B: BufMut>(name: &str, out: &mut B) -> Result<(), WireError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);

    if trimmed.is_empty() {
        out.put_u8(0);
        return Ok(());
    }

    // One length byte per label plus the labels plus the terminator
    if trimmed.len() + 2 > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.to_string()));
    }

    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(WireError::EmptyLabel(name.to_string()));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong(label.to_string()));
        }
        out.put_u8(label.len() as u8);
        out.put_slice(label.as_bytes());
    }

    out.put_u8(0);
    Ok(())
}
