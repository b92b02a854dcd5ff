use bytes::{Buf, BufMut};

use crate::dns_message::WireError;

/// Size of the fixed DNS header on the wire
pub const HEADER_LEN: usize = 12;

const QR_BIT: u16 = 1 << 15;
const AA_BIT: u16 = 1 << 10;
const TC_BIT: u16 = 1 << 9;
const RD_BIT: u16 = 1 << 8;
const RA_BIT: u16 = 1 << 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsFlags {
    pub qr: bool,    // Query/Response (false = query, true = response)
    pub opcode: u8,  // Operation code (0 = standard query)
    pub aa: bool,    // Authoritative Answer
    pub tc: bool,    // Truncation
    pub rd: bool,    // Recursion Desired
    pub ra: bool,    // Recursion Available
    pub z: u8,       // Reserved (must be 0)
    pub rcode: u8,   // Response code
}

/// Response codes this server produces or inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0xF {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormErr => 1,
            ResponseCode::ServFail => 2,
            ResponseCode::NxDomain => 3,
            ResponseCode::NotImp => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Other(value) => value & 0xF,
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseCode::NoError => f.write_str("NOERROR"),
            ResponseCode::FormErr => f.write_str("FORMERR"),
            ResponseCode::ServFail => f.write_str("SERVFAIL"),
            ResponseCode::NxDomain => f.write_str("NXDOMAIN"),
            ResponseCode::NotImp => f.write_str("NOTIMP"),
            ResponseCode::Refused => f.write_str("REFUSED"),
            ResponseCode::Other(value) => write!(f, "RCODE{}", value),
        }
    }
}

fn bit(flags: u16, mask: u16) -> bool {
    flags & mask != 0
}

impl DnsFlags {
    pub fn to_u16(&self) -> u16 {
        let mut flags = (self.opcode as u16 & 0xF) << 11 // OPCODE at bits 11-14
            | (self.z as u16 & 0x7) << 4                 // Z at bits 4-6
            | self.rcode as u16 & 0xF;                   // RCODE at bits 0-3

        for (set, mask) in [
            (self.qr, QR_BIT),
            (self.aa, AA_BIT),
            (self.tc, TC_BIT),
            (self.rd, RD_BIT),
            (self.ra, RA_BIT),
        ] {
            if set {
                flags |= mask;
            }
        }

        flags
    }

    pub fn from_u16(flags: u16) -> Self {
        DnsFlags {
            qr: bit(flags, QR_BIT),
            opcode: ((flags >> 11) & 0xF) as u8,
            aa: bit(flags, AA_BIT),
            tc: bit(flags, TC_BIT),
            rd: bit(flags, RD_BIT),
            ra: bit(flags, RA_BIT),
            z: ((flags >> 4) & 0x7) as u8,
            rcode: (flags & 0xF) as u8,
        }
    }

    /// Flags for a query carrying only the recursion desired bit
    pub fn recursive_query() -> Self {
        DnsFlags {
            rd: true,
            ..Default::default()
        }
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from_u8(self.rcode)
    }
}

impl DnsHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated("header"));
        }

        let mut buf = &bytes[..HEADER_LEN];
        Ok(DnsHeader {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            question_count: buf.get_u16(),
            answer_count: buf.get_u16(),
            authority_count: buf.get_u16(),
            additional_count: buf.get_u16(),
        })
    }

    pub fn write_to<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.id);
        out.put_u16(self.flags);
        out.put_u16(self.question_count);
        out.put_u16(self.answer_count);
        out.put_u16(self.authority_count);
        out.put_u16(self.additional_count);
    }

    pub fn dns_flags(&self) -> DnsFlags {
        DnsFlags::from_u16(self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        let flags = DnsFlags {
            qr: true,
            opcode: 2,
            aa: true,
            tc: false,
            rd: true,
            ra: true,
            z: 0,
            rcode: 2,
        };

        assert_eq!(flags.to_u16(), 0x9582);
        assert_eq!(DnsFlags::from_u16(0x9582), flags);
    }

    #[test]
    fn test_recursive_query_flags() {
        assert_eq!(DnsFlags::recursive_query().to_u16(), 0x0100);
    }

    #[test]
    fn test_header_parse() {
        let bytes = [0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 1];
        let header = DnsHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.id, 0x1234);
        assert!(header.dns_flags().rd);
        assert_eq!(header.question_count, 1);
        assert_eq!(header.additional_count, 1);

        let mut out = Vec::new();
        header.write_to(&mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(
            DnsHeader::from_bytes(&[0, 1, 2]),
            Err(WireError::Truncated("header"))
        );
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(ResponseCode::from_u8(2), ResponseCode::ServFail);
        assert_eq!(ResponseCode::ServFail.to_u8(), 2);
        assert_eq!(ResponseCode::from_u8(9), ResponseCode::Other(9));
        assert_eq!(ResponseCode::NotImp.to_string(), "NOTIMP");
    }
}
