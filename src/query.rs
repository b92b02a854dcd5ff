use std::net::SocketAddr;

use bytes::Bytes;

use crate::dns_header::{DnsFlags, DnsHeader, ResponseCode};
use crate::dns_message::{build_response, create_response_header, DnsMessage, WireError};
use crate::dns_question_and_answer::{DnsAnswer, DnsQuestion, RecordType};

/// Why a decoded message cannot be handled as a query
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("request carries no question")]
    NoQuestion,

    #[error("opcode {0} is not supported")]
    UnsupportedOpcode(u8),

    #[error("message is a response, not a query")]
    NotAQuery,
}

/// A single-question client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub flags: DnsFlags,
    pub question: DnsQuestion,
    raw: Bytes,
}

impl Query {
    /// Build a standard recursive query, as a client would send it
    pub fn new(id: u16, name: &str, record_type: RecordType) -> Result<Self, WireError> {
        let flags = DnsFlags::recursive_query();
        let question = DnsQuestion::new(name, record_type);
        let header = DnsHeader {
            id,
            flags: flags.to_u16(),
            question_count: 1,
            answer_count: 0,
            authority_count: 0,
            additional_count: 0,
        };
        let raw = build_response(&header, std::slice::from_ref(&question), &[])?;

        Ok(Query {
            id,
            flags,
            question,
            raw: Bytes::from(raw),
        })
    }

    /// Only the first question is answered; `raw` is kept for forwarding
    pub fn from_message(message: &DnsMessage, raw: &[u8]) -> Result<Self, QueryError> {
        let flags = message.header.dns_flags();
        if flags.qr {
            return Err(QueryError::NotAQuery);
        }
        if flags.opcode != 0 {
            return Err(QueryError::UnsupportedOpcode(flags.opcode));
        }

        let question = message.questions.first().ok_or(QueryError::NoQuestion)?;

        Ok(Query {
            id: message.header.id,
            flags,
            question: question.clone(),
            raw: Bytes::copy_from_slice(raw),
        })
    }

    /// Question name as received, with its trailing dot
    pub fn name(&self) -> &str {
        &self.question.name
    }

    /// Question name in the form used for zone matching
    pub fn normalized_name(&self) -> String {
        self.question.name.to_ascii_lowercase()
    }

    pub fn record_type(&self) -> RecordType {
        self.question.qtype
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn header(&self) -> DnsHeader {
        DnsHeader {
            id: self.id,
            flags: self.flags.to_u16(),
            question_count: 1,
            answer_count: 0,
            authority_count: 0,
            additional_count: 0,
        }
    }
}

/// Outcome of handling one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Records built from a local zone
    Records { query: Query, records: Vec<DnsAnswer> },

    /// Reply from a forwarder, relayed byte for byte
    Upstream {
        query: Query,
        upstream: SocketAddr,
        reply: Bytes,
    },

    /// No records; the response code says why
    Failure { query: Query, rcode: ResponseCode },
}

impl Answer {
    pub fn failure(query: &Query, rcode: ResponseCode) -> Self {
        Answer::Failure {
            query: query.clone(),
            rcode,
        }
    }

    pub fn query(&self) -> &Query {
        match self {
            Answer::Records { query, .. }
            | Answer::Upstream { query, .. }
            | Answer::Failure { query, .. } => query,
        }
    }

    pub fn rcode(&self) -> ResponseCode {
        match self {
            Answer::Records { .. } => ResponseCode::NoError,
            Answer::Upstream { reply, .. } => DnsHeader::from_bytes(reply)
                .map(|header| header.dns_flags().response_code())
                .unwrap_or(ResponseCode::ServFail),
            Answer::Failure { rcode, .. } => *rcode,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let (query, rcode, records) = match self {
            Answer::Upstream { reply, .. } => return Ok(reply.to_vec()),
            Answer::Records { query, records } => (query, ResponseCode::NoError, records.as_slice()),
            Answer::Failure { query, rcode } => (query, *rcode, &[][..]),
        };

        let header = create_response_header(&query.header(), rcode, 1, records.len() as u16);
        build_response(&header, std::slice::from_ref(&query.question), records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_roundtrips_through_message() {
        let query = Query::new(0x1234, "www.Example.com", RecordType::A).unwrap();
        let message = DnsMessage::parse(query.raw()).unwrap();
        let parsed = Query::from_message(&message, query.raw()).unwrap();

        assert_eq!(parsed, query);
        assert_eq!(parsed.name(), "www.Example.com.");
        assert_eq!(parsed.normalized_name(), "www.example.com.");
        assert!(parsed.flags.rd);
    }

    #[test]
    fn test_from_message_rejects_non_queries() {
        let query = Query::new(1, "example.com", RecordType::A).unwrap();
        let mut message = DnsMessage::parse(query.raw()).unwrap();

        message.questions.clear();
        assert_eq!(
            Query::from_message(&message, query.raw()),
            Err(QueryError::NoQuestion)
        );

        message.header.flags = DnsFlags {
            opcode: 2,
            ..Default::default()
        }
        .to_u16();
        assert_eq!(
            Query::from_message(&message, query.raw()),
            Err(QueryError::UnsupportedOpcode(2))
        );

        message.header.flags = DnsFlags {
            qr: true,
            ..Default::default()
        }
        .to_u16();
        assert_eq!(
            Query::from_message(&message, query.raw()),
            Err(QueryError::NotAQuery)
        );
    }

    #[test]
    fn test_failure_answer_mirrors_query() {
        let query = Query::new(0xABCD, "Missing.Example.org", RecordType::MX).unwrap();
        let answer = Answer::failure(&query, ResponseCode::ServFail);

        let message = DnsMessage::parse(&answer.to_bytes().unwrap()).unwrap();

        assert_eq!(message.header.id, 0xABCD);
        assert_eq!(message.header.dns_flags().response_code(), ResponseCode::ServFail);
        assert!(message.header.dns_flags().qr);
        assert_eq!(message.questions, vec![query.question.clone()]);
        assert!(message.answers.is_empty());
        assert_eq!(answer.rcode(), ResponseCode::ServFail);
    }

    #[test]
    fn test_records_answer_encodes_records() {
        let query = Query::new(9, "example.com", RecordType::A).unwrap();
        let record = DnsAnswer::new(query.name(), RecordType::A, 300, vec![192, 0, 2, 1]);
        let answer = Answer::Records {
            query: query.clone(),
            records: vec![record.clone()],
        };

        let message = DnsMessage::parse(&answer.to_bytes().unwrap()).unwrap();

        assert!(message.header.dns_flags().aa);
        assert_eq!(message.answers, vec![record]);
        assert_eq!(answer.query(), &query);
    }

    #[test]
    fn test_upstream_answer_is_relayed_unchanged() {
        let query = Query::new(5, "example.net", RecordType::A).unwrap();
        let reply = Bytes::from_static(&[0, 5, 0x81, 0x83, 0, 0, 0, 0, 0, 0, 0, 0]);
        let answer = Answer::Upstream {
            query,
            upstream: "192.0.2.53:53".parse().unwrap(),
            reply: reply.clone(),
        };

        assert_eq!(answer.to_bytes().unwrap(), reply.to_vec());
        assert_eq!(answer.rcode(), ResponseCode::NxDomain);
    }
}
