use crate::dns_header::{DnsFlags, DnsHeader, ResponseCode, HEADER_LEN};
use crate::dns_question_and_answer::{DnsAnswer, DnsQuestion};

/// Errors raised while decoding or encoding DNS wire data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too small for {0}")]
    Truncated(&'static str),

    #[error("too many compression pointers in domain name")]
    PointerLoop,

    #[error("invalid UTF-8 in domain label")]
    InvalidLabel,

    #[error("domain name too long: {0}")]
    NameTooLong(String),

    #[error("label too long: {0}")]
    LabelTooLong(String),

    #[error("empty label in domain name: {0}")]
    EmptyLabel(String),

    #[error("rdata of {0} bytes does not fit in a record")]
    RdataTooLong(usize),
}

/// A decoded DNS message
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
    pub authorities: Vec<DnsAnswer>,
    pub additionals: Vec<DnsAnswer>,
}

impl DnsMessage {
    /// Parse a complete DNS message, every section included
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let header = DnsHeader::from_bytes(buf)?;
        let mut offset = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for _ in 0..header.question_count {
            let (question, new_offset) = DnsQuestion::from_bytes(buf, offset)?;
            questions.push(question);
            offset = new_offset;
        }

        let mut sections = [
            (header.answer_count, Vec::new()),
            (header.authority_count, Vec::new()),
            (header.additional_count, Vec::new()),
        ];
        for (count, records) in sections.iter_mut() {
            for _ in 0..*count {
                let (record, new_offset) = DnsAnswer::from_bytes(buf, offset)?;
                records.push(record);
                offset = new_offset;
            }
        }
        let [(_, answers), (_, authorities), (_, additionals)] = sections;

        Ok(DnsMessage {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

/// Create response header based on request header
/// Local answers are authoritative; recursion is available through the forwarders
pub fn create_response_header(
    request_header: &DnsHeader,
    rcode: ResponseCode,
    question_count: u16,
    answer_count: u16,
) -> DnsHeader {
    let request_flags = request_header.dns_flags();

    let response_flags = DnsFlags {
        qr: true,
        opcode: request_flags.opcode,
        aa: rcode == ResponseCode::NoError && answer_count > 0,
        tc: false,
        rd: request_flags.rd,
        ra: true,
        z: 0,
        rcode: rcode.to_u8(),
    };

    DnsHeader {
        id: request_header.id,
        flags: response_flags.to_u16(),
        question_count,
        answer_count,
        authority_count: 0,
        additional_count: 0,
    }
}

/// Build the complete DNS message
pub fn build_response(
    header: &DnsHeader,
    questions: &[DnsQuestion],
    answers: &[DnsAnswer],
) -> Result<Vec<u8>, WireError> {
    let mut response = Vec::with_capacity(512);

    header.write_to(&mut response);

    for question in questions {
        question.write_to(&mut response)?;
    }

    for answer in answers {
        answer.write_to(&mut response)?;
    }

    Ok(response)
}
