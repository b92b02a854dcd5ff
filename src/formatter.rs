//! Per-type normalization of configured record values.
//!
//! A value that does not satisfy its type's grammar is rejected here with a
//! [`MalformedRecordError`] instead of being handed to the rdata encoder.

use crate::dns_question_and_answer::{fqdn, RecordType};
use crate::rdata::{quote, tokenize, Token};

/// Preference given to an MX value that names only the exchange
pub const DEFAULT_MX_PREFERENCE: u16 = 10;

const MAX_TXT_CHUNK: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {record_type} value {value:?}: {reason}")]
pub struct MalformedRecordError {
    pub record_type: RecordType,
    pub value: String,
    pub reason: &'static str,
}

fn malformed(record_type: RecordType, value: &str, reason: &'static str) -> MalformedRecordError {
    MalformedRecordError {
        record_type,
        value: value.to_string(),
        reason,
    }
}

/// Turn a configured value into the presentation form the rdata encoder expects
pub fn format(record_type: RecordType, raw: &str) -> Result<String, MalformedRecordError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(malformed(record_type, raw, "empty value"));
    }

    let fields: Vec<&str> = value.split_whitespace().collect();

    match record_type {
        RecordType::MX => match fields.as_slice() {
            [exchange] => Ok(format!("{} {}", DEFAULT_MX_PREFERENCE, exchange)),
            [preference, exchange] => Ok(format!("{} {}", preference, exchange)),
            _ => Err(malformed(record_type, raw, "expected \"<pref> <host>\" or \"<host>\"")),
        },
        RecordType::TXT => Ok(quote_txt(value)),
        RecordType::SRV => match fields.as_slice() {
            [priority, weight, port, target] => Ok(format!(
                "{} {} {} {}",
                priority,
                weight,
                port,
                fqdn(target)
            )),
            _ => Err(malformed(
                record_type,
                raw,
                "expected \"<priority> <weight> <port> <target>\"",
            )),
        },
        RecordType::NS | RecordType::PTR => match fields.as_slice() {
            [host] => Ok(fqdn(host)),
            _ => Err(malformed(record_type, raw, "expected a single hostname")),
        },
        RecordType::SOA => match fields.as_slice() {
            [mname, rname, timers @ ..] if timers.len() == 5 => Ok(format!(
                "{} {} {}",
                fqdn(mname),
                fqdn(rname),
                timers.join(" ")
            )),
            _ => Err(malformed(
                record_type,
                raw,
                "expected \"<mname> <rname> <serial> <refresh> <retry> <expire> <minimum>\"",
            )),
        },
        RecordType::HINFO => format_hinfo(value)
            .ok_or_else(|| malformed(record_type, raw, "expected \"<cpu> <os>\"")),
        _ => Ok(value.to_string()),
    }
}

/// Already-quoted values pass through; anything else becomes one or more
/// quoted character strings of at most 255 bytes each
fn quote_txt(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value.to_string();
    }

    let mut chunks = Vec::new();
    let mut rest = value;
    while rest.len() > MAX_TXT_CHUNK {
        let mut split = MAX_TXT_CHUNK;
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        let (head, tail) = rest.split_at(split);
        chunks.push(quote(head));
        rest = tail;
    }
    chunks.push(quote(rest));
    chunks.join(" ")
}

/// Two quoted fields, or an unquoted cpu word followed by the os text
fn format_hinfo(value: &str) -> Option<String> {
    let tokens = tokenize(value).ok()?;

    match tokens.as_slice() {
        [cpu, os] => Some(format!("{} {}", cpu.render_quoted(), os.render_quoted())),
        [cpu, rest @ ..] if rest.len() > 1 && tokens.iter().all(|t| !t.quoted) => {
            let os = rest.iter().map(Token::text).collect::<Vec<_>>().join(" ");
            Some(format!("{} {}", cpu.render_quoted(), quote(&os)))
        }
        _ => None,
    }
}
