//! Presentation-form rdata to wire-form rdata.
//!
//! Every value the formatter produces ends up here before it can be placed
//! in a response. Names are written uncompressed and are always treated as
//! absolute, whether or not they carry the trailing dot.

use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::BufMut;

use crate::dns_message::WireError;
use crate::dns_question_and_answer::{encode_domain_name, RecordType};

const MAX_CHARACTER_STRING: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RdataError {
    #[error("unterminated quoted string")]
    UnterminatedQuote,

    #[error("invalid escape sequence: \\{0}")]
    BadEscape(String),

    #[error("{rtype} expects {expected} fields, found {found}")]
    FieldCount {
        rtype: RecordType,
        expected: &'static str,
        found: usize,
    },

    #[error("{rtype} has an invalid {field}: {value:?}")]
    InvalidField {
        rtype: RecordType,
        field: &'static str,
        value: String,
    },

    #[error("character string of {0} bytes exceeds 255")]
    StringTooLong(usize),

    #[error("no presentation format for {0}, use \\# <length> <hex>")]
    Unsupported(RecordType),

    #[error(transparent)]
    Name(#[from] WireError),
}

/// A whitespace-separated field, with quoting and escapes resolved to octets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub octets: Vec<u8>,
    pub quoted: bool,
}

impl Token {
    /// The field as text; octets that are not UTF-8 are replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.octets)
    }

    /// Write the token back out so that `tokenize` reads the same octets
    pub fn render(&self) -> String {
        self.render_with(self.quoted)
    }

    /// Like `render`, but always as a quoted string
    pub fn render_quoted(&self) -> String {
        self.render_with(true)
    }

    fn render_with(&self, force_quotes: bool) -> String {
        let mut body = String::with_capacity(self.octets.len());
        match std::str::from_utf8(&self.octets) {
            Ok(text) => text.chars().for_each(|c| escape_char(&mut body, c)),
            Err(_) => {
                for &b in &self.octets {
                    if b.is_ascii() && !b.is_ascii_control() {
                        escape_char(&mut body, char::from(b));
                    } else {
                        body.push_str(&format!("\\{:03}", b));
                    }
                }
            }
        }

        let needs_quotes = force_quotes
            || body.is_empty()
            || body.chars().any(|c| c.is_whitespace() || c == '"' || c == ';');
        if needs_quotes {
            format!("\"{}\"", body)
        } else {
            body
        }
    }
}

fn escape_char(out: &mut String, c: char) {
    if c == '"' || c == '\\' {
        out.push('\\');
    }
    out.push(c);
}

/// `text` as a single quoted character string
pub fn quote(text: &str) -> String {
    Token {
        octets: text.as_bytes().to_vec(),
        quoted: true,
    }
    .render()
}

/// Split presentation text into fields.
/// Understands double-quoted strings and the `\X` and `\DDD` escapes.
pub fn tokenize(input: &str) -> Result<Vec<Token>, RdataError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let quoted = c == '"';
        if quoted {
            chars.next();
        }

        let mut octets = Vec::new();
        let mut closed = !quoted;
        while let Some(c) = chars.next() {
            match c {
                '\\' => unescape(&mut chars, &mut octets)?,
                '"' if quoted => {
                    closed = true;
                    break;
                }
                c if !quoted && c.is_whitespace() => break,
                c => push_char(&mut octets, c),
            }
        }

        if !closed {
            return Err(RdataError::UnterminatedQuote);
        }
        tokens.push(Token { octets, quoted });
    }

    Ok(tokens)
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// `\DDD` is one octet; `\X` is the character X
fn unescape(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut Vec<u8>,
) -> Result<(), RdataError> {
    let first = chars
        .next()
        .ok_or_else(|| RdataError::BadEscape(String::new()))?;

    if !first.is_ascii_digit() {
        push_char(out, first);
        return Ok(());
    }

    let mut digits = String::from(first);
    for _ in 0..2 {
        match chars.next() {
            Some(d) if d.is_ascii_digit() => digits.push(d),
            _ => return Err(RdataError::BadEscape(digits)),
        }
    }

    let octet = digits
        .parse::<u8>()
        .map_err(|_| RdataError::BadEscape(digits))?;
    out.push(octet);
    Ok(())
}

fn field<T: FromStr>(rtype: RecordType, name: &'static str, token: &Token) -> Result<T, RdataError> {
    token.text().parse().map_err(|_| RdataError::InvalidField {
        rtype,
        field: name,
        value: token.text().into_owned(),
    })
}

fn expect_fields(
    rtype: RecordType,
    tokens: &[Token],
    expected: usize,
    label: &'static str,
) -> Result<(), RdataError> {
    if tokens.len() == expected {
        Ok(())
    } else {
        Err(RdataError::FieldCount {
            rtype,
            expected: label,
            found: tokens.len(),
        })
    }
}

fn put_character_string(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), RdataError> {
    if bytes.len() > MAX_CHARACTER_STRING {
        return Err(RdataError::StringTooLong(bytes.len()));
    }
    out.put_u8(bytes.len() as u8);
    out.put_slice(bytes);
    Ok(())
}

/// Encode the presentation form of one record's rdata
pub fn encode(rtype: RecordType, text: &str) -> Result<Vec<u8>, RdataError> {
    if let Some(generic) = text.trim_start().strip_prefix("\\#") {
        return encode_generic(rtype, generic);
    }

    let tokens = tokenize(text)?;
    let mut out = Vec::new();

    match rtype {
        RecordType::A => {
            expect_fields(rtype, &tokens, 1, "1")?;
            let addr: Ipv4Addr = field(rtype, "address", &tokens[0])?;
            out.put_slice(&addr.octets());
        }
        RecordType::AAAA => {
            expect_fields(rtype, &tokens, 1, "1")?;
            let addr: Ipv6Addr = field(rtype, "address", &tokens[0])?;
            out.put_slice(&addr.octets());
        }
        RecordType::NS | RecordType::CNAME | RecordType::PTR => {
            expect_fields(rtype, &tokens, 1, "1")?;
            encode_domain_name(&tokens[0].text(), &mut out)?;
        }
        RecordType::MX => {
            expect_fields(rtype, &tokens, 2, "2")?;
            out.put_u16(field(rtype, "preference", &tokens[0])?);
            encode_domain_name(&tokens[1].text(), &mut out)?;
        }
        RecordType::TXT => {
            if tokens.is_empty() {
                return Err(RdataError::FieldCount {
                    rtype,
                    expected: "at least 1",
                    found: 0,
                });
            }
            for token in &tokens {
                put_character_string(&mut out, &token.octets)?;
            }
        }
        RecordType::SRV => {
            expect_fields(rtype, &tokens, 4, "4")?;
            out.put_u16(field(rtype, "priority", &tokens[0])?);
            out.put_u16(field(rtype, "weight", &tokens[1])?);
            out.put_u16(field(rtype, "port", &tokens[2])?);
            encode_domain_name(&tokens[3].text(), &mut out)?;
        }
        RecordType::SOA => {
            expect_fields(rtype, &tokens, 7, "7")?;
            encode_domain_name(&tokens[0].text(), &mut out)?;
            encode_domain_name(&tokens[1].text(), &mut out)?;
            let names = ["serial", "refresh", "retry", "expire", "minimum"];
            for (token, name) in tokens[2..].iter().zip(names) {
                out.put_u32(field(rtype, name, token)?);
            }
        }
        RecordType::HINFO => {
            expect_fields(rtype, &tokens, 2, "2")?;
            put_character_string(&mut out, &tokens[0].octets)?;
            put_character_string(&mut out, &tokens[1].octets)?;
        }
        RecordType::CAA => {
            expect_fields(rtype, &tokens, 3, "3")?;
            let flags: u8 = field(rtype, "flags", &tokens[0])?;
            let tag = tokens[1].text();
            if tag.is_empty() || tag.len() > MAX_CHARACTER_STRING || !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(RdataError::InvalidField {
                    rtype,
                    field: "tag",
                    value: tag.into_owned(),
                });
            }
            out.put_u8(flags);
            put_character_string(&mut out, &tokens[1].octets)?;
            out.put_slice(&tokens[2].octets);
        }
        RecordType::SSHFP => {
            if tokens.len() < 3 {
                return Err(RdataError::FieldCount {
                    rtype,
                    expected: "3",
                    found: tokens.len(),
                });
            }
            out.put_u8(field(rtype, "algorithm", &tokens[0])?);
            out.put_u8(field(rtype, "fingerprint type", &tokens[1])?);
            let hex: String = tokens[2..].iter().map(Token::text).collect();
            let fingerprint = decode_hex(&hex).ok_or(RdataError::InvalidField {
                rtype,
                field: "fingerprint",
                value: hex.clone(),
            })?;
            out.put_slice(&fingerprint);
        }
        RecordType::URI => {
            expect_fields(rtype, &tokens, 3, "3")?;
            out.put_u16(field(rtype, "priority", &tokens[0])?);
            out.put_u16(field(rtype, "weight", &tokens[1])?);
            if tokens[2].octets.is_empty() {
                return Err(RdataError::InvalidField {
                    rtype,
                    field: "target",
                    value: String::new(),
                });
            }
            out.put_slice(&tokens[2].octets);
        }
        RecordType::LOC => encode_loc(&tokens, &mut out)?,
        RecordType::OPT | RecordType::Unknown(_) => return Err(RdataError::Unsupported(rtype)),
    }

    Ok(out)
}

/// RFC 3597 generic form: `\# <length> <hex...>`
fn encode_generic(rtype: RecordType, rest: &str) -> Result<Vec<u8>, RdataError> {
    let mut fields = rest.split_whitespace();
    let length: usize = fields
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| RdataError::InvalidField {
            rtype,
            field: "length",
            value: rest.trim().to_string(),
        })?;

    let hex: String = fields.collect();
    let data = decode_hex(&hex)
        .filter(|data| data.len() == length)
        .ok_or(RdataError::InvalidField {
            rtype,
            field: "generic rdata",
            value: hex,
        })?;
    Ok(data)
}

pub fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

const LOC_EQUATOR: i64 = 1 << 31;
const LOC_ALTITUDE_BASE: i64 = 10_000_000;

fn loc_invalid(field: &'static str, value: &str) -> RdataError {
    RdataError::InvalidField {
        rtype: RecordType::LOC,
        field,
        value: value.to_string(),
    }
}

/// `d [m [s]] N|S` or `d [m [s]] E|W`, in thousandths of an arc second from the equator
fn loc_coordinate<'a, I: Iterator<Item = &'a Token>>(
    tokens: &mut I,
    field: &'static str,
    positive: &str,
    negative: &str,
    max_degrees: i64,
) -> Result<u32, RdataError> {
    let mut parts = Vec::new();
    let sign = loop {
        let token = tokens.next().ok_or_else(|| loc_invalid(field, ""))?;
        let text = token.text().to_ascii_uppercase();
        if text == positive {
            break 1;
        }
        if text == negative {
            break -1;
        }
        if parts.len() == 3 {
            return Err(loc_invalid(field, &token.text()));
        }
        parts.push(token.text().into_owned());
    };

    let degrees: i64 = parts
        .first()
        .and_then(|d| d.parse().ok())
        .filter(|d| (0..=max_degrees).contains(d))
        .ok_or_else(|| loc_invalid(field, &parts.join(" ")))?;
    let minutes: i64 = match parts.get(1) {
        Some(m) => m
            .parse()
            .ok()
            .filter(|m| (0..60).contains(m))
            .ok_or_else(|| loc_invalid(field, m))?,
        None => 0,
    };
    let seconds: f64 = match parts.get(2) {
        Some(s) => s
            .parse()
            .ok()
            .filter(|s| (0.0..60.0).contains(s))
            .ok_or_else(|| loc_invalid(field, s))?,
        None => 0.0,
    };

    let millis = (degrees * 3600 + minutes * 60) * 1000 + (seconds * 1000.0).round() as i64;
    Ok((LOC_EQUATOR + sign * millis) as u32)
}

fn loc_meters(field: &'static str, token: &Token) -> Result<f64, RdataError> {
    let text = token.text();
    let meters = text.strip_suffix(['m', 'M']).unwrap_or(&text);
    meters.parse().map_err(|_| loc_invalid(field, &text))
}

/// Size and precision fields are a base-10 mantissa and exponent of centimeters
fn loc_precision(field: &'static str, token: &Token) -> Result<u8, RdataError> {
    let meters = loc_meters(field, token)?;
    if !(0.0..=90_000_000.0).contains(&meters) {
        return Err(loc_invalid(field, &token.text()));
    }

    let mut mantissa = (meters * 100.0).round() as u64;
    let mut exponent = 0u8;
    while mantissa > 9 {
        mantissa /= 10;
        exponent += 1;
    }
    Ok((mantissa as u8) << 4 | exponent)
}

fn encode_loc(tokens: &[Token], out: &mut Vec<u8>) -> Result<(), RdataError> {
    let mut iter = tokens.iter();

    let latitude = loc_coordinate(&mut iter, "latitude", "N", "S", 90)?;
    let longitude = loc_coordinate(&mut iter, "longitude", "E", "W", 180)?;

    let altitude_token = iter.next().ok_or_else(|| loc_invalid("altitude", ""))?;
    let altitude_cm =
        (loc_meters("altitude", altitude_token)? * 100.0).round() as i64 + LOC_ALTITUDE_BASE;
    let altitude =
        u32::try_from(altitude_cm).map_err(|_| loc_invalid("altitude", &altitude_token.text()))?;

    // Defaults: 1m size, 10000m horizontal and 10m vertical precision
    let mut precision = [0x12u8, 0x16, 0x13];
    let names = ["size", "horizontal precision", "vertical precision"];
    for (slot, name) in precision.iter_mut().zip(names) {
        match iter.next() {
            Some(token) => *slot = loc_precision(name, token)?,
            None => break,
        }
    }

    if let Some(extra) = iter.next() {
        return Err(loc_invalid("trailing field", &extra.text()));
    }

    out.put_u8(0); // version
    out.put_slice(&precision);
    out.put_u32(latitude);
    out.put_u32(longitude);
    out.put_u32(altitude);
    Ok(())
}
