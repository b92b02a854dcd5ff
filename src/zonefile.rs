//! Conversion between RFC 1035 master files and the JSON zone format.
//!
//! Import understands `$ORIGIN`, `$TTL`, `@`, blank owners, optional TTL and
//! class in either order, `;` comments and parenthesized multi-line records.
//! Export writes the SOA first, then one line per value.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::dns_question_and_answer::{fqdn, RecordType};
use crate::formatter::{self, MalformedRecordError};
use crate::rdata::{tokenize, Token};
use crate::resolver::relative_owner;
use crate::zones::{normalize_zone_name, Zone, ZoneDataError, APEX};

/// `$TTL` written by the exporter when none is given
pub const DEFAULT_EXPORT_TTL: u32 = 3600;

const CLASSES: [&str; 4] = ["IN", "CH", "HS", "CS"];

const SOA_TIMERS: [&str; 5] = ["serial", "refresh", "retry", "expire", "minimum"];

#[derive(Debug, thiserror::Error)]
pub enum ZoneFileError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown record type {rtype:?}")]
    UnknownType { line: usize, rtype: String },

    #[error("line {line}: relative name {name:?} with no origin, use $ORIGIN or --origin")]
    MissingOrigin { line: usize, name: String },

    #[error("line {line}: invalid {rtype} rdata: {message}")]
    Rdata {
        line: usize,
        rtype: RecordType,
        message: String,
    },

    #[error(transparent)]
    Zone(#[from] ZoneDataError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn syntax(line: usize, message: impl Into<String>) -> ZoneFileError {
    ZoneFileError::Syntax {
        line,
        message: message.into(),
    }
}

/// One resource record read from a master file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneEntry {
    pub line: usize,
    /// Absolute owner name, with its trailing dot
    pub owner: String,
    pub ttl: Option<u32>,
    pub rtype: RecordType,
    /// Presentation rdata as written
    pub rdata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedZone {
    /// Apex of the zone: the given origin, else the first `$ORIGIN`, else the SOA owner
    pub origin: Option<String>,
    pub entries: Vec<ZoneEntry>,
}

impl ParsedZone {
    /// Every distinct record TTL, lowest first. JSON zones keep none of them.
    pub fn ttls(&self) -> BTreeSet<u32> {
        self.entries.iter().filter_map(|entry| entry.ttl).collect()
    }
}

/// A record with comments removed and parentheses joined
struct LogicalLine {
    number: usize,
    text: String,
    blank_owner: bool,
}

/// Cut the comment off a physical line and track parenthesis depth
fn strip_line(raw: &str, depth: &mut usize, number: usize) -> Result<String, ZoneFileError> {
    let mut out = String::with_capacity(raw.len());
    let mut in_quote = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '"' => {
                in_quote = !in_quote;
                out.push(c);
            }
            ';' if !in_quote => break,
            '(' if !in_quote => {
                *depth += 1;
                out.push(' ');
            }
            ')' if !in_quote => {
                *depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| syntax(number, "unbalanced ')'"))?;
                out.push(' ');
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn logical_lines(text: &str) -> Result<Vec<LogicalLine>, ZoneFileError> {
    let mut lines = Vec::new();
    let mut depth = 0;
    let mut current: Option<LogicalLine> = None;

    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let stripped = strip_line(raw, &mut depth, number)?;

        let line = current.get_or_insert_with(|| LogicalLine {
            number,
            text: String::new(),
            blank_owner: raw.starts_with(|c: char| c == ' ' || c == '\t'),
        });
        line.text.push(' ');
        line.text.push_str(&stripped);

        if depth == 0 {
            if let Some(line) = current.take().filter(|line| !line.text.trim().is_empty()) {
                lines.push(line);
            }
        }
    }

    match current {
        Some(line) if depth > 0 => Err(syntax(line.number, "unclosed '('")),
        _ => Ok(lines),
    }
}

/// Byte ranges of whitespace-separated fields; quoted strings stay whole
fn field_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut in_quote = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                start.get_or_insert(i);
            }
            '"' => {
                in_quote = !in_quote;
                start.get_or_insert(i);
            }
            c if c.is_whitespace() && !in_quote => {
                if let Some(s) = start.take() {
                    spans.push((s, i));
                }
            }
            _ => {
                start.get_or_insert(i);
            }
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Seconds in a TTL such as `3600`, `1h30m` or `2W`
pub fn parse_ttl(text: &str) -> Option<u32> {
    if text.is_empty() || !text.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    if let Ok(seconds) = text.parse() {
        return Some(seconds);
    }

    let mut total: u32 = 0;
    let mut number: Option<u32> = None;
    for c in text.chars() {
        if let Some(digit) = c.to_digit(10) {
            number = Some(number.unwrap_or(0).checked_mul(10)?.checked_add(digit)?);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        total = total.checked_add(number.take()?.checked_mul(unit)?)?;
    }

    match number {
        None => Some(total),
        Some(_) => None,
    }
}

/// Qualify `name` against `origin`; `@` is the origin itself
fn absolute_name(name: &str, origin: Option<&str>, line: usize) -> Result<String, ZoneFileError> {
    if name.ends_with('.') {
        return Ok(name.to_string());
    }

    let origin = origin.ok_or_else(|| ZoneFileError::MissingOrigin {
        line,
        name: name.to_string(),
    })?;

    Ok(match (name, origin) {
        (APEX, origin) => origin.to_string(),
        (name, ".") => format!("{}.", name),
        (name, origin) => format!("{}.{}", name, origin),
    })
}

/// Parse master file text. `origin` is the starting `$ORIGIN`.
pub fn parse_zone_file(text: &str, origin: Option<&str>) -> Result<ParsedZone, ZoneFileError> {
    let mut current_origin = origin.map(|o| fqdn(&o.to_ascii_lowercase()));
    let mut zone = ParsedZone {
        origin: current_origin.clone(),
        entries: Vec::new(),
    };
    let mut default_ttl = None;
    let mut previous_owner: Option<String> = None;
    let mut previous_ttl = None;

    for line in logical_lines(text)? {
        let number = line.number;
        let text = line.text.as_str();
        let spans = field_spans(text);
        let fields: Vec<&str> = spans.iter().map(|&(s, e)| &text[s..e]).collect();

        if !line.blank_owner && fields[0].starts_with('$') {
            match (fields[0].to_ascii_uppercase().as_str(), &fields[1..]) {
                ("$ORIGIN", [name]) => {
                    let name = absolute_name(name, current_origin.as_deref(), number)?;
                    let name = name.to_ascii_lowercase();
                    zone.origin.get_or_insert_with(|| name.clone());
                    current_origin = Some(name);
                }
                ("$TTL", [ttl]) => {
                    default_ttl = Some(
                        parse_ttl(ttl).ok_or_else(|| syntax(number, format!("invalid TTL {:?}", ttl)))?,
                    );
                }
                (directive, _) => {
                    return Err(syntax(number, format!("unsupported directive {}", directive)));
                }
            }
            continue;
        }

        let mut index = 0;
        let owner = if line.blank_owner {
            previous_owner
                .clone()
                .ok_or_else(|| syntax(number, "record without an owner name"))?
        } else {
            index = 1;
            absolute_name(fields[0], current_origin.as_deref(), number)?.to_ascii_lowercase()
        };

        let mut ttl = None;
        let mut class_seen = false;
        let rtype = loop {
            let field = *fields
                .get(index)
                .ok_or_else(|| syntax(number, "missing record type"))?;
            index += 1;

            if ttl.is_none() && field.starts_with(|c: char| c.is_ascii_digit()) {
                ttl = Some(parse_ttl(field).ok_or_else(|| syntax(number, format!("invalid TTL {:?}", field)))?);
            } else if !class_seen && CLASSES.iter().any(|class| class.eq_ignore_ascii_case(field)) {
                class_seen = true;
            } else {
                break field.parse::<RecordType>().map_err(|_| ZoneFileError::UnknownType {
                    line: number,
                    rtype: field.to_string(),
                })?;
            }
        };

        let rdata = spans
            .get(index)
            .map(|&(start, _)| text[start..].trim_end().to_string())
            .ok_or_else(|| syntax(number, format!("{} record without rdata", rtype)))?;

        let ttl = ttl.or(default_ttl).or(previous_ttl);
        if rtype == RecordType::SOA {
            zone.origin.get_or_insert_with(|| owner.clone());
        }

        previous_owner = Some(owner.clone());
        previous_ttl = ttl;
        zone.entries.push(ZoneEntry {
            line: number,
            owner,
            ttl,
            rtype,
            rdata,
        });
    }

    Ok(zone)
}

/// Rewrite master file rdata into the JSON value grammar, names made absolute
fn import_value(entry: &ZoneEntry, origin: Option<&str>) -> Result<String, ZoneFileError> {
    let rtype = entry.rtype;
    let line = entry.line;
    let rdata_error = |message: String| ZoneFileError::Rdata {
        line,
        rtype,
        message,
    };

    let tokens = tokenize(&entry.rdata).map_err(|e| rdata_error(e.to_string()))?;
    let text: Vec<Cow<'_, str>> = tokens.iter().map(Token::text).collect();
    let name = |n: &str| absolute_name(n, origin, line);
    let wrong_count = |expected: &str| rdata_error(format!("expected {} fields, found {}", expected, text.len()));

    let value = match rtype {
        RecordType::NS | RecordType::CNAME | RecordType::PTR => match text.as_slice() {
            [host] => name(host)?,
            _ => return Err(wrong_count("1")),
        },
        RecordType::MX => match text.as_slice() {
            [preference, exchange] => format!("{} {}", preference, name(exchange)?),
            _ => return Err(wrong_count("2")),
        },
        RecordType::SRV => match text.as_slice() {
            [priority, weight, port, target] => {
                format!("{} {} {} {}", priority, weight, port, name(target)?)
            }
            _ => return Err(wrong_count("4")),
        },
        RecordType::SOA => match text.as_slice() {
            [mname, rname, timers @ ..] if timers.len() == SOA_TIMERS.len() => {
                let timers = timers
                    .iter()
                    .zip(SOA_TIMERS)
                    .map(|(value, field)| {
                        parse_ttl(value)
                            .map(|seconds| seconds.to_string())
                            .ok_or_else(|| rdata_error(format!("invalid {} {:?}", field, value)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                format!("{} {} {}", name(mname)?, name(rname)?, timers.join(" "))
            }
            _ => return Err(wrong_count("7")),
        },
        RecordType::CAA => match text.as_slice() {
            [flags, tag, _] => format!("{} {} {}", flags, tag, tokens[2].render_quoted()),
            _ => return Err(wrong_count("3")),
        },
        RecordType::URI => match text.as_slice() {
            [priority, weight, _] => format!("{} {} {}", priority, weight, tokens[2].render_quoted()),
            _ => return Err(wrong_count("3")),
        },
        RecordType::SSHFP => match text.as_slice() {
            [algorithm, fp_type, fingerprint @ ..] if !fingerprint.is_empty() => {
                format!("{} {} {}", algorithm, fp_type, fingerprint.concat())
            }
            _ => return Err(wrong_count("3")),
        },
        RecordType::HINFO => match text.as_slice() {
            [_, _] => format!("{} {}", tokens[0].render_quoted(), tokens[1].render_quoted()),
            _ => return Err(wrong_count("2")),
        },
        RecordType::TXT => match text.as_slice() {
            [single] if is_plain_text(&tokens[0]) => single.to_string(),
            _ => tokens.iter().map(Token::render_quoted).collect::<Vec<_>>().join(" "),
        },
        _ => entry.rdata.clone(),
    };
    Ok(value)
}

/// A lone TXT string the formatter will quote back to the same octets
fn is_plain_text(token: &Token) -> bool {
    match std::str::from_utf8(&token.octets) {
        Ok(text) => !(text.starts_with('"') && text.ends_with('"')),
        Err(_) => false,
    }
}

/// Build the JSON zone: owners relative to the origin, repeated owner/type pairs as lists
pub fn to_zone(parsed: &ParsedZone) -> Result<Zone, ZoneFileError> {
    let origin = parsed.origin.as_deref();
    let apex = origin.map(normalize_zone_name);
    let mut zone = Zone::default();

    for entry in &parsed.entries {
        let owner = apex
            .as_deref()
            .and_then(|apex| relative_owner(&entry.owner, apex))
            .unwrap_or_else(|| entry.owner.clone());
        let value = import_value(entry, origin)?;
        zone.insert(entry.rtype, &owner, value);
    }
    Ok(zone)
}

/// Owner as written in the master file; names under `origin` become relative
fn export_owner(owner: &str, origin: Option<&str>) -> String {
    if owner == APEX {
        return APEX.to_string();
    }
    origin
        .and_then(|origin| relative_owner(&fqdn(owner), &normalize_zone_name(origin)))
        .unwrap_or_else(|| owner.to_string())
}

fn export_rdata(rtype: RecordType, raw: &str) -> Result<String, MalformedRecordError> {
    let text = formatter::format(rtype, raw)?;

    Ok(match rtype {
        RecordType::CNAME => fqdn(&text),
        RecordType::MX => match text.split_once(' ') {
            Some((preference, exchange)) => format!("{} {}", preference, fqdn(exchange)),
            None => text,
        },
        _ => text,
    })
}

fn write_soa(out: &mut String, raw: &str) -> Result<(), MalformedRecordError> {
    let text = formatter::format(RecordType::SOA, raw)?;
    let fields: Vec<&str> = text.split_whitespace().collect();
    let (names, timers) = fields.split_at(2);

    out.push_str(&format!("{}\tIN\tSOA\t{} {} (\n", APEX, names[0], names[1]));
    for (i, (value, label)) in timers.iter().zip(SOA_TIMERS).enumerate() {
        let close = if i + 1 == SOA_TIMERS.len() { " )" } else { "" };
        out.push_str(&format!("\t\t\t{}{}\t; {}\n", value, close, label));
    }
    Ok(())
}

/// Render a zone as master file text. Values that fail formatting are skipped with a warning.
pub fn export_zone(zone: &Zone, origin: Option<&str>, ttl: u32) -> String {
    let mut out = String::new();
    out.push_str(&format!("$TTL {}\n", ttl));
    if let Some(origin) = origin {
        out.push_str(&format!("$ORIGIN {}\n", fqdn(origin)));
    }

    if let Some(soa) = zone.get(RecordType::SOA, APEX) {
        if let Err(e) = write_soa(&mut out, soa.first()) {
            warn!(error = %e, "Skipping malformed SOA record");
        }
    }

    for (rtype, owner, value) in zone.iter() {
        if rtype == RecordType::SOA && owner == APEX {
            continue;
        }
        let written_owner = export_owner(owner, origin);

        for raw in value.values() {
            match export_rdata(rtype, raw) {
                Ok(rdata) => {
                    out.push_str(&format!("{}\tIN\t{}\t{}\n", written_owner, rtype, rdata));
                }
                Err(e) => warn!(%owner, error = %e, "Skipping malformed record"),
            }
        }
    }
    out
}

fn read(path: &Path) -> Result<String, ZoneFileError> {
    fs::read_to_string(path).map_err(|source| ZoneFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), ZoneFileError> {
    fs::write(path, contents).map_err(|source| ZoneFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Zone name implied by a JSON zone file name, as the zones directory loader reads it
fn origin_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(OsStr::to_str)
        .map(normalize_zone_name)
        .filter(|name| !name.is_empty())
}

/// Convert a master file into a JSON zone.
/// Without `origin` the JSON file name is used, so the zone loads under the same name.
pub fn import_file(zone_path: &Path, json_path: &Path, origin: Option<&str>) -> Result<Zone, ZoneFileError> {
    let origin = origin.map(str::to_string).or_else(|| origin_from_path(json_path));
    let parsed = parse_zone_file(&read(zone_path)?, origin.as_deref())?;
    let zone = to_zone(&parsed)?;

    let ttls = parsed.ttls();
    if ttls.len() > 1 {
        warn!(?ttls, "Record TTLs differ, the JSON zone keeps none of them");
    }

    let mut json = zone.to_json()?;
    json.push('\n');
    write(json_path, &json)?;

    info!(
        source = %zone_path.display(),
        destination = %json_path.display(),
        records = zone.record_count(),
        "Converted zone file to JSON"
    );
    Ok(zone)
}

/// Convert a JSON zone into a master file.
/// Without `origin` the JSON file name is used.
pub fn export_file(
    json_path: &Path,
    zone_path: &Path,
    origin: Option<&str>,
    ttl: u32,
) -> Result<Zone, ZoneFileError> {
    let zone = Zone::from_json(&read(json_path)?)?;
    let origin = origin.map(str::to_string).or_else(|| origin_from_path(json_path));

    write(zone_path, &export_zone(&zone, origin.as_deref(), ttl))?;

    info!(
        source = %json_path.display(),
        destination = %zone_path.display(),
        records = zone.record_count(),
        "Exported JSON zone"
    );
    Ok(zone)
}
