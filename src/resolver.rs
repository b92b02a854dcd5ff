use tracing::debug;

use crate::dns_question_and_answer::{fqdn, DnsAnswer, RecordType};
use crate::formatter::{self, MalformedRecordError};
use crate::query::{Answer, Query};
use crate::rdata::{self, RdataError};
use crate::zones::{RecordValue, Zone, ZoneCollection, APEX};

/// TTL of every locally answered record
pub const ANSWER_TTL: u32 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error("invalid {rtype} record at {owner} in zone {zone}: {source}")]
    Rdata {
        zone: String,
        owner: String,
        rtype: RecordType,
        #[source]
        source: RdataError,
    },
}

/// The most specific zone covering a name, and the name relative to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneMatch<'a> {
    pub zone_name: &'a str,
    pub zone: &'a Zone,
    pub owner: String,
}

/// Owner name of `name` relative to `zone_name`, or None when `name` is outside the zone.
/// `name` must be lower-cased and end with '.'; `zone_name` is normalized.
pub fn relative_owner(name: &str, zone_name: &str) -> Option<String> {
    let apex = fqdn(zone_name);

    if name == apex {
        return Some(APEX.to_string());
    }

    name.strip_suffix(apex.as_str())
        .and_then(|prefix| prefix.strip_suffix('.'))
        .filter(|owner| !owner.is_empty())
        .map(str::to_string)
}

/// Pick the zone with the longest name that `name` falls under, on label boundaries.
/// Walks from the full name towards the root, so the first hit is the longest.
pub fn find_zone<'a>(zones: &'a ZoneCollection, name: &str) -> Option<ZoneMatch<'a>> {
    let mut candidate = name.trim_end_matches('.');

    loop {
        if let Some((zone_name, zone)) = zones.lookup(candidate) {
            let owner = relative_owner(name, zone_name)?;
            return Some(ZoneMatch {
                zone_name,
                zone,
                owner,
            });
        }
        candidate = candidate.split_once('.')?.1;
    }
}

/// A record in the same zone addressed by a CNAME target, looked up by the
/// target's absolute name and, when it lies inside the zone, its relative name
fn cname_target_address<'a>(found: &ZoneMatch<'a>, target: &str) -> Option<&'a RecordValue> {
    let target = fqdn(&target.to_ascii_lowercase());
    let zone = found.zone;

    zone.get(RecordType::A, target.trim_end_matches('.')).or_else(|| {
        relative_owner(&target, found.zone_name).and_then(|owner| zone.get(RecordType::A, &owner))
    })
}

/// Answer `query` from the configured zones.
/// `Ok(None)` means no zone holds a record for it and the query should be forwarded.
pub fn resolve(query: &Query, zones: &ZoneCollection) -> Result<Option<Answer>, ResolveError> {
    let name = query.normalized_name();
    let Some(found) = find_zone(zones, &name) else {
        return Ok(None);
    };

    let rtype = query.record_type();
    let Some(value) = found.zone.get(rtype, &found.owner) else {
        debug!(zone = found.zone_name, owner = %found.owner, %rtype, "No record in matching zone");
        return Ok(None);
    };

    let (answer_type, values) = match rtype {
        RecordType::CNAME => match cname_target_address(&found, value.first()) {
            Some(address) => {
                debug!(zone = found.zone_name, target = value.first(), "Substituting A record for CNAME target");
                (RecordType::A, address)
            }
            None => (RecordType::CNAME, value),
        },
        _ => (rtype, value),
    };

    let records = values
        .values()
        .iter()
        .map(|raw| -> Result<DnsAnswer, ResolveError> {
            let text = formatter::format(answer_type, raw)?;
            let text = match answer_type {
                RecordType::CNAME => fqdn(&text),
                _ => text,
            };
            let rdata = rdata::encode(answer_type, &text).map_err(|source| ResolveError::Rdata {
                zone: found.zone_name.to_string(),
                owner: found.owner.clone(),
                rtype: answer_type,
                source,
            })?;
            Ok(DnsAnswer::new(query.name(), answer_type, ANSWER_TTL, rdata))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Answer::Records {
        query: query.clone(),
        records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_question_and_answer::CLASS_IN;

    fn zones(entries: &[(&str, &str)]) -> ZoneCollection {
        ZoneCollection::from_zones(
            entries
                .iter()
                .map(|(name, json)| (*name, Zone::from_json(json).unwrap())),
        )
    }

    fn answer_records(answer: Option<Answer>) -> Vec<DnsAnswer> {
        match answer {
            Some(Answer::Records { records, .. }) => records,
            other => panic!("expected local records, got {:?}", other),
        }
    }

    fn query(name: &str, rtype: RecordType) -> Query {
        Query::new(77, name, rtype).unwrap()
    }

    #[test]
    fn test_relative_owner() {
        assert_eq!(relative_owner("example.com.", "example.com"), Some("@".to_string()));
        assert_eq!(relative_owner("a.b.example.com.", "example.com"), Some("a.b".to_string()));
        assert_eq!(relative_owner("badexample.com.", "example.com"), None);
        assert_eq!(relative_owner("example.org.", "example.com"), None);
    }

    #[test]
    fn test_longest_match_wins() {
        let zones = zones(&[
            ("example.com", r#"{"A": {"www": "192.0.2.1"}}"#),
            ("www.example.com", r#"{"A": {"@": "192.0.2.2"}}"#),
        ]);

        let found = find_zone(&zones, "www.example.com.").unwrap();
        assert_eq!(found.zone_name, "www.example.com");
        assert_eq!(found.owner, "@");

        let records = answer_records(resolve(&query("www.example.com", RecordType::A), &zones).unwrap());
        assert_eq!(records[0].rdata, vec![192, 0, 2, 2]);
    }

    #[test]
    fn test_apex_and_case_insensitive_match() {
        let zones = zones(&[("example.com", r#"{"A": {"@": "192.0.2.10"}}"#)]);

        let records = answer_records(resolve(&query("EXAMPLE.com", RecordType::A), &zones).unwrap());

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "EXAMPLE.com.");
        assert_eq!(records[0].ttl, ANSWER_TTL);
        assert_eq!(records[0].rclass, CLASS_IN);
        assert_eq!(records[0].rdata, vec![192, 0, 2, 10]);
    }

    #[test]
    fn test_ptr_suffix_match() {
        let zones = zones(&[(
            "127.in-addr.arpa",
            r#"{"PTR": {"@": "host.example.com.", "1.0.0": "localhost"}}"#,
        )]);

        let found = find_zone(&zones, "1.0.0.127.in-addr.arpa.").unwrap();
        assert_eq!(found.zone_name, "127.in-addr.arpa");
        assert_eq!(found.owner, "1.0.0");

        let records =
            answer_records(resolve(&query("1.0.0.127.in-addr.arpa", RecordType::PTR), &zones).unwrap());
        assert_eq!(records[0].rtype, RecordType::PTR);
        assert_eq!(records[0].rdata, b"\x09localhost\x00".to_vec());

        // Nothing at the derived owner name: falls through to forwarding
        assert!(resolve(&query("2.0.0.127.in-addr.arpa", RecordType::PTR), &zones)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_multiple_values_become_record_set() {
        let zones = zones(&[("example.com", r#"{"A": {"www": ["192.0.2.1", "192.0.2.2"]}}"#)]);

        let records = answer_records(resolve(&query("www.example.com", RecordType::A), &zones).unwrap());

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].rdata, vec![192, 0, 2, 2]);
    }

    #[test]
    fn test_mx_default_preference_in_answer() {
        let zones = zones(&[("example.com", r#"{"MX": {"@": "mail.example.com."}}"#)]);

        let records = answer_records(resolve(&query("example.com", RecordType::MX), &zones).unwrap());

        assert_eq!(&records[0].rdata[..2], &[0, 10]);
    }

    #[test]
    fn test_cname_short_circuit() {
        let zones = zones(&[(
            "example.com",
            r#"{"CNAME": {"www": "host.example.com."}, "A": {"host.example.com": "203.0.113.5"}}"#,
        )]);

        let records = answer_records(resolve(&query("www.example.com", RecordType::CNAME), &zones).unwrap());

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rtype, RecordType::A);
        assert_eq!(records[0].name, "www.example.com.");
        assert_eq!(records[0].rdata, vec![203, 0, 113, 5]);
    }

    #[test]
    fn test_cname_short_circuit_relative_owner() {
        let zones = zones(&[(
            "example.com",
            r#"{"CNAME": {"www": "host.example.com"}, "A": {"host": "203.0.113.6"}}"#,
        )]);

        let records = answer_records(resolve(&query("www.example.com", RecordType::CNAME), &zones).unwrap());

        assert_eq!(records[0].rtype, RecordType::A);
        assert_eq!(records[0].rdata, vec![203, 0, 113, 6]);
    }

    #[test]
    fn test_cname_without_local_target() {
        let zones = zones(&[("example.com", r#"{"CNAME": {"www": "elsewhere.example.net"}}"#)]);

        let records = answer_records(resolve(&query("www.example.com", RecordType::CNAME), &zones).unwrap());

        assert_eq!(records[0].rtype, RecordType::CNAME);
        let mut expected = Vec::new();
        crate::dns_question_and_answer::encode_domain_name("elsewhere.example.net.", &mut expected)
            .unwrap();
        assert_eq!(records[0].rdata, expected);
    }

    #[test]
    fn test_empty_cname_is_malformed() {
        let zones = zones(&[("example.com", r#"{"CNAME": {"www": "  "}}"#)]);

        assert!(matches!(
            resolve(&query("www.example.com", RecordType::CNAME), &zones),
            Err(ResolveError::Malformed(_))
        ));
    }

    #[test]
    fn test_no_matching_zone_is_not_an_error() {
        let zones = zones(&[("example.com", r#"{"A": {"@": "192.0.2.1"}}"#)]);

        assert!(resolve(&query("example.org", RecordType::A), &zones).unwrap().is_none());
        assert!(resolve(&query("badexample.com", RecordType::A), &zones).unwrap().is_none());
        assert!(resolve(&query("example.com", RecordType::AAAA), &zones).unwrap().is_none());
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let zones = zones(&[
            ("example.com", r#"{"SRV": {"_sip._tcp": "0 5 sip.example.com"}}"#),
            ("example.org", r#"{"A": {"@": "not-an-address"}}"#),
        ]);

        assert!(matches!(
            resolve(&query("_sip._tcp.example.com", RecordType::SRV), &zones),
            Err(ResolveError::Malformed(_))
        ));
        assert!(matches!(
            resolve(&query("example.org", RecordType::A), &zones),
            Err(ResolveError::Rdata { .. })
        ));
    }
}
