//! Static zone data, loaded once at startup and shared read-only afterwards.
//!
//! A zone file is a JSON object keyed by record type, then by owner name
//! relative to the zone apex (`@` for the apex itself):
//!
//! ```json
//! {
//!   "A":  { "@": "203.0.113.1", "www": ["203.0.113.2", "203.0.113.3"] },
//!   "MX": { "@": "10 mail.example.com." }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{error, info, warn};

use crate::dns_question_and_answer::{RecordType, UnknownRecordType};

/// Extension of files picked up from the zones directory
pub const ZONE_EXTENSION: &str = "json";

/// Owner name of the zone apex
pub const APEX: &str = "@";

/// Every value configured for one owner and type, in configured order.
/// Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordValue(Vec<String>);

impl RecordValue {
    pub fn new(values: Vec<String>) -> Option<Self> {
        if values.is_empty() {
            None
        } else {
            Some(RecordValue(values))
        }
    }

    pub fn single(value: impl Into<String>) -> Self {
        RecordValue(vec![value.into()])
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn first(&self) -> &str {
        &self.0[0]
    }

    pub fn push(&mut self, value: String) {
        self.0.push(value);
    }
}

impl<'de> Deserialize<'de> for RecordValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::One(value) => Ok(RecordValue::single(value)),
            Repr::Many(values) => RecordValue::new(values)
                .ok_or_else(|| D::Error::custom("record value list must not be empty")),
        }
    }
}

impl Serialize for RecordValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [single] => serializer.serialize_str(single),
            values => values.serialize(serializer),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ZoneDataError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Records of one zone, keyed by type and then by lower-cased relative owner name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Zone {
    records: BTreeMap<RecordType, BTreeMap<String, RecordValue>>,
}

impl Zone {
    /// Unrecognized type tags are left out with a warning
    pub fn from_json(text: &str) -> Result<Self, ZoneDataError> {
        let (zone, skipped) = Self::parse_json(text)?;
        for unknown in skipped {
            warn!(error = %unknown, "Skipping record type");
        }
        Ok(zone)
    }

    /// The zone, plus every type tag that was not recognized and left out.
    /// One bad tag never costs the records under the other tags.
    pub fn parse_json(text: &str) -> Result<(Self, Vec<UnknownRecordType>), ZoneDataError> {
        let raw: BTreeMap<String, BTreeMap<String, RecordValue>> = serde_json::from_str(text)?;

        let mut zone = Zone::default();
        let mut skipped = Vec::new();
        for (tag, owners) in raw {
            let rtype: RecordType = match tag.parse() {
                Ok(rtype) => rtype,
                Err(unknown) => {
                    skipped.push(unknown);
                    continue;
                }
            };
            for (owner, value) in owners {
                for item in value.0 {
                    zone.insert(rtype, &owner, item);
                }
            }
        }
        Ok((zone, skipped))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Append a value; values for the same owner and type accumulate in order
    pub fn insert(&mut self, rtype: RecordType, owner: &str, value: String) {
        let owner = owner.trim_end_matches('.').to_ascii_lowercase();
        let owner = if owner.is_empty() { APEX.to_string() } else { owner };

        let owners = self.records.entry(rtype).or_default();
        match owners.get_mut(&owner) {
            Some(existing) => existing.push(value),
            None => {
                owners.insert(owner, RecordValue::single(value));
            }
        }
    }

    /// `owner` must already be lower-cased
    pub fn get(&self, rtype: RecordType, owner: &str) -> Option<&RecordValue> {
        self.records.get(&rtype)?.get(owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordType, &str, &RecordValue)> {
        self.records.iter().flat_map(|(rtype, owners)| {
            owners
                .iter()
                .map(move |(owner, value)| (*rtype, owner.as_str(), value))
        })
    }

    pub fn record_count(&self) -> usize {
        self.iter().map(|(_, _, value)| value.values().len()).sum()
    }
}

impl Serialize for Zone {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for (rtype, owners) in &self.records {
            map.serialize_entry(&rtype.to_string(), owners)?;
        }
        map.end()
    }
}

/// Lower-cased, without the trailing root separator
pub fn normalize_zone_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, thiserror::Error)]
pub enum ZoneLoadError {
    #[error("zones directory not found: {0}")]
    DirectoryMissing(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error decoding JSON from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid zone data in {path}: {reason}")]
    InvalidZone { path: PathBuf, reason: String },

    #[error("{source} in {path}, records of that type are skipped")]
    UnknownType {
        path: PathBuf,
        #[source]
        source: UnknownRecordType,
    },

    #[error("zone {zone} in {path} is already loaded, skipping")]
    DuplicateZone { zone: String, path: PathBuf },
}

/// Every diagnostic from a load that skipped something
#[derive(Debug, thiserror::Error)]
#[error("{} zone file(s) could not be loaded", .skipped.len())]
pub struct PartialLoadError {
    pub skipped: Vec<ZoneLoadError>,
}

/// Result of loading a zones directory: whatever loaded, plus what did not
#[derive(Debug, Default)]
pub struct ZoneLoad {
    pub zones: ZoneCollection,
    pub diagnostics: Vec<ZoneLoadError>,
}

impl ZoneLoad {
    pub fn into_parts(self) -> (ZoneCollection, Option<PartialLoadError>) {
        let partial = if self.diagnostics.is_empty() {
            None
        } else {
            Some(PartialLoadError {
                skipped: self.diagnostics,
            })
        };
        (self.zones, partial)
    }
}

/// All configured zones, keyed by normalized zone name
#[derive(Debug, Clone, Default)]
pub struct ZoneCollection {
    zones: HashMap<String, Zone>,
}

impl ZoneCollection {
    /// Build from already-parsed zones. The first zone seen under a name wins.
    #[cfg(test)]
    pub fn from_zones<I, S>(zones: I) -> Self
    where
        I: IntoIterator<Item = (S, Zone)>,
        S: AsRef<str>,
    {
        let mut collection = ZoneCollection::default();
        for (name, zone) in zones {
            collection.insert(name.as_ref(), zone);
        }
        collection
    }

    /// Load every `*.json` file in `dir`, in file name order.
    /// A bad file is skipped and reported; it never aborts the load.
    pub fn load(dir: &Path) -> ZoneLoad {
        let mut outcome = ZoneLoad::default();

        if !dir.is_dir() {
            warn!(directory = %dir.display(), "Zones directory not found");
            outcome
                .diagnostics
                .push(ZoneLoadError::DirectoryMissing(dir.to_path_buf()));
            return outcome;
        }

        let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && path.extension() == Some(OsStr::new(ZONE_EXTENSION)))
                .collect(),
            Err(source) => {
                error!(directory = %dir.display(), error = %source, "Failed to list zones directory");
                outcome.diagnostics.push(ZoneLoadError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
                return outcome;
            }
        };
        paths.sort();

        paths.into_iter().fold(outcome, |mut outcome, path| {
            match load_zone_file(&path) {
                Ok((name, zone, skipped)) => {
                    for unknown in skipped {
                        warn!("{}", unknown);
                        outcome.diagnostics.push(unknown);
                    }
                    let records = zone.record_count();
                    if outcome.zones.insert(&name, zone) {
                        info!(zone = %name, records, "Loaded zone");
                    } else {
                        let duplicate = ZoneLoadError::DuplicateZone { zone: name, path };
                        warn!("{}", duplicate);
                        outcome.diagnostics.push(duplicate);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Skipping zone file");
                    outcome.diagnostics.push(e);
                }
            }
            outcome
        })
    }

    /// Returns false, leaving the existing zone in place, when the name is taken
    fn insert(&mut self, name: &str, zone: Zone) -> bool {
        use std::collections::hash_map::Entry;

        match self.zones.entry(normalize_zone_name(name)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(zone);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.lookup(name).map(|(_, zone)| zone)
    }

    /// The zone stored under `name`, with its normalized name
    pub fn lookup(&self, name: &str) -> Option<(&str, &Zone)> {
        self.zones
            .get_key_value(&normalize_zone_name(name))
            .map(|(name, zone)| (name.as_str(), zone))
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// The zone name and data, plus a diagnostic for each type tag that was skipped
fn load_zone_file(path: &Path) -> Result<(String, Zone, Vec<ZoneLoadError>), ZoneLoadError> {
    let name = path
        .file_stem()
        .and_then(OsStr::to_str)
        .map(normalize_zone_name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ZoneLoadError::InvalidZone {
            path: path.to_path_buf(),
            reason: "file name is not a usable zone name".to_string(),
        })?;

    let text = fs::read_to_string(path).map_err(|source| ZoneLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let (zone, unknown) = Zone::parse_json(&text).map_err(|e| match e {
        ZoneDataError::Json(source) => ZoneLoadError::Parse {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let skipped = unknown
        .into_iter()
        .map(|source| ZoneLoadError::UnknownType {
            path: path.to_path_buf(),
            source,
        })
        .collect();

    Ok((name, zone, skipped))
}
