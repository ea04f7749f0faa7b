use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;

/// An executable or shared-object mapping a sampled address falls into.
///
/// Identity for deduplication is `(file, build_id)`; start/end/offset are
/// carried from the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    /// Path of the mapped object on the profiled host.
    pub file: String,
    /// Build identifier of the mapped object, used to match the symbol set.
    pub build_id: String,
}

/// A resolved function. Identity is content, not an upstream-assigned id;
/// numeric ids are not stable across profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Mangled/system-level name, when it differs from `name`.
    pub system_name: String,
    pub filename: String,
    pub start_line: i64,
}

/// One entry of a location's inlined-call chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub line: i64,
    pub function: Option<Function>,
}

/// A single stack frame: a sampled address plus whatever symbolization
/// produced for it.
///
/// Zero lines means the address is unsymbolized. N lines represent N inlined
/// frames collapsed at one address, ordered innermost→outermost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub address: u64,
    pub mapping: Option<Mapping>,
    pub lines: Vec<Line>,
    /// Folded marker carried from upstream; not part of the binary encoding.
    pub is_folded: bool,
}

/// A location in its compact binary form (see [`crate::codec`]).
///
/// The bytes double as the content key for deduplication: equal locations
/// encode to byte-identical blobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedLocation(Vec<u8>);

impl EncodedLocation {
    pub fn from_location(location: &Location) -> Self {
        Self(codec::encode(location))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for EncodedLocation {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&Location> for EncodedLocation {
    fn from(location: &Location) -> Self {
        Self::from_location(location)
    }
}

/// One weighted call stack as handed to the report engine by the query layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Stack frames, innermost (leaf) first.
    pub stack: Vec<EncodedLocation>,
    pub value: i64,
    /// Value delta against a comparison profile, for diff reports.
    pub diff: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Unit of the sampled value, carried from ingestion into every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueUnit {
    Samples,
    Nanoseconds,
    Bytes,
}

impl ValueUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueUnit::Samples => "samples",
            ValueUnit::Nanoseconds => "nanoseconds",
            ValueUnit::Bytes => "bytes",
        }
    }

    /// Map a pprof unit string to a known unit, defaulting to sample counts.
    pub fn from_unit_str(unit: &str) -> Self {
        match unit {
            "nanoseconds" | "ns" => ValueUnit::Nanoseconds,
            "bytes" => ValueUnit::Bytes,
            _ => ValueUnit::Samples,
        }
    }
}

impl std::fmt::Display for ValueUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_location_is_content_keyed() {
        let a = Location {
            address: 0x4242,
            mapping: None,
            lines: vec![],
            is_folded: false,
        };
        let b = a.clone();
        assert_eq!(EncodedLocation::from(&a), EncodedLocation::from(&b));
    }

    #[test]
    fn value_unit_serializes_lowercase() {
        let json = serde_json::to_string(&ValueUnit::Nanoseconds).unwrap();
        assert_eq!(json, "\"nanoseconds\"");
    }

    #[test]
    fn unit_from_string_defaults_to_samples() {
        assert_eq!(ValueUnit::from_unit_str("count"), ValueUnit::Samples);
        assert_eq!(ValueUnit::from_unit_str("bytes"), ValueUnit::Bytes);
    }
}
