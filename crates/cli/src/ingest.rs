//! pprof JSON ingestion (the `go tool pprof -json` export shape).
//!
//! Produces the internal sample model only. For binary protobuf pprof,
//! convert first with `go tool pprof -proto` then export to JSON.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use smolder_profile::model::{EncodedLocation, Function, Line, Location, Mapping, Sample, ValueUnit};
use smolder_profile::symbolize::Symbolizer;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no samples found")]
    NoSamples,
}

#[derive(Debug, Deserialize)]
struct PprofJson {
    #[serde(default, rename = "sampleType")]
    sample_type: Vec<PprofValueType>,
    #[serde(default)]
    samples: Vec<PprofSample>,
    #[serde(default)]
    locations: Vec<PprofLocation>,
    #[serde(default)]
    functions: Vec<PprofFunction>,
    #[serde(default)]
    mappings: Vec<PprofMapping>,
    #[serde(default, rename = "stringTable")]
    string_table: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PprofValueType {
    #[serde(default)]
    unit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PprofSample {
    #[serde(default, rename = "locationId")]
    location_id: Vec<u64>,
    #[serde(default)]
    value: Vec<i64>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PprofLocation {
    id: u64,
    #[serde(default)]
    address: u64,
    #[serde(default, rename = "mappingId")]
    mapping_id: u64,
    #[serde(default)]
    line: Vec<PprofLine>,
}

#[derive(Debug, Deserialize)]
struct PprofLine {
    #[serde(default, rename = "functionId")]
    function_id: u64,
    #[serde(default)]
    line: i64,
}

#[derive(Debug, Deserialize)]
struct PprofFunction {
    id: u64,
    #[serde(default)]
    name: u64,
    #[serde(default, rename = "systemName")]
    system_name: Option<u64>,
    #[serde(default)]
    filename: Option<u64>,
    #[serde(default, rename = "startLine")]
    start_line: i64,
}

#[derive(Debug, Deserialize)]
struct PprofMapping {
    id: u64,
    #[serde(default)]
    start: u64,
    #[serde(default)]
    limit: u64,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    filename: Option<u64>,
    #[serde(default, rename = "buildId")]
    build_id: Option<u64>,
}

/// A parsed profile: the engine's sample model plus its value unit.
#[derive(Debug)]
pub struct ProfileData {
    pub samples: Vec<Sample>,
    pub unit: ValueUnit,
}

/// Parse a pprof JSON export into engine samples.
pub fn parse(data: &[u8]) -> Result<ProfileData, IngestError> {
    parse_with_symbolizer(data, &smolder_profile::NoopSymbolizer)
}

/// Parse a pprof JSON export, offering lineless locations that carry a
/// build id to `symbolizer`. Addresses the symbolizer cannot resolve stay
/// unsymbolized; ingestion continues either way.
pub fn parse_with_symbolizer(
    data: &[u8],
    symbolizer: &dyn Symbolizer,
) -> Result<ProfileData, IngestError> {
    let pprof: PprofJson = serde_json::from_slice(data)?;
    if pprof.samples.is_empty() {
        return Err(IngestError::NoSamples);
    }

    let lookup_string = |idx: Option<u64>| -> String {
        idx.and_then(|i| pprof.string_table.get(i as usize))
            .cloned()
            .unwrap_or_default()
    };

    let mapping_map: HashMap<u64, Mapping> = pprof
        .mappings
        .iter()
        .map(|m| {
            (
                m.id,
                Mapping {
                    start: m.start,
                    end: m.limit,
                    offset: m.offset,
                    file: lookup_string(m.filename),
                    build_id: lookup_string(m.build_id),
                },
            )
        })
        .collect();

    let function_map: HashMap<u64, Function> = pprof
        .functions
        .iter()
        .map(|f| {
            (
                f.id,
                Function {
                    name: lookup_string(Some(f.name)),
                    system_name: lookup_string(f.system_name),
                    filename: lookup_string(f.filename),
                    start_line: f.start_line,
                },
            )
        })
        .collect();

    let location_map: HashMap<u64, Location> = pprof
        .locations
        .iter()
        .map(|l| {
            let lines = l
                .line
                .iter()
                .map(|line| Line {
                    line: line.line,
                    function: function_map.get(&line.function_id).cloned(),
                })
                .collect();
            (
                l.id,
                Location {
                    address: l.address,
                    mapping: mapping_map.get(&l.mapping_id).cloned(),
                    lines,
                    is_folded: false,
                },
            )
        })
        .collect();

    // Encode each distinct location once; an id the table does not know
    // degrades to a bare unsymbolized address rather than failing the file.
    let mut encoded: HashMap<u64, EncodedLocation> = HashMap::new();
    let mut resolve = |loc_id: u64| -> EncodedLocation {
        if let Some(cached) = encoded.get(&loc_id) {
            return cached.clone();
        }
        let location = match location_map.get(&loc_id) {
            Some(location) => symbolized(location.clone(), symbolizer),
            None => Location {
                address: loc_id,
                ..Location::default()
            },
        };
        let blob = EncodedLocation::from(&location);
        encoded.insert(loc_id, blob.clone());
        blob
    };

    // The last configured sample type is the one reports are built over,
    // matching the value picked below.
    let unit = pprof
        .sample_type
        .last()
        .and_then(|t| t.unit)
        .and_then(|i| pprof.string_table.get(i as usize))
        .map_or(ValueUnit::Samples, |u| ValueUnit::from_unit_str(u));

    let samples = pprof
        .samples
        .iter()
        .map(|s| Sample {
            // pprof stacks are already leaf-first, which is the engine's
            // stored order.
            stack: s.location_id.iter().map(|&id| resolve(id)).collect(),
            value: s.value.last().copied().unwrap_or(1),
            diff: 0,
            labels: s.labels.clone().into_iter().collect(),
        })
        .collect();

    Ok(ProfileData { samples, unit })
}

/// Offer a lineless, build-id-carrying location to the symbolizer.
fn symbolized(location: Location, symbolizer: &dyn Symbolizer) -> Location {
    if !location.lines.is_empty() {
        return location;
    }
    let Some(build_id) = location.mapping.as_ref().map(|m| m.build_id.clone()) else {
        return location;
    };
    if build_id.is_empty() {
        return location;
    }
    let mut chains = symbolizer.symbolize(&build_id, &[location.address]);
    match chains.pop() {
        Some(lines) if !lines.is_empty() => Location { lines, ..location },
        _ => location,
    }
}
