//! Content-interning tables for report output.
//!
//! Reports reference mappings, functions, and locations by table index
//! instead of repeating metadata per tree node or table row. Indices are
//! 1-based; 0 means "absent" (string index 0 is the reserved empty string).
//! Entries reference earlier tables by index only, never by pointer, so a
//! table set serializes flat.
//!
//! Interning never mutates caller-owned input: the tables store their own
//! entry records with index-valued fields and leave the caller's structs
//! untouched.

use std::collections::HashMap;

use serde::Serialize;

use crate::codec::{self, DecodeError};
use crate::model::{Function, Line, Location, Mapping};

/// Interned mapping: `file` and `build_id` are string-table indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub file: u32,
    pub build_id: u32,
}

/// Interned function: all string fields are string-table indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionEntry {
    pub name: u32,
    pub system_name: u32,
    pub filename: u32,
    pub start_line: i64,
}

/// One inlined-line entry of an interned location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineEntry {
    pub line: i64,
    /// Function-table index; 0 when the line has no resolved function.
    pub function: u32,
}

/// Interned location. `mapping` is a mapping-table index (0 = none); lines
/// stay in stored order, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationEntry {
    pub address: u64,
    pub mapping: u32,
    pub lines: Vec<LineEntry>,
    pub is_folded: bool,
    #[serde(skip)]
    key: Vec<u8>,
}

impl LocationEntry {
    /// The encoded blob this entry was interned under: its content id.
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// Append-only string/mapping/function/location tables with content-based
/// interning. Query-scoped: one table set per report, dropped with it.
#[derive(Debug, Serialize)]
pub struct DedupTables {
    strings: Vec<String>,
    mappings: Vec<MappingEntry>,
    functions: Vec<FunctionEntry>,
    locations: Vec<LocationEntry>,
    #[serde(skip)]
    string_index: HashMap<String, u32>,
    #[serde(skip)]
    mapping_index: HashMap<(u32, u32), u32>,
    #[serde(skip)]
    function_index: HashMap<(i64, u32, u32, u32), u32>,
    #[serde(skip)]
    location_index: HashMap<Vec<u8>, u32>,
}

impl Default for DedupTables {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupTables {
    /// Fresh tables holding only the reserved empty string at index 0.
    pub fn new() -> Self {
        let mut tables = Self {
            strings: Vec::new(),
            mappings: Vec::new(),
            functions: Vec::new(),
            locations: Vec::new(),
            string_index: HashMap::new(),
            mapping_index: HashMap::new(),
            function_index: HashMap::new(),
            location_index: HashMap::new(),
        };
        tables.strings.push(String::new());
        tables.string_index.insert(String::new(), 0);
        tables
    }

    /// Intern `s`, returning its index. Index 0 is always the empty string.
    pub fn add_string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.string_index.insert(s.to_owned(), idx);
        idx
    }

    /// Intern a mapping by its `(file, build_id)` identity. Re-adding a known
    /// mapping returns the existing index without duplicating storage.
    pub fn add_mapping(&mut self, mapping: &Mapping) -> u32 {
        let file = self.add_string(&mapping.file);
        let build_id = self.add_string(&mapping.build_id);
        self.intern_mapping(MappingEntry {
            start: mapping.start,
            end: mapping.end,
            offset: mapping.offset,
            file,
            build_id,
        })
    }

    /// Intern a function by its `(start_line, name, system_name, filename)`
    /// identity: content, not an upstream-assigned id.
    pub fn add_function(&mut self, function: &Function) -> u32 {
        let name = self.add_string(&function.name);
        let system_name = self.add_string(&function.system_name);
        let filename = self.add_string(&function.filename);
        self.intern_function(FunctionEntry {
            name,
            system_name,
            filename,
            start_line: function.start_line,
        })
    }

    /// Intern an encoded location, keyed by its blob. Decodes at most once
    /// per distinct blob, so the tables double as a decode cache.
    pub fn add_location(&mut self, encoded: &[u8]) -> Result<u32, DecodeError> {
        if let Some(&idx) = self.location_index.get(encoded) {
            return Ok(idx);
        }
        let location = codec::decode(encoded)?;
        Ok(self.intern_location(&location, encoded))
    }

    /// Total getter: index 0 or out-of-range yields `""`.
    pub fn string(&self, idx: u32) -> &str {
        self.strings.get(idx as usize).map_or("", String::as_str)
    }

    /// Total getter: index 0 or out-of-range yields `None`.
    pub fn mapping(&self, idx: u32) -> Option<&MappingEntry> {
        idx.checked_sub(1)
            .and_then(|i| self.mappings.get(i as usize))
    }

    /// Total getter: index 0 or out-of-range yields `None`.
    pub fn function(&self, idx: u32) -> Option<&FunctionEntry> {
        idx.checked_sub(1)
            .and_then(|i| self.functions.get(i as usize))
    }

    /// Total getter: index 0 or out-of-range yields `None`.
    pub fn location(&self, idx: u32) -> Option<&LocationEntry> {
        idx.checked_sub(1)
            .and_then(|i| self.locations.get(i as usize))
    }

    /// Resolved name of a function-table entry, `""` when absent.
    pub fn function_name(&self, idx: u32) -> &str {
        self.function(idx).map_or("", |f| self.string(f.name))
    }

    /// Address of a location-table entry, 0 when absent.
    pub fn location_address(&self, idx: u32) -> u64 {
        self.location(idx).map_or(0, |l| l.address)
    }

    /// Reconstruct the original location from an interned entry, for callers
    /// that need the full object back.
    pub fn resolve_location(&self, idx: u32) -> Option<Location> {
        let entry = self.location(idx)?;
        let mapping = self.mapping(entry.mapping).map(|m| Mapping {
            start: m.start,
            end: m.end,
            offset: m.offset,
            file: self.string(m.file).to_owned(),
            build_id: self.string(m.build_id).to_owned(),
        });
        let lines = entry
            .lines
            .iter()
            .map(|l| Line {
                line: l.line,
                function: self.function(l.function).map(|f| Function {
                    name: self.string(f.name).to_owned(),
                    system_name: self.string(f.system_name).to_owned(),
                    filename: self.string(f.filename).to_owned(),
                    start_line: f.start_line,
                }),
            })
            .collect();
        Some(Location {
            address: entry.address,
            mapping,
            lines,
            is_folded: entry.is_folded,
        })
    }

    /// Copy a location entry from another table set into this one,
    /// translating every embedded index. Used when rebuilding minimal tables
    /// for a pruned report.
    pub fn reintern_location(&mut self, from: &DedupTables, idx: u32) -> u32 {
        let Some(entry) = from.location(idx) else {
            return 0;
        };
        if let Some(&existing) = self.location_index.get(entry.key()) {
            return existing;
        }
        let mapping = self.reintern_mapping(from, entry.mapping);
        let lines = entry
            .lines
            .iter()
            .map(|l| LineEntry {
                line: l.line,
                function: self.reintern_function(from, l.function),
            })
            .collect();
        self.push_location(LocationEntry {
            address: entry.address,
            mapping,
            lines,
            is_folded: entry.is_folded,
            key: entry.key.clone(),
        })
    }

    /// Copy a mapping entry from another table set, translating its strings.
    pub fn reintern_mapping(&mut self, from: &DedupTables, idx: u32) -> u32 {
        let Some(entry) = from.mapping(idx) else {
            return 0;
        };
        let file = self.add_string(from.string(entry.file));
        let build_id = self.add_string(from.string(entry.build_id));
        self.intern_mapping(MappingEntry {
            start: entry.start,
            end: entry.end,
            offset: entry.offset,
            file,
            build_id,
        })
    }

    /// Copy a function entry from another table set, translating its strings.
    pub fn reintern_function(&mut self, from: &DedupTables, idx: u32) -> u32 {
        let Some(entry) = from.function(idx) else {
            return 0;
        };
        let name = self.add_string(from.string(entry.name));
        let system_name = self.add_string(from.string(entry.system_name));
        let filename = self.add_string(from.string(entry.filename));
        self.intern_function(FunctionEntry {
            name,
            system_name,
            filename,
            start_line: entry.start_line,
        })
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    fn intern_mapping(&mut self, entry: MappingEntry) -> u32 {
        let key = (entry.file, entry.build_id);
        if let Some(&idx) = self.mapping_index.get(&key) {
            return idx;
        }
        let idx = self.mappings.len() as u32 + 1;
        self.mappings.push(entry);
        self.mapping_index.insert(key, idx);
        idx
    }

    fn intern_function(&mut self, entry: FunctionEntry) -> u32 {
        let key = (
            entry.start_line,
            entry.name,
            entry.system_name,
            entry.filename,
        );
        if let Some(&idx) = self.function_index.get(&key) {
            return idx;
        }
        let idx = self.functions.len() as u32 + 1;
        self.functions.push(entry);
        self.function_index.insert(key, idx);
        idx
    }

    fn intern_location(&mut self, location: &Location, encoded: &[u8]) -> u32 {
        let mapping = location
            .mapping
            .as_ref()
            .map_or(0, |m| self.add_mapping(m));
        let lines = location
            .lines
            .iter()
            .map(|line| LineEntry {
                line: line.line,
                function: line.function.as_ref().map_or(0, |f| self.add_function(f)),
            })
            .collect();
        self.push_location(LocationEntry {
            address: location.address,
            mapping,
            lines,
            is_folded: location.is_folded,
            key: encoded.to_vec(),
        })
    }

    fn push_location(&mut self, entry: LocationEntry) -> u32 {
        let idx = self.locations.len() as u32 + 1;
        self.location_index.insert(entry.key.clone(), idx);
        self.locations.push(entry);
        idx
    }
}
