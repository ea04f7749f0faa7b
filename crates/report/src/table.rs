//! Flat, row-deduplicated view of a sample set with caller/callee
//! adjacency: the shape behind top/table/sandwich style reports.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use smolder_profile::model::{Sample, ValueUnit};
use smolder_profile::DedupTables;

/// One table row: a unique address (for unsymbolized frames) or function.
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub address: u64,
    /// Mapping-table index; 0 when absent.
    pub mapping: u32,
    /// Function-table index; 0 for unsymbolized rows.
    pub function: u32,
    /// Value of every sample whose stack touches this row, counted once per
    /// sample even when the function recurses within one stack.
    pub cumulative: i64,
    /// Value attributed to this row as the stack's leaf.
    pub flat: i64,
    pub diff: i64,
    /// Row indices observed immediately above this row in any stack.
    pub callers: BTreeSet<u32>,
    /// Row indices observed immediately below this row in any stack.
    pub callees: BTreeSet<u32>,
}

/// Row identity: raw address for unsymbolized frames, function name for
/// symbolized ones. Indices are into the builder's dedup tables, so equal
/// content means equal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Address { build_id: u32, address: u64 },
    Function { name: u32 },
}

/// The flat report: rows, grand total, and the tables rows reference.
#[derive(Debug, Serialize)]
pub struct TableReport {
    pub rows: Vec<TableRow>,
    /// Sum of all sample values.
    pub cumulative: i64,
    pub unit: ValueUnit,
    /// Stack frames dropped because their encoded blobs failed to decode.
    pub skipped: u64,
    pub tables: DedupTables,
}

/// Builds the flat table directly from samples; no tree involved.
#[derive(Debug)]
pub struct TableBuilder {
    tables: DedupTables,
    rows: Vec<TableRow>,
    index: HashMap<RowKey, u32>,
    cumulative: i64,
    skipped: u64,
    unit: ValueUnit,
}

impl TableBuilder {
    pub fn new(unit: ValueUnit) -> Self {
        Self {
            tables: DedupTables::new(),
            rows: Vec::new(),
            index: HashMap::new(),
            cumulative: 0,
            skipped: 0,
            unit,
        }
    }

    /// Fold one sample: walk its stack root→leaf (and each location's lines
    /// outer→inner), crediting cumulative value once per row per sample and
    /// recording a caller/callee edge at every adjacent pair.
    pub fn add_sample(&mut self, sample: &Sample) {
        let interned: Vec<Option<u32>> = sample
            .stack
            .iter()
            .map(|encoded| match self.tables.add_location(encoded.as_bytes()) {
                Ok(idx) => Some(idx),
                Err(_) => {
                    self.skipped += 1;
                    None
                }
            })
            .collect();
        // Flat weight lands on the innermost position that actually
        // decoded. A corrupt leaf must not silently credit a frame that was
        // never the leaf; the skip is counted above instead.
        let leaf_pos = interned.iter().position(Option::is_some);

        let mut counted: HashSet<u32> = HashSet::new();
        let mut previous: Option<u32> = None;
        for (pos, &slot) in interned.iter().enumerate().rev() {
            let Some(location) = slot else { continue };
            let Some(entry) = self.tables.location(location) else {
                continue;
            };
            let address = entry.address;
            let mapping = entry.mapping;
            let line_functions: Vec<u32> = entry.lines.iter().map(|l| l.function).collect();
            let build_id = self.build_id_of(mapping);
            let at_leaf_location = leaf_pos == Some(pos);

            if line_functions.is_empty() {
                let row = self.touch(
                    RowKey::Address { build_id, address },
                    address,
                    mapping,
                    0,
                    sample,
                    at_leaf_location,
                    &mut counted,
                );
                link(&mut self.rows, previous, row);
                previous = Some(row);
            } else {
                for (line_pos, &function) in line_functions.iter().enumerate().rev() {
                    let key = if function == 0 {
                        RowKey::Address { build_id, address }
                    } else {
                        RowKey::Function {
                            name: self.tables.function(function).map_or(0, |f| f.name),
                        }
                    };
                    // The leaf is the innermost line of the leaf location.
                    let at_leaf = at_leaf_location && line_pos == 0;
                    let row = self.touch(key, address, mapping, function, sample, at_leaf, &mut counted);
                    link(&mut self.rows, previous, row);
                    previous = Some(row);
                }
            }
        }
        self.cumulative += sample.value;
    }

    pub fn finish(self) -> TableReport {
        TableReport {
            rows: self.rows,
            cumulative: self.cumulative,
            unit: self.unit,
            skipped: self.skipped,
            tables: self.tables,
        }
    }

    fn build_id_of(&self, mapping: u32) -> u32 {
        self.tables.mapping(mapping).map_or(0, |m| m.build_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn touch(
        &mut self,
        key: RowKey,
        address: u64,
        mapping: u32,
        function: u32,
        sample: &Sample,
        at_leaf: bool,
        counted: &mut HashSet<u32>,
    ) -> u32 {
        if let Some(&row) = self.index.get(&key) {
            if counted.insert(row) {
                let r = &mut self.rows[row as usize];
                r.cumulative += sample.value;
                r.diff += sample.diff;
            }
            if at_leaf {
                self.rows[row as usize].flat += sample.value;
            }
            return row;
        }
        let row = self.rows.len() as u32;
        self.rows.push(TableRow {
            address,
            mapping,
            function,
            cumulative: sample.value,
            flat: if at_leaf { sample.value } else { 0 },
            diff: sample.diff,
            callers: BTreeSet::new(),
            callees: BTreeSet::new(),
        });
        self.index.insert(key, row);
        counted.insert(row);
        row
    }
}

/// Record the adjacency edge between the previously visited row and the
/// current one. Runs on every occurrence, not just the first.
fn link(rows: &mut [TableRow], previous: Option<u32>, current: u32) {
    if let Some(prev) = previous {
        rows[prev as usize].callees.insert(current);
        rows[current as usize].callers.insert(prev);
    }
}
