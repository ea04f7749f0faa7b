//! Stack-tree builder: folds an ordered sequence of weighted samples into
//! one merged call tree, the raw material for flamegraph reports.

use serde::Serialize;
use smolder_profile::model::{Sample, ValueUnit};
use smolder_profile::DedupTables;

/// Arena index of the implicit root node.
pub const ROOT: u32 = 0;

/// One node of the call tree.
///
/// Nodes live in an arena ([`Flamegraph::nodes`]) and reference children by
/// index, which keeps merging and pruning free of aliasing and makes the
/// tree serialize flat.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Node {
    /// Location-table index; 0 only on the root.
    pub location: u32,
    /// 1-based inlined-line slot within the location (slot 1 = innermost);
    /// 0 for lineless locations and after function-level merging.
    pub line: u32,
    /// Function-table index; 0 when unresolved.
    pub function: u32,
    /// Mapping-table index; 0 when absent, or ambiguous after a merge.
    pub mapping: u32,
    pub cumulative: i64,
    pub diff: i64,
    /// Child arena indices, sorted by `(location, line)` while building.
    pub children: Vec<u32>,
}

/// A merged call tree in arena form plus its report header fields.
#[derive(Debug, Clone, Serialize)]
pub struct Flamegraph {
    pub nodes: Vec<Node>,
    /// Arena index of the root; always [`ROOT`].
    pub root: u32,
    /// Sum of all sample values folded in.
    pub total: i64,
    /// Deepest node path, root included.
    pub height: u32,
    pub unit: ValueUnit,
    /// Stack frames dropped because their encoded blobs failed to decode.
    pub skipped: u64,
}

impl Flamegraph {
    pub fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    pub fn root_node(&self) -> &Node {
        &self.nodes[ROOT as usize]
    }

    /// Rebuild the arena keeping only nodes reachable from the root,
    /// remapping child indices and preserving child order. Merging leaves
    /// orphans behind; reports must not carry them.
    pub(crate) fn compact(&mut self) {
        const UNSEEN: u32 = u32::MAX;
        let mut remap = vec![UNSEEN; self.nodes.len()];
        let mut order: Vec<u32> = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            if remap[id as usize] != UNSEEN {
                continue;
            }
            remap[id as usize] = order.len() as u32;
            order.push(id);
            stack.extend_from_slice(&self.nodes[id as usize].children);
        }
        let mut nodes = Vec::with_capacity(order.len());
        for &old in &order {
            let mut node = std::mem::take(&mut self.nodes[old as usize]);
            for child in &mut node.children {
                *child = remap[*child as usize];
            }
            nodes.push(node);
        }
        self.nodes = nodes;
    }
}

/// Folds samples into a call tree rooted at an implicit root node whose
/// cumulative value is the sum of all sample values.
#[derive(Debug)]
pub struct TreeBuilder {
    nodes: Vec<Node>,
    tables: DedupTables,
    height: u32,
    skipped: u64,
    unit: ValueUnit,
}

impl TreeBuilder {
    pub fn new(unit: ValueUnit) -> Self {
        Self {
            nodes: vec![Node::default()],
            tables: DedupTables::new(),
            height: 1,
            skipped: 0,
            unit,
        }
    }

    /// Fold one sample into the tree.
    ///
    /// The stack is stored innermost-first and walked root-first. Each
    /// location expands into one node per inlined line, outermost line
    /// first; an unsymbolized location yields a single node keyed by the
    /// location alone. A frame whose blob fails to decode is skipped and
    /// counted, the rest of the stack still lands.
    pub fn add_sample(&mut self, sample: &Sample) {
        let mut cursor = ROOT;
        let mut depth: u32 = 0;
        for encoded in sample.stack.iter().rev() {
            let location = match self.tables.add_location(encoded.as_bytes()) {
                Ok(idx) => idx,
                Err(_) => {
                    self.skipped += 1;
                    continue;
                }
            };
            let line_count = self
                .tables
                .location(location)
                .map_or(0, |entry| entry.lines.len() as u32);
            if line_count == 0 {
                cursor = self.step(cursor, location, 0, sample.value, sample.diff);
                depth += 1;
            } else {
                for slot in (1..=line_count).rev() {
                    cursor = self.step(cursor, location, slot, sample.value, sample.diff);
                    depth += 1;
                }
            }
        }
        let root = &mut self.nodes[ROOT as usize];
        root.cumulative += sample.value;
        root.diff += sample.diff;
        self.height = self.height.max(depth + 1);
    }

    pub fn finish(self) -> (Flamegraph, DedupTables) {
        let total = self.nodes[ROOT as usize].cumulative;
        (
            Flamegraph {
                nodes: self.nodes,
                root: ROOT,
                total,
                height: self.height,
                unit: self.unit,
                skipped: self.skipped,
            },
            self.tables,
        )
    }

    /// Descend from `parent` into the child keyed `(location, line)`,
    /// accumulating the sample's weight, inserting at the sorted position
    /// when absent.
    fn step(&mut self, parent: u32, location: u32, line: u32, value: i64, diff: i64) -> u32 {
        let key = (location, line);
        match self.find_child(parent, key) {
            Ok(pos) => {
                let child = self.nodes[parent as usize].children[pos];
                if child == parent {
                    // A child list aliasing its own node would turn this
                    // walk into a cycle. Drop the stale list and insert a
                    // fresh child.
                    self.nodes[parent as usize].children.clear();
                    return self.insert_child(parent, 0, key, value, diff);
                }
                let node = &mut self.nodes[child as usize];
                node.cumulative += value;
                node.diff += diff;
                child
            }
            Err(pos) => self.insert_child(parent, pos, key, value, diff),
        }
    }

    fn find_child(&self, parent: u32, key: (u32, u32)) -> Result<usize, usize> {
        self.nodes[parent as usize]
            .children
            .binary_search_by(|&child| {
                let node = &self.nodes[child as usize];
                (node.location, node.line).cmp(&key)
            })
    }

    fn insert_child(
        &mut self,
        parent: u32,
        pos: usize,
        key: (u32, u32),
        value: i64,
        diff: i64,
    ) -> u32 {
        let (location, line) = key;
        let (function, mapping) = self.tables.location(location).map_or((0, 0), |entry| {
            let function = line
                .checked_sub(1)
                .and_then(|slot| entry.lines.get(slot as usize))
                .map_or(0, |l| l.function);
            (function, entry.mapping)
        });
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            location,
            line,
            function,
            mapping,
            cumulative: value,
            diff,
            children: Vec::new(),
        });
        self.nodes[parent as usize].children.insert(pos, id);
        id
    }
}
