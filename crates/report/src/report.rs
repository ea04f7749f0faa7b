//! Serializable report shapes and the end-to-end pipeline entry points.

use serde::Serialize;
use smolder_profile::model::{Sample, ValueUnit};
use smolder_profile::DedupTables;

use crate::aggregate::aggregate;
use crate::table::{TableBuilder, TableReport};
use crate::tree::{Flamegraph, TreeBuilder};
use crate::trim::trim;

/// Knobs for flamegraph report generation.
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    /// Collapse sibling frames that resolve to the same function,
    /// discarding inlined-frame distinctions.
    pub aggregate_functions: bool,
    /// Prune subtrees below this fraction of their parent's cumulative
    /// value. `None` (and 0) keep everything.
    pub trim_threshold: Option<f64>,
}

/// The structural contract rendering clients depend on: the tree with its
/// totals, the pruned-away value, and the dedup tables its nodes reference.
#[derive(Debug, Serialize)]
pub struct FlamegraphReport {
    #[serde(flatten)]
    pub graph: Flamegraph,
    /// Cumulative value removed by pruning; 0 when untrimmed.
    pub trimmed: i64,
    /// Cumulative clamps applied during aggregation (recoverable repairs).
    pub clamped: u64,
    pub tables: DedupTables,
}

/// Build a flamegraph report from an ordered sample set.
pub fn flamegraph_report(
    samples: &[Sample],
    unit: ValueUnit,
    options: &ReportOptions,
) -> FlamegraphReport {
    let mut builder = TreeBuilder::new(unit);
    for sample in samples {
        builder.add_sample(sample);
    }
    let (mut graph, tables) = builder.finish();
    let clamped = if options.aggregate_functions {
        aggregate(&mut graph, &tables)
    } else {
        0
    };
    match options.trim_threshold {
        Some(threshold) if threshold > 0.0 => {
            let pruned = trim(&graph, &tables, threshold);
            FlamegraphReport {
                graph: pruned.graph,
                trimmed: pruned.trimmed,
                clamped,
                tables: pruned.tables,
            }
        }
        _ => FlamegraphReport {
            graph,
            trimmed: 0,
            clamped,
            tables,
        },
    }
}

/// Build a flat table report from an ordered sample set.
pub fn table_report(samples: &[Sample], unit: ValueUnit) -> TableReport {
    let mut builder = TableBuilder::new(unit);
    for sample in samples {
        builder.add_sample(sample);
    }
    builder.finish()
}
