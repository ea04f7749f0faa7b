//! Threshold pruning of a flamegraph.
//!
//! Rendering clients cap report size by dropping subtrees that are too small
//! to see: anything below a fraction of its parent's cumulative value goes,
//! and its whole subtree's value is accounted in a single `trimmed` counter.
//! Survivors are re-interned into fresh minimal dedup tables so the pruned
//! report does not ship metadata only dropped nodes referenced.

use smolder_profile::DedupTables;

use crate::tree::{Flamegraph, Node, ROOT};

/// A pruned flamegraph with its compacted tables.
#[derive(Debug)]
pub struct Trimmed {
    pub graph: Flamegraph,
    pub tables: DedupTables,
    /// Cumulative value removed with dropped subtrees.
    pub trimmed: i64,
}

/// Prune `graph` at `threshold` (a fraction in `[0, 1]` of each parent's
/// cumulative value).
///
/// Pruning is leveled: at every surviving node, the node's cumulative equals
/// the sum of its kept children plus the value dropped directly beneath it.
/// `total` keeps the untrimmed root cumulative. A threshold of 0 drops
/// nothing and only re-interns the tables.
pub fn trim(graph: &Flamegraph, tables: &DedupTables, threshold: f64) -> Trimmed {
    let src_root = graph.root_node();
    let mut out = Flamegraph {
        nodes: vec![Node {
            cumulative: src_root.cumulative,
            diff: src_root.diff,
            ..Node::default()
        }],
        root: ROOT,
        total: graph.total,
        height: graph.height,
        unit: graph.unit,
        skipped: graph.skipped,
    };
    let mut new_tables = DedupTables::new();
    let mut trimmed = 0;
    let children = keep_level(
        graph,
        tables,
        &src_root.children,
        src_root.cumulative,
        threshold,
        &mut out,
        &mut new_tables,
        &mut trimmed,
    );
    out.nodes[ROOT as usize].children = children;
    Trimmed {
        graph: out,
        tables: new_tables,
        trimmed,
    }
}

#[allow(clippy::too_many_arguments)]
fn keep_level(
    src: &Flamegraph,
    src_tables: &DedupTables,
    children: &[u32],
    parent_cumulative: i64,
    threshold: f64,
    dst: &mut Flamegraph,
    dst_tables: &mut DedupTables,
    trimmed: &mut i64,
) -> Vec<u32> {
    let cutoff = threshold * parent_cumulative as f64;
    let mut kept = Vec::with_capacity(children.len());
    for &child in children {
        let node = &src.nodes[child as usize];
        if (node.cumulative as f64) < cutoff {
            // Dropping a parent accounts for its whole subtree at once;
            // its children are never visited.
            *trimmed += node.cumulative;
            continue;
        }
        let id = dst.nodes.len() as u32;
        dst.nodes.push(Node {
            location: dst_tables.reintern_location(src_tables, node.location),
            line: node.line,
            function: dst_tables.reintern_function(src_tables, node.function),
            mapping: dst_tables.reintern_mapping(src_tables, node.mapping),
            cumulative: node.cumulative,
            diff: node.diff,
            children: Vec::new(),
        });
        kept.push(id);
        let grandchildren = keep_level(
            src,
            src_tables,
            &node.children,
            node.cumulative,
            threshold,
            dst,
            dst_tables,
            trimmed,
        );
        dst.nodes[id as usize].children = grandchildren;
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeBuilder;
    use smolder_profile::model::{EncodedLocation, Function, Line, Location, Sample, ValueUnit};

    fn frame(name: &str, address: u64) -> EncodedLocation {
        EncodedLocation::from(&Location {
            address,
            mapping: None,
            lines: vec![Line {
                line: 1,
                function: Some(Function {
                    name: name.to_owned(),
                    system_name: name.to_owned(),
                    filename: "src.rs".to_owned(),
                    start_line: 1,
                }),
            }],
            is_folded: false,
        })
    }

    fn sample(stack: Vec<EncodedLocation>, value: i64) -> Sample {
        Sample {
            stack,
            value,
            diff: 0,
            labels: Default::default(),
        }
    }

    fn wide_graph() -> (Flamegraph, DedupTables) {
        // root -> main(10) -> { heavy(8) -> deep(8), light(2) }
        let main = frame("main", 1);
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(
            vec![frame("deep", 3), frame("heavy", 2), main.clone()],
            8,
        ));
        builder.add_sample(&sample(vec![frame("light", 4), main], 2));
        builder.finish()
    }

    #[test]
    fn zero_threshold_drops_nothing() {
        let (graph, tables) = wide_graph();
        let pruned = trim(&graph, &tables, 0.0);
        assert_eq!(pruned.trimmed, 0);
        assert_eq!(pruned.graph.nodes.len(), graph.nodes.len());
        assert_eq!(pruned.graph.total, graph.total);
        assert_eq!(
            pruned.graph.root_node().cumulative,
            graph.root_node().cumulative
        );
    }

    #[test]
    fn single_full_weight_child_survives_half_threshold() {
        // One chain: the only child carries its parent's full cumulative, so
        // `cumulative < 0.5 * parent` never holds.
        let (f1, f2, f3) = (frame("f1", 1), frame("f2", 2), frame("f3", 3));
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(vec![f1.clone()], 2));
        builder.add_sample(&sample(vec![f2.clone(), f1.clone()], 1));
        builder.add_sample(&sample(vec![f3, f2, f1], 3));
        let (graph, tables) = builder.finish();
        let pruned = trim(&graph, &tables, 0.5);
        assert_eq!(pruned.trimmed, 0);
        assert_eq!(pruned.graph.nodes.len(), 4);
    }

    #[test]
    fn light_subtree_is_dropped_and_accounted() {
        let (graph, tables) = wide_graph();
        // At main (10): heavy is 8, light is 2; threshold 0.3 cuts light.
        let pruned = trim(&graph, &tables, 0.3);
        assert_eq!(pruned.trimmed, 2);
        // root, main, heavy, deep survive.
        assert_eq!(pruned.graph.nodes.len(), 4);
        let main = &pruned.graph.nodes[pruned.graph.root_node().children[0] as usize];
        let kept_sum: i64 = main
            .children
            .iter()
            .map(|&c| pruned.graph.nodes[c as usize].cumulative)
            .sum();
        assert_eq!(main.cumulative, kept_sum + pruned.trimmed);
        // The untrimmed total is preserved on the report.
        assert_eq!(pruned.graph.total, 10);
    }

    #[test]
    fn dropping_a_parent_accounts_its_subtree_once() {
        // root -> main(10) -> { heavy(9) -> deep(9), light(1) } with
        // threshold cutting heavy's whole subtree at once is impossible
        // (heavy dominates), so cut at the root level instead.
        let main = frame("main", 1);
        let other = frame("other", 9);
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(
            vec![frame("deep", 3), frame("heavy", 2), main.clone()],
            9,
        ));
        builder.add_sample(&sample(vec![other], 1));
        let (graph, tables) = builder.finish();
        // At root (10): other is 1 < 0.2 * 10; its subtree value counts once.
        let pruned = trim(&graph, &tables, 0.2);
        assert_eq!(pruned.trimmed, 1);
        assert_eq!(
            pruned.graph.root_node().cumulative,
            9 + pruned.trimmed,
            "kept children plus trimmed covers the root"
        );
    }

    #[test]
    fn pruned_tables_are_minimal() {
        let (graph, tables) = wide_graph();
        let pruned = trim(&graph, &tables, 0.3);
        // "light" is gone from the rebuilt tables: 3 surviving named
        // locations, each with one function.
        assert_eq!(pruned.tables.location_count(), 3);
        assert_eq!(pruned.tables.function_count(), 3);
        assert!(pruned.tables.location_count() < tables.location_count());
        let names: Vec<&str> = (1..=pruned.tables.function_count() as u32)
            .map(|i| pruned.tables.function_name(i))
            .collect();
        assert!(!names.contains(&"light"));
    }

    /// Walk source and pruned trees in parallel, asserting the per-level
    /// invariant and returning the dropped value under this pair.
    fn walk(src: &Flamegraph, src_id: u32, dst: &Flamegraph, dst_id: u32, threshold: f64) -> i64 {
        let s = &src.nodes[src_id as usize];
        let d = &dst.nodes[dst_id as usize];
        assert_eq!(s.cumulative, d.cumulative);
        let cutoff = threshold * s.cumulative as f64;
        let mut dropped_here = 0;
        let mut dropped_below = 0;
        let mut kept = d.children.iter();
        for &sc in &s.children {
            let child = &src.nodes[sc as usize];
            if (child.cumulative as f64) < cutoff {
                dropped_here += child.cumulative;
            } else {
                let &dc = kept.next().expect("survivor missing from pruned tree");
                dropped_below += walk(src, sc, dst, dc, threshold);
            }
        }
        assert!(kept.next().is_none(), "pruned tree has extra children");
        let kept_sum: i64 = d
            .children
            .iter()
            .map(|&c| dst.nodes[c as usize].cumulative)
            .sum();
        // Kept children plus value dropped at this level never exceed the
        // parent; any gap left is the node's own flat weight.
        assert!(d.cumulative >= kept_sum + dropped_here);
        dropped_here + dropped_below
    }

    #[test]
    fn trim_conservation_holds_at_every_level() {
        let (graph, tables) = wide_graph();
        for threshold in [0.0, 0.1, 0.3, 0.5, 0.9] {
            let pruned = trim(&graph, &tables, threshold);
            let dropped = walk(&graph, ROOT, &pruned.graph, ROOT, threshold);
            assert_eq!(dropped, pruned.trimmed, "threshold {threshold}");
        }
    }
}
