//! Function-level merging of a built call tree.
//!
//! The tree builder keys nodes by `(location, inlined-line slot)`, which
//! keeps distinct inline expansions of the same function apart. Reports
//! group by function instead: sibling nodes resolving to the same function
//! name (or to the same address, when neither side has a function) collapse
//! into a single node with summed values and concatenated children.

use std::cmp::Ordering;

use smolder_profile::DedupTables;

use crate::tree::{Flamegraph, ROOT};

/// Merge same-function siblings throughout `graph`, in place.
///
/// Runs an explicit worklist rather than recursion, since sampled stacks
/// can be arbitrarily deep. Parents are visited before their children, so the
/// grandchild lists a merge concatenates are themselves merged once their
/// node is reached. Returns the number of cumulative clamps applied
/// (recoverable repairs, logged at warn).
pub fn aggregate(graph: &mut Flamegraph, tables: &DedupTables) -> u64 {
    let mut clamped = 0;
    let mut worklist = vec![ROOT];
    while let Some(id) = worklist.pop() {
        merge_children(graph, tables, id, &mut clamped);
        worklist.extend_from_slice(&graph.nodes[id as usize].children);
    }
    graph.compact();
    clamped
}

fn merge_children(graph: &mut Flamegraph, tables: &DedupTables, parent: u32, clamped: &mut u64) {
    let mut children = std::mem::take(&mut graph.nodes[parent as usize].children);
    if children.len() > 1 {
        children.sort_by(|&a, &b| order(graph, tables, a, b));
    }

    // The sort groups equals adjacently, so one linear pass merges them all.
    let mut merged: Vec<u32> = Vec::with_capacity(children.len());
    for child in children {
        match merged.last() {
            Some(&last) if order(graph, tables, last, child) == Ordering::Equal => {
                absorb(graph, last, child);
            }
            _ => merged.push(child),
        }
    }

    let child_sum: i64 = merged
        .iter()
        .map(|&c| graph.nodes[c as usize].cumulative)
        .sum();
    let node = &mut graph.nodes[parent as usize];
    node.children = merged;
    if node.cumulative < child_sum {
        // Feeder bug, not an expected state: repair rather than emit an
        // inconsistent tree.
        tracing::warn!(
            node = parent,
            cumulative = node.cumulative,
            child_sum,
            "node cumulative below child sum, raising"
        );
        node.cumulative = child_sum;
        *clamped += 1;
    }
}

/// Grouping predicate: nodes without a function sort before nodes with one
/// and compare by address; nodes with functions compare by resolved name.
/// `Equal` is exactly the merge condition.
fn order(graph: &Flamegraph, tables: &DedupTables, a: u32, b: u32) -> Ordering {
    let (na, nb) = (&graph.nodes[a as usize], &graph.nodes[b as usize]);
    match (na.function, nb.function) {
        (0, 0) => tables
            .location_address(na.location)
            .cmp(&tables.location_address(nb.location)),
        (0, _) => Ordering::Less,
        (_, 0) => Ordering::Greater,
        (fa, fb) => tables.function_name(fa).cmp(tables.function_name(fb)),
    }
}

fn absorb(graph: &mut Flamegraph, into: u32, from: u32) {
    let donor = std::mem::take(&mut graph.nodes[from as usize]);
    let node = &mut graph.nodes[into as usize];
    node.cumulative += donor.cumulative;
    node.diff += donor.diff;
    node.children.extend(donor.children);
    // The inlined-line slot is ambiguous once two expansions merge.
    node.line = 0;
    if node.mapping != donor.mapping {
        // Two origins, one node: no single mapping can be claimed.
        node.mapping = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeBuilder;
    use smolder_profile::model::{
        EncodedLocation, Function, Line, Location, Mapping, Sample, ValueUnit,
    };

    fn named_frame(name: &str, filename: &str, address: u64) -> EncodedLocation {
        EncodedLocation::from(&Location {
            address,
            mapping: None,
            lines: vec![Line {
                line: 1,
                function: Some(Function {
                    name: name.to_owned(),
                    system_name: name.to_owned(),
                    filename: filename.to_owned(),
                    start_line: 1,
                }),
            }],
            is_folded: false,
        })
    }

    fn bare_frame(address: u64, mapping: Option<Mapping>) -> EncodedLocation {
        EncodedLocation::from(&Location {
            address,
            mapping,
            lines: vec![],
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

    #[test]
    fn same_name_siblings_merge() {
        // Two distinct locations both resolving to "work" (different source
        // files, so different function identities) under the same parent.
        let parent = named_frame("main", "main.rs", 1);
        let work_a = named_frame("work", "a.rs", 2);
        let work_b = named_frame("work", "b.rs", 3);
        let leaf_a = named_frame("leaf_a", "a.rs", 4);
        let leaf_b = named_frame("leaf_b", "b.rs", 5);

        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(vec![leaf_a, work_a, parent.clone()], 3));
        builder.add_sample(&sample(vec![leaf_b, work_b, parent], 5));
        let (mut graph, tables) = builder.finish();

        let clamped = aggregate(&mut graph, &tables);
        assert_eq!(clamped, 0);
        assert_eq!(graph.total, 8);
        assert_eq!(graph.root_node().cumulative, 8);

        let main = &graph.nodes[graph.root_node().children[0] as usize];
        assert_eq!(main.children.len(), 1, "work siblings should merge");
        let work = &graph.nodes[main.children[0] as usize];
        assert_eq!(tables.function_name(work.function), "work");
        assert_eq!(work.cumulative, 8);
        assert_eq!(work.line, 0, "line slot is dropped on merge");
        // Concatenated grandchildren survive under the merged node.
        assert_eq!(work.children.len(), 2);
    }

    #[test]
    fn functionless_siblings_merge_by_address() {
        let mapping_a = Mapping {
            start: 0x1000,
            end: 0x2000,
            offset: 0,
            file: "/bin/a".to_owned(),
            build_id: "aaa".to_owned(),
        };
        let mapping_b = Mapping {
            file: "/bin/b".to_owned(),
            build_id: "bbb".to_owned(),
            ..mapping_a.clone()
        };
        let parent = named_frame("main", "main.rs", 1);
        // Same address, different mappings: distinct locations, equal under
        // the address fallback.
        let addr_a = bare_frame(0x40, Some(mapping_a));
        let addr_b = bare_frame(0x40, Some(mapping_b));

        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(vec![addr_a, parent.clone()], 2));
        builder.add_sample(&sample(vec![addr_b, parent], 4));
        let (mut graph, tables) = builder.finish();
        aggregate(&mut graph, &tables);

        let main = &graph.nodes[graph.root_node().children[0] as usize];
        assert_eq!(main.children.len(), 1);
        let merged = &graph.nodes[main.children[0] as usize];
        assert_eq!(merged.cumulative, 6);
        assert_eq!(merged.mapping, 0, "disagreeing mappings are nulled");
    }

    #[test]
    fn aggregation_preserves_root_cumulative() {
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        for (stack, value) in [
            (vec![named_frame("a", "x.rs", 1)], 2),
            (
                vec![named_frame("b", "x.rs", 2), named_frame("a", "x.rs", 1)],
                1,
            ),
            (
                vec![
                    named_frame("c", "x.rs", 3),
                    named_frame("b", "x.rs", 2),
                    named_frame("a", "x.rs", 1),
                ],
                3,
            ),
        ] {
            builder.add_sample(&sample(stack, value));
        }
        let (mut graph, tables) = builder.finish();
        let before = graph.root_node().cumulative;
        aggregate(&mut graph, &tables);
        assert_eq!(graph.root_node().cumulative, before);
        // A pure chain has no siblings to merge: structure is unchanged.
        assert_eq!(graph.nodes.len(), 4);
    }

    #[test]
    fn every_node_covers_its_children() {
        let parent = named_frame("main", "main.rs", 1);
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(
            vec![named_frame("work", "a.rs", 2), parent.clone()],
            3,
        ));
        builder.add_sample(&sample(
            vec![named_frame("work", "b.rs", 3), parent.clone()],
            4,
        ));
        builder.add_sample(&sample(vec![parent], 1));
        let (mut graph, tables) = builder.finish();
        aggregate(&mut graph, &tables);
        for node in &graph.nodes {
            let child_sum: i64 = node
                .children
                .iter()
                .map(|&c| graph.nodes[c as usize].cumulative)
                .sum();
            assert!(node.cumulative >= child_sum);
        }
    }

    #[test]
    fn inconsistent_cumulative_is_clamped() {
        let parent = named_frame("main", "main.rs", 1);
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(vec![named_frame("work", "a.rs", 2), parent], 3));
        let (mut graph, tables) = builder.finish();
        // Sabotage the parent's accounting.
        let main = graph.root_node().children[0];
        graph.nodes[main as usize].cumulative = 1;
        let clamped = aggregate(&mut graph, &tables);
        assert_eq!(clamped, 1);
        assert_eq!(graph.nodes[main as usize].cumulative, 3);
    }

    #[test]
    fn merged_arena_holds_no_orphans() {
        let parent = named_frame("main", "main.rs", 1);
        let mut builder = TreeBuilder::new(ValueUnit::Samples);
        builder.add_sample(&sample(
            vec![named_frame("work", "a.rs", 2), parent.clone()],
            1,
        ));
        builder.add_sample(&sample(vec![named_frame("work", "b.rs", 3), parent], 1));
        let (mut graph, tables) = builder.finish();
        let before = graph.nodes.len();
        aggregate(&mut graph, &tables);
        // root + main + merged work: the donor node is gone.
        assert_eq!(graph.nodes.len(), 3);
        assert!(graph.nodes.len() < before);
    }
}
