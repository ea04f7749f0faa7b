pub mod aggregate;
pub mod report;
pub mod table;
pub mod tree;
pub mod trim;

pub use aggregate::aggregate;
pub use report::{FlamegraphReport, ReportOptions, flamegraph_report, table_report};
pub use table::{TableBuilder, TableReport, TableRow};
pub use tree::{Flamegraph, Node, ROOT, TreeBuilder};
pub use trim::{Trimmed, trim};
