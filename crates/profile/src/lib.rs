pub mod codec;
pub mod dedup;
pub mod model;
pub mod symbolize;

pub use codec::DecodeError;
pub use dedup::DedupTables;
pub use model::{EncodedLocation, Function, Line, Location, Mapping, Sample, ValueUnit};
pub use symbolize::{NoopSymbolizer, Symbolizer};
