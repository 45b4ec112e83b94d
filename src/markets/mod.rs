pub mod registry;

pub use registry::{BinanceCatalogue, CatalogueSource, StaticCatalogue, SymbolRegistry};
