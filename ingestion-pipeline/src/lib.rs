pub mod chunking;
pub mod classify;
pub mod metadata;
pub mod normalize;
pub mod pipeline;
pub mod table;

pub use pipeline::{
    IngestionConfig, IngestionInput, IngestionPipeline, IngestionReport, IngestionRequest,
    IngestionServices,
};
pub use table::{ingest_table, TableIngestionReport, TableIngestionSpec};
