pub mod optimize;
pub mod pipeline;
pub mod rerank;
pub mod response;

pub use optimize::{OptimizationPipeline, OptimizationReport};
pub use pipeline::{
    AskOutcome, AskRequest, RetrievalConfig, RetrievalPipeline, RetrievalServices, RetrievalState,
};
pub use rerank::{rerank_hits, RankedChunk};
pub use response::RagResponse;
