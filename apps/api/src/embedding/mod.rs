//! Embedding pipeline: structured document sections → classified, embedded chunks.

pub mod chunker;
pub mod classify;
pub mod embedder;
pub mod pipeline;

pub use embedder::{embedder_from_settings, Embedder, HashingEmbedder};
pub use pipeline::{CoverageWarning, EmbeddingPipeline, PipelineOutput};
