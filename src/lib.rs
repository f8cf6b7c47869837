pub mod catalog;
pub mod cli;
pub mod config;
pub mod embed;
pub mod error;
pub mod index;
mod metrics;
pub mod pipeline;
pub mod ranker;
mod server;
pub mod store;
pub mod utils;

pub use catalog::{Catalog, Manifest};
pub use config::Opts;
pub use embed::{Embedder, EmbedderSpec, GridEmbedder};
pub use error::RetrievalError;
pub use index::{FlatIndex, HnswIndex, IndexKind, Neighbor, VectorIndex};
pub use pipeline::{Match, QueryOptions, QueryPipeline, QueryResult, RankMode, ScoreKind};
pub use store::{FeatureStore, FeatureStoreBuilder};
