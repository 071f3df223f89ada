use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_alternate_embedding_model")]
    pub alternate_embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_vector_store_address")]
    pub vector_store_address: String,
    #[serde(default = "default_namespace")]
    pub vector_store_namespace: String,
    #[serde(default = "default_database")]
    pub vector_store_database: String,
    #[serde(default = "default_collection")]
    pub vector_store_collection: String,
    #[serde(default = "default_tracking_db_path")]
    pub tracking_db_path: String,
    #[serde(default = "default_trace_dir")]
    pub trace_dir: String,
    #[serde(default = "default_graph_dir")]
    pub graph_dir: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_alternate_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_vector_store_address() -> String {
    "rocksdb://./data/vector-store".to_string()
}

fn default_namespace() -> String {
    "rag".to_string()
}

fn default_database() -> String {
    "rag".to_string()
}

fn default_collection() -> String {
    "chunk_embedding".to_string()
}

fn default_tracking_db_path() -> String {
    "./data/tracking.db".to_string()
}

fn default_trace_dir() -> String {
    "./logs".to_string()
}

fn default_graph_dir() -> String {
    "./session_graph".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_top_k() -> usize {
    5
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: "test-key".to_string(),
            openai_base_url: default_base_url(),
            generation_model: default_generation_model(),
            embedding_model: default_embedding_model(),
            alternate_embedding_model: default_alternate_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            vector_store_address: "mem://".to_string(),
            vector_store_namespace: default_namespace(),
            vector_store_database: default_database(),
            vector_store_collection: default_collection(),
            tracking_db_path: ":memory:".to_string(),
            trace_dir: default_trace_dir(),
            graph_dir: default_graph_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            retrieval_top_k: default_top_k(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}
