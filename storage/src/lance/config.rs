//! Configuration for [`LanceBackend`](super::LanceBackend).

/// Settings for the LanceDB backend.
///
/// | Field | Description |
/// |-------|-------------|
/// | `db_path` | LanceDB database directory |
/// | `embedding_dim` | Fixed length of stored vectors |
/// | `vector_index_name` | Name of the ANN index on the message vector column |
/// | `index_min_rows` | Vectored rows required before the ANN index is trained |
/// | `use_exact_search` | Skip the index and scan (exact results, slower at scale) |
/// | `nprobes` | IVF partitions to probe; `None` keeps the Lance default |
#[derive(Debug, Clone)]
pub struct LanceConfig {
    pub db_path: String,
    pub embedding_dim: usize,
    pub vector_index_name: String,
    pub index_min_rows: usize,
    pub use_exact_search: bool,
    pub nprobes: Option<usize>,
}

impl Default for LanceConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/lancedb".to_string(),
            embedding_dim: 1536, // OpenAI text-embedding-3-small
            vector_index_name: "message_embedding_index".to_string(),
            index_min_rows: 256,
            use_exact_search: false,
            nprobes: None,
        }
    }
}
