pub const CHUNK_SIZE: usize = 500;
pub const CHUNK_OVERLAP: usize = 50;

pub const TOP_K: usize = 5;
pub const THRESHOLD: f32 = 0.1;
pub const MMR_LAMBDA: f32 = 0.5;
pub const RECENCY_WEIGHT: f32 = 0.2;
pub const RECENCY_OVERSAMPLE: usize = 2;

pub const STORE_PATH: &str = "store.json";

pub const POSTGRES_HOST: &str = "localhost";
pub const POSTGRES_PORT: u16 = 5432;
pub const POSTGRES_SSLMODE: &str = "disable";
pub const POSTGRES_TABLE: &str = "documents";

pub const API_BASE_URL: &str = "https://api.openai.com/v1";
pub const EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const HTTP_TIMEOUT_SECS: u64 = 60;
