pub mod batch;
pub mod identity;
pub mod selector;

pub use batch::{create_chunk_splits, list_batches, CacheBatch, ChunkFiles, ChunkProgress};
pub use identity::{fingerprint, matches, CacheIdentity};
pub use selector::{select_or_create, CachePolicy};
