//! Fragment embeddings: encoders, the on-disk store and the in-memory
//! vector index.

pub mod encoder;
pub mod index;
pub mod store;

pub use encoder::{build_encoder, cosine_similarity, FragmentEncoder, HashEncoder};
pub use index::{max_per_post, max_scalar, similarity_matrix, snapshot, IndexEntry, IndexSnapshot};
pub use store::{fragment_text, EmbeddingStore};
