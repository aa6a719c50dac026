// =============================================================================
// Persistence — keyed blob store and relational adapter
// =============================================================================

pub mod blob;
pub mod relational;

pub use blob::BlobStore;
pub use relational::RelationalStore;
