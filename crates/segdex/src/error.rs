use thiserror::Error;

/// The main error type for segdex operations.
///
/// All failures surface to the caller; the crate performs no retries because
/// every operation is a deterministic computation over in-memory data.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse dataset JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input at load time: a dangling `image_id`/`category_id`
    /// reference, a crowd annotation without an RLE, or misshapen numeric
    /// detection rows. Raised before any index is built.
    #[error("invalid dataset: {0}")]
    Validation(String),

    #[error("no annotation with id {0}")]
    AnnotationNotFound(u64),

    #[error("no image with id {0}")]
    ImageNotFound(u64),

    #[error("no category with id {0}")]
    CategoryNotFound(u64),

    /// RLE operations received masks whose height/width disagree, or a
    /// buffer/run sequence whose size does not match its declared dimensions.
    #[error("mask dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A query requiring the inverted indices ran before `create_index`.
    #[error("indices not built; call create_index() first")]
    NotIndexed,
}
