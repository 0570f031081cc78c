//! Run-length mask codec and annotation index for object-detection and
//! instance-segmentation benchmarks.

pub mod error;
pub mod mask;
pub mod store;
pub mod types;

pub use error::Error;
pub use store::AnnotationStore;
pub use types::{Annotation, Category, Dataset, Image, Rle, Segmentation};
