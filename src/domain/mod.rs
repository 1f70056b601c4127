//! Domain layer types and invariants.

pub mod error;
pub mod resource;

pub use error::{BackendError, CacheError, SinkFailure};
pub use resource::{Cacheable, ResourceId, ResourceIdParseError, ResourceSnapshot};
