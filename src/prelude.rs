//! Convenience re-exports for embedding applications.
//!
//! ```rust
//! use switchyard::prelude::*;
//! ```

pub use crate::config::{Config, ConfigError};
pub use crate::error::{ErrorKind, RelayError, UpstreamError};
pub use crate::fabric::{Fabric, FabricBuilder, HealthSnapshot};
pub use crate::request::{
    CacheSource, InferenceRequest, Message, Priority, RequestMetadata, ResponseEnvelope,
    Target, UpstreamResponse,
};
pub use crate::time::Deadline;
pub use crate::upstream::{UpstreamCall, UpstreamClient};
