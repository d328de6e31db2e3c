//! Result type alias for LanSync operations

use crate::Error;

/// Result type alias for LanSync operations
pub type Result<T> = std::result::Result<T, Error>;
