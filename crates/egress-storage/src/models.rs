//! Row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of `blocked_hosts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedHost {
    /// Normalised pattern text.
    pub host_name: String,
    /// When the row was inserted.
    pub added_on: DateTime<Utc>,
}
