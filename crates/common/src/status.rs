//! Order status values.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The status of an order row.
///
/// State transitions:
/// ```text
/// Processing ──┬──► Success
///              ├──► RolledBack
///              └──► Unknown
/// ```
///
/// The store itself does not enforce the arrows: a rollback or completion
/// arriving late can overwrite a terminal value unless the caller asks for
/// a guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Order row exists and is waiting for a completion or rollback.
    #[default]
    Processing,

    /// Downstream fulfillment reported success (terminal).
    Success,

    /// Downstream fulfillment was rolled back (terminal).
    RolledBack,

    /// A rollback arrived without an explicit status (terminal).
    Unknown,
}

impl OrderStatus {
    /// Returns true once the order has left `Processing`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Processing)
    }

    /// Returns the status name as stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Processing => "Processing",
            OrderStatus::Success => "Success",
            OrderStatus::RolledBack => "RolledBack",
            OrderStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a stored or received status string is not a known status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown order status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for OrderStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Processing" => Ok(OrderStatus::Processing),
            "Success" => Ok(OrderStatus::Success),
            "RolledBack" => Ok(OrderStatus::RolledBack),
            "Unknown" => Ok(OrderStatus::Unknown),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
