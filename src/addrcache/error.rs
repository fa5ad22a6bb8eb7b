//! Address cache error types.

use ipnetwork::IpNetworkError;
use thiserror::Error;

/// Errors returned for malformed address cache input.
#[derive(Debug, Error)]
pub enum AddrCacheError {
    /// Address and prefix length do not form a valid block.
    #[error("Invalid address block: {0}")]
    InvalidNetwork(#[from] IpNetworkError),
}
