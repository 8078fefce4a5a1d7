use std::net::Ipv4Addr;

use advmac::MacAddr6;
use compact_str::CompactString;

/// Errors raised by a [`LeaseRepository`](crate::repository::LeaseRepository) backend.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("lease file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lease file encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lease backend unavailable: {0}")]
    Unavailable(String),
}

/// Why a binding could not be produced for a client.
///
/// Every variant is reported back to the processor that asked for the
/// binding; the processor omits the binding from its reply and logs the
/// failure. None of these are fatal to the worker.
#[derive(Debug, thiserror::Error)]
pub enum AllocationFailure {
    /// Every address in the link's pools is claimed, quarantined or reserved.
    #[error("no free address left on link {0}")]
    PoolExhausted(CompactString),

    /// The client asked for an address that is outside the link's pools or
    /// currently quarantined after a DECLINE.
    #[error("requested address {0} is not available on this link")]
    RequestedAddressUnavailable(Ipv4Addr),

    /// The client asked for an address that is leased to somebody else.
    #[error("requested address {address} is leased to {owner}")]
    RequestedAddressConflict { address: Ipv4Addr, owner: MacAddr6 },

    /// The operation needs an existing binding and the client has none.
    #[error("client has no current binding")]
    NoBinding,

    /// The lease repository failed; the in-memory state was rolled back.
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(#[from] RepositoryError),
}

impl AllocationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationFailure::PoolExhausted(_) => "PoolExhausted",
            AllocationFailure::RequestedAddressUnavailable(_) => "RequestedAddressUnavailable",
            AllocationFailure::RequestedAddressConflict { .. } => "RequestedAddressConflict",
            AllocationFailure::NoBinding => "NoBinding",
            AllocationFailure::StoreUnavailable(_) => "StoreUnavailable",
        }
    }
}

/// Errors while loading or validating the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
