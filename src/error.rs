//! Crate-wide error taxonomy.
//!
//! Mirrors the propagation policy: convergence-layer parse errors are local
//! counters and never reach here; storage I/O errors and LTP session
//! outcomes do, at the boundaries that own them.

use thiserror::Error;

/// C1 segment allocator errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("segment allocator is full")]
    Full,
    #[error("segment {0} was already free")]
    DoubleFree(u32),
    #[error("segment id {0} is out of range")]
    OutOfRange(u32),
    #[error("segment bitmap snapshot is corrupt or the wrong size: {0}")]
    SnapshotCorrupt(String),
}

/// C2 catalog errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("custody id {0} not found in catalog")]
    NotFound(u64),
    #[error("custody id {0} already present in catalog")]
    AlreadyPresent(u64),
}

/// C3 storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("disk I/O failure on store file {store_index}: {source}")]
    DiskIo {
        store_index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("storage capacity exhausted, backpressure engaged")]
    CapacityExhausted,
    #[error("allocator error while writing bundle: {0}")]
    Allocator(#[from] AllocatorError),
    #[error("store file {0} is degraded (writes suspended)")]
    Degraded(usize),
}

/// C4 LTP session errors / termination reasons.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtpSessionTerminationReason {
    /// `RLEXC` in the wire protocol: retransmission limit exceeded.
    #[error("retransmission limit exceeded")]
    RetransmitLimitExceeded,
    /// No progress for `session_inactivity`.
    #[error("session timed out with no progress")]
    Timeout,
    /// Peer sent a cancel segment.
    #[error("cancelled by peer: {0}")]
    CancelledByPeer(u8),
    /// Local shutdown requested termination.
    #[error("cancelled locally")]
    CancelledLocally,
}

#[derive(Error, Debug)]
pub enum LtpError {
    #[error("malformed LTP segment: {0}")]
    MalformedSegment(&'static str),
    #[error("session {0:?} terminated: {1}")]
    SessionTerminated(crate::ltp::SessionId, LtpSessionTerminationReason),
    #[error("session {0:?} not found")]
    UnknownSession(crate::ltp::SessionId),
}

/// Bundle codec errors (BPv6/BPv7/CTEB).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleCodecError {
    #[error("malformed bundle: {0}")]
    MalformedBundle(&'static str),
    #[error("unsupported bundle protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("field truncated while parsing {0}")]
    TruncatedField(&'static str),
    #[error("SDNV value overflowed u64")]
    SdnvOverflow,
}

/// C6 dispatcher errors.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("ingress queue is full, backpressure engaged")]
    Backpressure,
    #[error("no outduct/contact available for destination")]
    NoRoute,
    #[error("outduct rejected the bundle")]
    OutductFailed,
    #[error("accepted bytes did not parse as a bundle: {0}")]
    MalformedBundle(#[from] BundleCodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Startup-only configuration errors. Fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("config field {0} is invalid: {1}")]
    Invalid(&'static str, String),
}

/// Top-level error type for operations that can fail for more than one
/// component-local reason (primarily the dispatcher).
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Ltp(#[from] LtpError),
    #[error(transparent)]
    BundleCodec(#[from] BundleCodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("shutdown requested")]
    ShutdownRequested,
}
