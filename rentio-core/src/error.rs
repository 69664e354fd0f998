use crate::types::PublicKey;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RentError>;

/// Why a host cannot currently be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnusableReason {
    Blocked,
    Offline,
    LowScore,
    RedundantIp,
    Gouging,
    NotAcceptingContracts,
    NotAnnounced,
    NotCompletingScan,
    Unknown,
}

impl fmt::Display for UnusableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnusableReason::Blocked => "host is blocked",
            UnusableReason::Offline => "host is offline",
            UnusableReason::LowScore => "host's score is below minimum",
            UnusableReason::RedundantIp => "host has redundant IP",
            UnusableReason::Gouging => "host is price gouging",
            UnusableReason::NotAcceptingContracts => "host is not accepting contracts",
            UnusableReason::NotAnnounced => "host is not announced",
            UnusableReason::NotCompletingScan => "host is not completing scan",
            UnusableReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RentError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("host unusable: {0}")]
    Unusable(UnusableReason),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("ephemeral account balance was insufficient")]
    BalanceInsufficient,

    #[error("deposit exceeds maximum ephemeral account balance")]
    BalanceLimitExceeded,

    #[error("{0} timed out")]
    Timeout(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("host error: {0}")]
    Host(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    HostSet(#[from] HostErrorSet),
}

impl RentError {
    /// True for failures worth retrying against another host.
    pub fn is_transient(&self) -> bool {
        matches!(self, RentError::Host(_) | RentError::Timeout(_))
    }
}

/// A single host's failure, tagged with its public key.
#[derive(Debug, Error)]
#[error("host {host}: {err}")]
pub struct HostError {
    pub host: PublicKey,
    #[source]
    pub err: RentError,
}

/// Per-shard failures aggregated over a slab operation.
#[derive(Debug, Default)]
pub struct HostErrorSet(pub Vec<HostError>);

impl std::error::Error for HostErrorSet {}

impl HostErrorSet {
    pub fn push(&mut self, host: PublicKey, err: RentError) {
        self.0.push(HostError { host, err });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HostErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} host errors:", self.0.len())?;
        for he in &self.0 {
            writeln!(f, "  {}: {}", he.host, he.err)?;
        }
        Ok(())
    }
}
