//! The read/submit interface to the blockchain node.
//!
//! The node itself (consensus, transaction pool, wallet, syncer) is an
//! external collaborator; the core only consumes this small surface.

use crate::error::Result;
use crate::types::Currency;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConsensusState {
    pub block_height: u64,
    pub synced: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    pub confirmed: Currency,
    pub unconfirmed: Currency,
}

impl WalletInfo {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_zero() && self.unconfirmed.is_zero()
    }
}

/// An opaque signed transaction handed to the node for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction(pub serde_json::Value);

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn consensus_state(&self) -> Result<ConsensusState>;
    async fn syncer_peers(&self) -> Result<Vec<String>>;
    async fn recommended_fee(&self) -> Result<Currency>;
    async fn wallet(&self) -> Result<WalletInfo>;
    async fn broadcast_transaction(&self, txn: Transaction) -> Result<()>;
}
