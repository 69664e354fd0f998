//! Chain client against a node's JSON API.

use async_trait::async_trait;
use rentio_core::{
    ChainClient, ConsensusState, Currency, RentError, Result, Transaction, WalletInfo,
};

pub struct HttpChainClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChainClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RentError::Host(format!("node request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(RentError::Host(format!(
                "node returned {} for {}",
                response.status(),
                path
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RentError::Host(format!("invalid node response: {e}")))
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn consensus_state(&self) -> Result<ConsensusState> {
        self.get_json("/consensus/state").await
    }

    async fn syncer_peers(&self) -> Result<Vec<String>> {
        self.get_json("/syncer/peers").await
    }

    async fn recommended_fee(&self) -> Result<Currency> {
        self.get_json("/txpool/recommendedfee").await
    }

    async fn wallet(&self) -> Result<WalletInfo> {
        self.get_json("/wallet").await
    }

    async fn broadcast_transaction(&self, txn: Transaction) -> Result<()> {
        let url = format!("{}/txpool/broadcast", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&txn)
            .send()
            .await
            .map_err(|e| RentError::Host(format!("broadcast failed: {e}")))?;
        if !response.status().is_success() {
            return Err(RentError::Host(format!(
                "broadcast rejected with {}",
                response.status()
            )));
        }
        Ok(())
    }
}
