//! Host transport over a gateway's JSON API.
//!
//! The framed, session-encrypted host protocol lives in a separate gateway
//! process; this adapter speaks plain JSON to it. Swapping in a native
//! codec means providing another `HostTransport` implementation.

use async_trait::async_trait;
use rentio_core::{
    ContractFormation, Currency, FileContractId, Hash256, HostSettings, HostTransport, Payment,
    PriceTable, PublicKey, RentError, Result, Revision,
};
use serde::{Deserialize, Serialize};

pub struct GatewayHostTransport {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct HostRequest<'a, T: Serialize> {
    host: PublicKey,
    addr: &'a str,
    #[serde(flatten)]
    body: T,
}

impl GatewayHostTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        host: PublicKey,
        addr: &str,
        body: T,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&HostRequest { host, addr, body })
            .send()
            .await
            .map_err(|e| RentError::Host(format!("gateway request failed: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(RentError::BalanceInsufficient);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RentError::Host(format!(
                "gateway returned {status} for {path}: {detail}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RentError::Host(format!("invalid gateway response: {e}")))
    }
}

#[derive(Serialize)]
struct ReadSectorBody {
    root: Hash256,
    offset: u32,
    length: u32,
    payment: Payment,
}

#[derive(Deserialize)]
struct ReadSectorResponse {
    #[serde(with = "hex::serde")]
    data: Vec<u8>,
    proof: Vec<Hash256>,
}

#[derive(Serialize)]
struct AppendSectorBody<'a> {
    contract_id: FileContractId,
    #[serde(with = "hex::serde")]
    sector: &'a [u8],
    payment: Payment,
}

#[async_trait]
impl HostTransport for GatewayHostTransport {
    async fn update_price_table(
        &self,
        host: PublicKey,
        addr: &str,
        payment: Option<Payment>,
    ) -> Result<PriceTable> {
        #[derive(Serialize)]
        struct Body {
            payment: Option<Payment>,
        }
        self.post("/rhp/pricetable", host, addr, Body { payment })
            .await
    }

    async fn account_balance(
        &self,
        host: PublicKey,
        addr: &str,
        account: PublicKey,
        payment: Payment,
    ) -> Result<Currency> {
        #[derive(Serialize)]
        struct Body {
            account: PublicKey,
            payment: Payment,
        }
        self.post("/rhp/accountbalance", host, addr, Body { account, payment })
            .await
    }

    async fn fund_account(
        &self,
        host: PublicKey,
        addr: &str,
        account: PublicKey,
        amount: Currency,
        payment: Payment,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Body {
            account: PublicKey,
            amount: Currency,
            payment: Payment,
        }
        self.post(
            "/rhp/fundaccount",
            host,
            addr,
            Body {
                account,
                amount,
                payment,
            },
        )
        .await
    }

    async fn latest_revision(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
    ) -> Result<Revision> {
        #[derive(Serialize)]
        struct Body {
            contract_id: FileContractId,
        }
        self.post("/rhp/latestrevision", host, addr, Body { contract_id })
            .await
    }

    async fn read_sector(
        &self,
        host: PublicKey,
        addr: &str,
        root: Hash256,
        offset: u32,
        length: u32,
        payment: Payment,
    ) -> Result<(Vec<u8>, Vec<Hash256>)> {
        let response: ReadSectorResponse = self
            .post(
                "/rhp/readsector",
                host,
                addr,
                ReadSectorBody {
                    root,
                    offset,
                    length,
                    payment,
                },
            )
            .await?;
        Ok((response.data, response.proof))
    }

    async fn append_sector(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
        sector: &[u8],
        payment: Payment,
    ) -> Result<Hash256> {
        self.post(
            "/rhp/appendsector",
            host,
            addr,
            AppendSectorBody {
                contract_id,
                sector,
                payment,
            },
        )
        .await
    }

    async fn delete_sectors(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
        roots: &[Hash256],
        payment: Payment,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            contract_id: FileContractId,
            roots: &'a [Hash256],
            payment: Payment,
        }
        self.post(
            "/rhp/deletesectors",
            host,
            addr,
            Body {
                contract_id,
                roots,
                payment,
            },
        )
        .await
    }

    async fn form_contract(
        &self,
        host: PublicKey,
        addr: &str,
        renter_funds: Currency,
        end_height: u64,
    ) -> Result<ContractFormation> {
        #[derive(Serialize)]
        struct Body {
            renter_funds: Currency,
            end_height: u64,
        }
        #[derive(Deserialize)]
        struct Response {
            contract_id: FileContractId,
            total_cost: Currency,
            window_start: u64,
            window_end: u64,
        }
        let r: Response = self
            .post(
                "/rhp/form",
                host,
                addr,
                Body {
                    renter_funds,
                    end_height,
                },
            )
            .await?;
        Ok(ContractFormation {
            contract_id: r.contract_id,
            total_cost: r.total_cost,
            window_start: r.window_start,
            window_end: r.window_end,
        })
    }

    async fn renew_contract(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
        renter_funds: Currency,
        end_height: u64,
    ) -> Result<ContractFormation> {
        #[derive(Serialize)]
        struct Body {
            contract_id: FileContractId,
            renter_funds: Currency,
            end_height: u64,
        }
        #[derive(Deserialize)]
        struct Response {
            contract_id: FileContractId,
            total_cost: Currency,
            window_start: u64,
            window_end: u64,
        }
        let r: Response = self
            .post(
                "/rhp/renew",
                host,
                addr,
                Body {
                    contract_id,
                    renter_funds,
                    end_height,
                },
            )
            .await?;
        Ok(ContractFormation {
            contract_id: r.contract_id,
            total_cost: r.total_cost,
            window_start: r.window_start,
            window_end: r.window_end,
        })
    }

    async fn scan(&self, host: PublicKey, addr: &str) -> Result<(HostSettings, PriceTable)> {
        #[derive(Serialize)]
        struct Body {}
        #[derive(Deserialize)]
        struct Response {
            settings: HostSettings,
            price_table: PriceTable,
        }
        let r: Response = self.post("/rhp/scan", host, addr, Body {}).await?;
        Ok((r.settings, r.price_table))
    }
}
