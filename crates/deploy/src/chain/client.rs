//! [`ChainClient`] backed by a JSON-RPC endpoint and a local key.

use std::time::Duration;

use alloy_core::primitives::{Address, TxHash, U64, U256};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    ChainClient, LegacyTransaction, LocalSigner, Receipt, SentTransaction, TransactionError,
    TransactionRequest, TransactionState,
};
use crate::rpc::{self, RpcError};

/// Gas estimates are scaled by this percentage before signing.
const GAS_LIMIT_MULTIPLIER_PERCENT: u64 = 120;

/// Gas price of a replacement, relative to the transaction it replaces.
const REPLACEMENT_BUMP_PERMILLE: u128 = 1125;

/// Receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: TxHash,
    contract_address: Option<Address>,
    /// Absent on pre-Byzantium chains.
    status: Option<U64>,
    block_number: U64,
    gas_used: U64,
}

impl From<RpcReceipt> for Receipt {
    fn from(receipt: RpcReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            contract_address: receipt.contract_address,
            success: receipt.status.is_none_or(|status| status == U64::from(1)),
            block_number: receipt.block_number.to(),
            gas_used: receipt.gas_used.to(),
        }
    }
}

/// Sends legacy transactions signed by a local key through a JSON-RPC node.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    http: reqwest::Client,
    url: String,
    signer: LocalSigner,
    chain_id: u64,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl RpcChainClient {
    /// Connect to `url` and check that it serves `expected_chain_id`.
    pub async fn connect(
        url: &str,
        signer: LocalSigner,
        expected_chain_id: Option<u64>,
        confirmation_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = rpc::create_client()?;

        let chain_id: U64 = rpc::json_rpc_call(&http, url, "eth_chainId", vec![])
            .await
            .with_context(|| format!("Failed to query chain id from {}", url))?;
        let chain_id = chain_id.to::<u64>();

        if let Some(expected) = expected_chain_id.filter(|expected| *expected != chain_id) {
            anyhow::bail!(
                "RPC endpoint {} serves chain {}, but the network is configured for chain {}",
                url,
                chain_id,
                expected
            );
        }

        tracing::debug!(url, chain_id, sender = %signer.address(), "Connected to RPC endpoint");

        Ok(Self {
            http,
            url: url.to_string(),
            signer,
            chain_id,
            confirmation_timeout,
            poll_interval: rpc::DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn sender(&self) -> Address {
        self.signer.address()
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        rpc::json_rpc_call(&self.http, &self.url, method, params).await
    }

    async fn estimate_gas(&self, request: &TransactionRequest) -> Result<u64, TransactionError> {
        let mut tx = json!({
            "from": self.signer.address(),
            "data": request.data,
        });
        if let Some(to) = request.to {
            tx["to"] = json!(to);
        }

        let estimate: U64 = self
            .call("eth_estimateGas", vec![tx])
            .await
            .map_err(|e| {
                if e.is_revert() {
                    TransactionError::Reverted {
                        tx_hash: None,
                        reason: e.to_string(),
                    }
                } else {
                    TransactionError::Rejected(format!("gas estimation failed: {}", e))
                }
            })?;

        Ok(estimate.to::<u64>() * GAS_LIMIT_MULTIPLIER_PERCENT / 100)
    }

    async fn gas_price(&self) -> Result<u128, TransactionError> {
        let gas_price: U256 = self
            .call("eth_gasPrice", vec![])
            .await
            .map_err(rejected("failed to fetch gas price"))?;
        Ok(gas_price.saturating_to())
    }

    async fn sign_and_send(
        &self,
        request: TransactionRequest,
        nonce: u64,
        gas_price: u128,
    ) -> Result<SentTransaction, TransactionError> {
        let gas_limit = self.estimate_gas(&request).await?;

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: request.to,
            value: U256::ZERO,
            data: request.data,
            chain_id: self.chain_id,
        };

        let raw = self
            .signer
            .sign(&tx)
            .map_err(|e| TransactionError::Rejected(format!("{:#}", e)))?;

        let tx_hash: TxHash = self
            .call("eth_sendRawTransaction", vec![json!(raw)])
            .await
            .map_err(rejected("node refused transaction"))?;

        tracing::debug!(
            %tx_hash,
            nonce,
            gas_price,
            gas_limit,
            create = tx.to.is_none(),
            "Transaction broadcast"
        );

        Ok(SentTransaction {
            tx_hash,
            nonce,
            gas_price,
        })
    }
}

fn rejected(context: &str) -> impl FnOnce(RpcError) -> TransactionError + '_ {
    move |e| TransactionError::Rejected(format!("{}: {}", context, e))
}

/// Gas price for a replacement of a transaction priced at `previous`.
///
/// Nodes only accept a replacement paying at least 10% more, so the previous price is
/// bumped by 12.5% and the current network price is used when higher.
fn replacement_gas_price(previous: u128, network: u128) -> u128 {
    let bumped = previous.saturating_mul(REPLACEMENT_BUMP_PERMILLE) / 1000 + 1;
    bumped.max(network)
}

impl ChainClient for RpcChainClient {
    async fn submit(&self, request: TransactionRequest) -> Result<SentTransaction, TransactionError> {
        let nonce: U64 = self
            .call(
                "eth_getTransactionCount",
                vec![json!(self.signer.address()), json!("pending")],
            )
            .await
            .map_err(rejected("failed to fetch nonce"))?;

        let gas_price = self.gas_price().await?;
        self.sign_and_send(request, nonce.to(), gas_price).await
    }

    async fn replace(
        &self,
        request: TransactionRequest,
        previous: &SentTransaction,
    ) -> Result<SentTransaction, TransactionError> {
        let gas_price = replacement_gas_price(previous.gas_price, self.gas_price().await?);
        tracing::debug!(
            replaced = %previous.tx_hash,
            nonce = previous.nonce,
            previous_gas_price = previous.gas_price,
            gas_price,
            "Replacing pending transaction"
        );

        self.sign_and_send(request, previous.nonce, gas_price).await
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<Receipt, TransactionError> {
        let receipt = rpc::poll_until(
            &format!("receipt of {}", tx_hash),
            self.confirmation_timeout,
            self.poll_interval,
            move || async move {
                let receipt: Option<RpcReceipt> = self
                    .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
                    .await?;
                Ok(receipt)
            },
        )
        .await
        .ok_or(TransactionError::ConfirmationTimeout { tx_hash })?;

        Ok(receipt.into())
    }

    async fn transaction_state(
        &self,
        sent: &SentTransaction,
    ) -> Result<TransactionState, TransactionError> {
        let tx_hash = json!(sent.tx_hash);

        let receipt: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", vec![tx_hash.clone()])
            .await
            .map_err(rejected("failed to fetch receipt"))?;
        if let Some(receipt) = receipt {
            return Ok(TransactionState::Mined(receipt.into()));
        }

        let known: Option<Value> = self
            .call("eth_getTransactionByHash", vec![tx_hash])
            .await
            .map_err(rejected("failed to fetch transaction"))?;
        if known.is_some() {
            return Ok(TransactionState::Pending);
        }

        let mined_nonce: U64 = self
            .call(
                "eth_getTransactionCount",
                vec![json!(self.signer.address()), json!("latest")],
            )
            .await
            .map_err(rejected("failed to fetch nonce"))?;

        Ok(if mined_nonce.to::<u64>() > sent.nonce {
            TransactionState::Replaced
        } else {
            TransactionState::Dropped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_decoding() {
        let raw = json!({
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "status": "0x1",
            "blockNumber": "0x10",
            "gasUsed": "0x5208",
            "logs": []
        });

        let receipt: Receipt = serde_json::from_value::<RpcReceipt>(raw).unwrap().into();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(
            receipt.contract_address,
            Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap())
        );
    }

    #[test]
    fn test_reverted_receipt() {
        let raw = json!({
            "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "contractAddress": null,
            "status": "0x0",
            "blockNumber": "0x1",
            "gasUsed": "0x1"
        });

        let receipt: Receipt = serde_json::from_value::<RpcReceipt>(raw).unwrap().into();
        assert!(!receipt.success);
        assert_eq!(receipt.contract_address, None);
    }

    #[test]
    fn test_replacement_outbids_previous_price() {
        // 10 gwei bumped by 12.5%, well above a quiet network.
        assert_eq!(
            replacement_gas_price(10_000_000_000, 1_000_000_000),
            11_250_000_001
        );
        // A busier network wins over the bump.
        assert_eq!(
            replacement_gas_price(10_000_000_000, 20_000_000_000),
            20_000_000_000
        );
        assert!(replacement_gas_price(0, 0) > 0);
    }
}
