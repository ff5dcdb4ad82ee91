//! Transaction submission.
//!
//! The orchestrator needs four things from a chain: broadcast a transaction, replace a
//! stuck one without spending a new nonce, wait for confirmation, and find out what became
//! of a transaction broadcast by an earlier run. [`ChainClient`] captures exactly that, so
//! the orchestrator can run against a real node ([`RpcChainClient`]) or an in-process fake.

mod client;
mod signer;

use std::future::Future;

use alloy_core::primitives::{Address, Bytes, TxHash};

pub use client::RpcChainClient;
pub use signer::{LegacyTransaction, LocalSigner};

/// A transaction to broadcast. `to == None` creates a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub to: Option<Address>,
    pub data: Bytes,
}

impl TransactionRequest {
    /// Contract creation with the given initcode (bytecode followed by constructor arguments).
    pub fn deploy(initcode: Bytes) -> Self {
        Self {
            to: None,
            data: initcode,
        }
    }

    pub fn call(to: Address, data: Bytes) -> Self {
        Self { to: Some(to), data }
    }

    pub fn is_deployment(&self) -> bool {
        self.to.is_none()
    }
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    /// Address of the created contract, for deployments.
    pub contract_address: Option<Address>,
    /// `false` when the EVM reverted the transaction.
    pub success: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// A broadcast transaction. Two transactions sharing a nonce can never both be mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentTransaction {
    pub tx_hash: TxHash,
    pub nonce: u64,
    pub gas_price: u128,
}

/// What the node knows about a transaction broadcast earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Mined(Receipt),
    /// Known to the node, not mined yet.
    Pending,
    /// Unknown to the node and its nonce is still unused: it can no longer be mined.
    Dropped,
    /// Unknown to the node and its nonce was consumed by another transaction.
    Replaced,
}

/// Reasons a transaction did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The node or the network refused the transaction (underpriced, bad nonce, unreachable).
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The transaction was executed (or simulated) and the contract logic reverted.
    #[error("transaction reverted: {reason}")]
    Reverted {
        tx_hash: Option<TxHash>,
        reason: String,
    },

    /// The transaction was broadcast but no receipt appeared in time.
    #[error("transaction {tx_hash} was not confirmed in time")]
    ConfirmationTimeout { tx_hash: TxHash },
}

/// Submission channel to one network.
pub trait ChainClient: Send + Sync {
    /// Sign and broadcast a transaction with the next free nonce.
    fn submit(
        &self,
        request: TransactionRequest,
    ) -> impl Future<Output = Result<SentTransaction, TransactionError>> + Send;

    /// Broadcast `request` again with the nonce of `previous` and a higher gas price, so
    /// that at most one of the two is ever mined.
    fn replace(
        &self,
        request: TransactionRequest,
        previous: &SentTransaction,
    ) -> impl Future<Output = Result<SentTransaction, TransactionError>> + Send;

    /// Wait until the transaction is mined.
    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<Receipt, TransactionError>> + Send;

    /// Current state of a transaction broadcast earlier.
    fn transaction_state(
        &self,
        sent: &SentTransaction,
    ) -> impl Future<Output = Result<TransactionState, TransactionError>> + Send;
}
