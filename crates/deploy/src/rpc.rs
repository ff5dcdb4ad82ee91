//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between polling attempts when waiting for a condition.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// JSON-RPC error code used by geth-compatible nodes for reverted executions.
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Errors returned by [`json_rpc_call`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to send {method} request: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("RPC error {code}: {message}")]
    Response {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("failed to decode {method} result: {reason}")]
    Decode { method: String, reason: String },
}

impl RpcError {
    /// Whether the node executed the request and the EVM reverted.
    pub fn is_revert(&self) -> bool {
        match self {
            Self::Response { code, message, .. } => {
                *code == EXECUTION_REVERTED_CODE || message.to_lowercase().contains("revert")
            }
            _ => false,
        }
    }
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let transport = |source| RpcError::Transport {
        method: method.to_string(),
        source,
    };

    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(transport)?;

    let result: Value = response.json().await.map_err(transport)?;

    if let Some(error) = result.get("error") {
        return Err(RpcError::Response {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            data: error.get("data").cloned(),
        });
    }

    let result_value = result.get("result").cloned().ok_or_else(|| RpcError::Decode {
        method: method.to_string(),
        reason: "no result in response".to_string(),
    })?;

    serde_json::from_value(result_value).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Poll `check_fn` until it yields a value or `timeout` elapses.
///
/// Errors returned by `check_fn` are logged and retried.
///
/// # Returns
/// The first value produced, or `None` after timeout.
pub async fn poll_until<T, F, Fut>(
    name: &str,
    timeout: Duration,
    interval: Duration,
    check_fn: F,
) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, anyhow::Error>>,
{
    let start = std::time::Instant::now();

    loop {
        match check_fn().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {
                tracing::trace!(condition = %name, "Condition not met yet, retrying...");
            }
            Err(e) => {
                tracing::trace!(error = %e, condition = %name, "Poll failed, retrying...");
            }
        }

        if start.elapsed() + interval > timeout {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}
