//! Source verification on Etherscan-compatible block explorers.

use std::time::Duration;

use alloy_core::primitives::Address;
use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;

use crate::{
    artifacts::{Artifacts, BuildInfo},
    journal::DeployedContract,
};

/// Delay between two `checkverifystatus` polls.
const STATUS_POLL_DELAY: Duration = Duration::from_secs(5);

/// Number of `checkverifystatus` polls before giving up.
const STATUS_POLL_ATTEMPTS: usize = 12;

/// Explorer endpoints and credentials for one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerConfig {
    pub api_url: String,
    pub browser_url: String,
    pub api_key: String,
}

impl ExplorerConfig {
    pub fn new(api_url: &str, browser_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.to_string(),
            browser_url: browser_url.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Explorers known without configuration.
    pub fn builtin(network: &str, api_key: impl Into<String>) -> Option<Self> {
        let (api_url, browser_url) = match network {
            "mainnet" => ("https://api.etherscan.io/api", "https://etherscan.io/"),
            "sepolia" => (
                "https://api-sepolia.etherscan.io/api",
                "https://sepolia.etherscan.io/",
            ),
            _ => return None,
        };
        Some(Self::new(api_url, browser_url, api_key))
    }

    /// Explorer page showing the source of `address`.
    pub fn code_url(&self, address: Address) -> String {
        format!(
            "{}/address/{}#code",
            self.browser_url.trim_end_matches('/'),
            address
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("no compiled artifact named {0}")]
    MissingArtifact(String),

    #[error("explorer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("explorer rejected verification of {contract}: {message}")]
    Rejected { contract: String, message: String },

    #[error("verification of {contract} failed: {message}")]
    Failed { contract: String, message: String },

    #[error("verification of {contract} still pending after {attempts} checks (guid {guid})")]
    Pending {
        contract: String,
        guid: String,
        attempts: usize,
    },
}

/// Successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified { url: String },
    AlreadyVerified { url: String },
}

/// Envelope of every Etherscan API response.
#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: String,
}

impl ExplorerResponse {
    fn is_ok(&self) -> bool {
        self.status == "1"
    }
}

fn is_already_verified(message: &str) -> bool {
    message.to_lowercase().contains("already verified")
}

enum Status {
    Pending,
    Done(VerificationOutcome),
}

/// Submits deployed contracts for verification.
pub struct Verifier<'a> {
    http: reqwest::Client,
    explorer: ExplorerConfig,
    build_info: &'a BuildInfo,
    poll_delay: Duration,
}

impl<'a> Verifier<'a> {
    pub fn new(explorer: ExplorerConfig, build_info: &'a BuildInfo) -> anyhow::Result<Self> {
        Ok(Self {
            http: crate::rpc::create_client()?,
            explorer,
            build_info,
            poll_delay: STATUS_POLL_DELAY,
        })
    }

    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Verify every contract, logging failures instead of returning them.
    ///
    /// Returns the number of contracts verified (or already verified).
    pub async fn verify_all(&self, contracts: &[DeployedContract], artifacts: &Artifacts) -> usize {
        let mut verified = 0;

        for contract in contracts {
            match self.verify(contract, artifacts).await {
                Ok(VerificationOutcome::Verified { url }) => {
                    tracing::info!(contract = %contract.contract, %url, "Contract verified");
                    verified += 1;
                }
                Ok(VerificationOutcome::AlreadyVerified { url }) => {
                    tracing::info!(contract = %contract.contract, %url, "Contract already verified");
                    verified += 1;
                }
                Err(e) => {
                    tracing::warn!(contract = %contract.contract, error = %e, "Verification failed");
                }
            }
        }

        verified
    }

    /// Submit one contract and wait for the explorer's verdict.
    pub async fn verify(
        &self,
        contract: &DeployedContract,
        artifacts: &Artifacts,
    ) -> Result<VerificationOutcome, VerificationError> {
        let artifact = artifacts
            .get(&contract.artifact)
            .ok_or_else(|| VerificationError::MissingArtifact(contract.artifact.clone()))?;
        let url = self.explorer.code_url(contract.address);

        let source_code = self.build_info.input.to_string();
        let address = contract.address.to_string();
        let contract_name = artifact.qualified_name();
        let constructor_args = hex::encode(&contract.constructor_args);

        tracing::debug!(contract = %contract.contract, %address, "Submitting source for verification");

        let response: ExplorerResponse = self
            .http
            .post(&self.explorer.api_url)
            .form(&[
                ("apikey", self.explorer.api_key.as_str()),
                ("module", "contract"),
                ("action", "verifysourcecode"),
                ("contractaddress", address.as_str()),
                ("sourceCode", source_code.as_str()),
                ("codeformat", "solidity-standard-json-input"),
                ("contractname", contract_name.as_str()),
                ("compilerversion", self.build_info.solc_long_version.as_str()),
                // Sic: the explorer API spells it this way.
                ("constructorArguements", constructor_args.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if !response.is_ok() {
            if is_already_verified(&response.result) {
                return Ok(VerificationOutcome::AlreadyVerified { url });
            }
            return Err(VerificationError::Rejected {
                contract: contract.contract.clone(),
                message: format!("{} ({})", response.result, response.message),
            });
        }

        let guid = &response.result;
        let url = &url;
        let check = || async move {
            match self.check_status(&contract.contract, guid, url).await? {
                Status::Done(outcome) => Ok(outcome),
                Status::Pending => Err(VerificationError::Pending {
                    contract: contract.contract.clone(),
                    guid: guid.clone(),
                    attempts: STATUS_POLL_ATTEMPTS,
                }),
            }
        };

        check
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.poll_delay)
                    .with_max_times(STATUS_POLL_ATTEMPTS),
            )
            .when(|e| matches!(e, VerificationError::Pending { .. }))
            .notify(|_, delay| {
                tracing::debug!(contract = %contract.contract, ?delay, "Verification pending");
            })
            .await
    }

    async fn check_status(
        &self,
        contract: &str,
        guid: &str,
        url: &str,
    ) -> Result<Status, VerificationError> {
        let response: ExplorerResponse = self
            .http
            .get(&self.explorer.api_url)
            .query(&[
                ("apikey", self.explorer.api_key.as_str()),
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("guid", guid),
            ])
            .send()
            .await?
            .json()
            .await?;

        classify_status(contract, &response, url)
    }
}

fn classify_status(
    contract: &str,
    response: &ExplorerResponse,
    url: &str,
) -> Result<Status, VerificationError> {
    if response.is_ok() {
        return Ok(Status::Done(VerificationOutcome::Verified {
            url: url.to_string(),
        }));
    }

    if response.result.to_lowercase().contains("pending") {
        return Ok(Status::Pending);
    }

    if is_already_verified(&response.result) {
        return Ok(Status::Done(VerificationOutcome::AlreadyVerified {
            url: url.to_string(),
        }));
    }

    Err(VerificationError::Failed {
        contract: contract.to_string(),
        message: response.result.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: &str, result: &str) -> ExplorerResponse {
        ExplorerResponse {
            status: status.to_string(),
            message: String::new(),
            result: result.to_string(),
        }
    }

    const URL: &str = "https://sepolia.scrollscan.com/address/0x01#code";

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status("Silens", &response("1", "Pass - Verified"), URL),
            Ok(Status::Done(VerificationOutcome::Verified { .. }))
        ));
        assert!(matches!(
            classify_status("Silens", &response("0", "Pending in queue"), URL),
            Ok(Status::Pending)
        ));
        assert!(matches!(
            classify_status("Silens", &response("0", "Already Verified"), URL),
            Ok(Status::Done(VerificationOutcome::AlreadyVerified { .. }))
        ));
        assert!(matches!(
            classify_status("Silens", &response("0", "Fail - Unable to verify"), URL),
            Err(VerificationError::Failed { .. })
        ));
    }

    #[test]
    fn test_builtin_explorers() {
        let sepolia = ExplorerConfig::builtin("sepolia", "key").unwrap();
        assert_eq!(sepolia.api_url, "https://api-sepolia.etherscan.io/api");
        assert!(ExplorerConfig::builtin("scrollSepolia", "key").is_none());
    }

    #[test]
    fn test_code_url() {
        let explorer = ExplorerConfig::new(
            "https://api-sepolia.scrollscan.com/api",
            "https://sepolia.scrollscan.com/",
            "key",
        );
        let address = Address::with_last_byte(1);

        assert_eq!(
            explorer.code_url(address),
            format!("https://sepolia.scrollscan.com/address/{}#code", address)
        );
    }

    #[test]
    fn test_response_decoding() {
        let response: ExplorerResponse = serde_json::from_str(
            r#"{"status":"0","message":"NOTOK","result":"Contract source code already verified"}"#,
        )
        .unwrap();

        assert!(!response.is_ok());
        assert!(is_already_verified(&response.result));
    }
}
