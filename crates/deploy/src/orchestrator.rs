//! Plan execution.
//!
//! The orchestrator walks an [`ExecutionPlan`] step by step: constructions first, in
//! dependency order, then configuration calls in declaration order. Every step is
//! checked against the journal before anything is sent, so running the same plan twice
//! against a complete journal sends nothing.

use alloy_core::primitives::{Address, TxHash, U256};

use crate::{
    artifacts::{self, Artifact, Artifacts, EncodeError, ResolvedArgument},
    chain::{
        ChainClient, Receipt, SentTransaction, TransactionError, TransactionRequest,
        TransactionState,
    },
    fingerprint::StepDeclaration,
    journal::{self, AddressBook, DeploymentJournal, JournalError, JournalRecord},
    module::Argument,
    plan::{CallStep, DeployStep, ExecutionPlan, StepId},
};

/// Reasons an execution stopped. Steps completed before the failure stay journaled.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("step {step}: contract {contract} has not been deployed")]
    DependencyNotReady { step: StepId, contract: String },

    #[error("step {step}: no compiled artifact named {artifact}")]
    MissingArtifact { step: StepId, artifact: String },

    #[error("step {step}: {source}")]
    Encoding {
        step: StepId,
        #[source]
        source: EncodeError,
    },

    #[error("step {step}: transaction rejected: {reason}")]
    TransactionRejected { step: StepId, reason: String },

    #[error("step {step}: transaction reverted: {reason}")]
    TransactionReverted {
        step: StepId,
        tx_hash: Option<TxHash>,
        reason: String,
    },

    #[error("step {step}: transaction {tx_hash} was not confirmed in time, re-run to resume")]
    ConfirmationTimeout { step: StepId, tx_hash: TxHash },

    #[error(
        "step {step} was completed with a different declaration, reset the deployment to apply the change"
    )]
    Reconciliation { step: StepId },

    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl ExecutionError {
    /// The step that failed, when the failure is tied to one.
    pub fn step(&self) -> Option<&StepId> {
        match self {
            Self::DependencyNotReady { step, .. }
            | Self::MissingArtifact { step, .. }
            | Self::Encoding { step, .. }
            | Self::TransactionRejected { step, .. }
            | Self::TransactionReverted { step, .. }
            | Self::ConfirmationTimeout { step, .. }
            | Self::Reconciliation { step } => Some(step),
            Self::Journal(_) => None,
        }
    }

    fn from_transaction(step: &StepId, error: TransactionError) -> Self {
        let step = step.clone();
        match error {
            TransactionError::Rejected(reason) => Self::TransactionRejected { step, reason },
            TransactionError::Reverted { tx_hash, reason } => Self::TransactionReverted {
                step,
                tx_hash,
                reason,
            },
            TransactionError::ConfirmationTimeout { tx_hash } => {
                Self::ConfirmationTimeout { step, tx_hash }
            }
        }
    }
}

/// Executes plans against one chain with one set of artifacts.
pub struct Orchestrator<'a, C> {
    chain: &'a C,
    artifacts: &'a Artifacts,
}

impl<'a, C: ChainClient> Orchestrator<'a, C> {
    pub fn new(chain: &'a C, artifacts: &'a Artifacts) -> Self {
        Self { chain, artifacts }
    }

    /// Run every step of `plan` that the journal does not mark complete.
    ///
    /// Returns the address book of the module once every step is complete.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        journal: &mut DeploymentJournal,
    ) -> Result<AddressBook, ExecutionError> {
        reconcile(plan, journal)?;

        let remaining = plan
            .step_ids()
            .filter(|step| journal.completed(step).is_none())
            .count();
        tracing::info!(
            module = %plan.module_id,
            steps = plan.len(),
            remaining,
            "Executing deployment plan"
        );

        for step in &plan.deployments {
            if journal.completed(&step.id).is_some() {
                tracing::info!(step = %step.id, "Already deployed, skipping");
                continue;
            }
            self.deploy(step, journal).await?;
        }

        for step in &plan.calls {
            if journal.completed(&step.id).is_some() {
                tracing::info!(step = %step.id, "Already executed, skipping");
                continue;
            }
            self.call(step, journal).await?;
        }

        let address_book: AddressBook = plan
            .deployments
            .iter()
            .filter_map(|step| {
                journal
                    .address_of(&step.spec.id)
                    .map(|address| (step.spec.id.clone(), address))
            })
            .collect();

        tracing::info!(
            module = %plan.module_id,
            contracts = address_book.len(),
            "Deployment complete"
        );

        Ok(address_book)
    }

    async fn deploy(
        &self,
        step: &DeployStep,
        journal: &mut DeploymentJournal,
    ) -> Result<(), ExecutionError> {
        let artifact = self.artifact(&step.id, step.spec.artifact_name())?;
        let args = resolve_arguments(&step.id, &step.spec.args, journal)?;

        let constructor_args = artifacts::encode_constructor_args(artifact, &args).map_err(
            |source| ExecutionError::Encoding {
                step: step.id.clone(),
                source,
            },
        )?;
        let initcode = artifacts::encode_deployment(artifact, &constructor_args);

        tracing::info!(
            step = %step.id,
            artifact = %artifact.contract_name,
            "Deploying contract"
        );

        let receipt = self
            .send(&step.id, TransactionRequest::deploy(initcode), journal)
            .await?;

        let Some(address) = receipt.contract_address else {
            let reason = format!("receipt of {} carries no contract address", receipt.tx_hash);
            return Err(fail(&step.id, receipt.tx_hash, reason, journal)?);
        };

        journal.record(JournalRecord::ContractDeployed {
            step: step.id.clone(),
            contract: step.spec.id.clone(),
            artifact: artifact.contract_name.clone(),
            address,
            tx_hash: receipt.tx_hash,
            constructor_args,
            fingerprint: StepDeclaration::deployment(&step.spec).compute_hash(),
            timestamp: journal::now(),
        })?;

        tracing::info!(
            step = %step.id,
            %address,
            tx_hash = %receipt.tx_hash,
            block = receipt.block_number,
            "Contract deployed"
        );

        Ok(())
    }

    async fn call(
        &self,
        step: &CallStep,
        journal: &mut DeploymentJournal,
    ) -> Result<(), ExecutionError> {
        let target = resolve_contract(&step.id, &step.call.target, journal)?;
        let artifact_name = journal
            .deployed_contracts()
            .into_iter()
            .find(|deployed| deployed.contract == step.call.target)
            .map(|deployed| deployed.artifact)
            .unwrap_or_else(|| step.call.target.clone());
        let artifact = self.artifact(&step.id, &artifact_name)?;

        let args = resolve_arguments(&step.id, &step.call.args, journal)?;
        let data = artifacts::encode_call(artifact, &step.call.method, &args).map_err(
            |source| ExecutionError::Encoding {
                step: step.id.clone(),
                source,
            },
        )?;

        tracing::info!(
            step = %step.id,
            target = %step.call.target,
            method = %step.call.method,
            "Executing configuration call"
        );

        let receipt = self
            .send(&step.id, TransactionRequest::call(target, data), journal)
            .await?;

        journal.record(JournalRecord::CallExecuted {
            step: step.id.clone(),
            tx_hash: receipt.tx_hash,
            fingerprint: StepDeclaration::call(&step.call).compute_hash(),
            timestamp: journal::now(),
        })?;

        tracing::info!(
            step = %step.id,
            tx_hash = %receipt.tx_hash,
            block = receipt.block_number,
            "Configuration call confirmed"
        );

        Ok(())
    }

    /// Get a successful receipt for the step, reusing a transaction left in flight by a
    /// previous run when it made it (or can still make it) on chain.
    async fn send(
        &self,
        step: &StepId,
        request: TransactionRequest,
        journal: &mut DeploymentJournal,
    ) -> Result<Receipt, ExecutionError> {
        if let Some(receipt) = self.recover(step, &request, journal).await? {
            return Ok(receipt);
        }

        let sent = self
            .chain
            .submit(request)
            .await
            .map_err(|e| ExecutionError::from_transaction(step, e))?;
        record_sent(step, &sent, journal)?;

        self.confirm(step, sent.tx_hash, journal).await
    }

    async fn confirm(
        &self,
        step: &StepId,
        tx_hash: TxHash,
        journal: &mut DeploymentJournal,
    ) -> Result<Receipt, ExecutionError> {
        tracing::debug!(%step, %tx_hash, "Awaiting confirmation");

        let receipt = self
            .chain
            .wait_for_receipt(tx_hash)
            .await
            .map_err(|e| ExecutionError::from_transaction(step, e))?;

        check_receipt(step, receipt, journal)
    }

    /// Settle the transactions broadcast for the step by earlier runs.
    ///
    /// Returns the receipt when one of them was mined. A transaction the node still holds
    /// is waited for, then replaced with the same nonce; a new nonce is only spent (by
    /// returning `None`) once none of them can be mined anymore.
    async fn recover(
        &self,
        step: &StepId,
        request: &TransactionRequest,
        journal: &mut DeploymentJournal,
    ) -> Result<Option<Receipt>, ExecutionError> {
        let candidates = journal.pending_transactions(step).to_vec();
        if candidates.is_empty() {
            return Ok(None);
        }
        tracing::info!(
            %step,
            transactions = candidates.len(),
            "Found unconfirmed transaction from a previous run"
        );

        let mut pending = None;
        for sent in candidates.iter().rev() {
            let state = self
                .chain
                .transaction_state(sent)
                .await
                .map_err(|e| ExecutionError::from_transaction(step, e))?;

            match state {
                TransactionState::Mined(receipt) => {
                    return check_receipt(step, receipt, journal).map(Some);
                }
                TransactionState::Pending => {
                    pending.get_or_insert(*sent);
                }
                state @ (TransactionState::Dropped | TransactionState::Replaced) => {
                    tracing::debug!(
                        %step,
                        tx_hash = %sent.tx_hash,
                        ?state,
                        "Transaction can no longer be mined"
                    );
                }
            }
        }

        let Some(pending) = pending else {
            tracing::warn!(%step, "Previous transaction was dropped, submitting again");
            return Ok(None);
        };

        match self.chain.wait_for_receipt(pending.tx_hash).await {
            Ok(receipt) => return check_receipt(step, receipt, journal).map(Some),
            Err(TransactionError::ConfirmationTimeout { .. }) => {}
            Err(e) => return Err(ExecutionError::from_transaction(step, e)),
        }

        tracing::warn!(
            %step,
            tx_hash = %pending.tx_hash,
            nonce = pending.nonce,
            "Transaction still pending, replacing it with a higher gas price"
        );
        let replacement = self
            .chain
            .replace(request.clone(), &pending)
            .await
            .map_err(|e| ExecutionError::from_transaction(step, e))?;
        record_sent(step, &replacement, journal)?;

        self.confirm(step, replacement.tx_hash, journal).await.map(Some)
    }

    fn artifact(&self, step: &StepId, name: &str) -> Result<&'a Artifact, ExecutionError> {
        self.artifacts
            .get(name)
            .ok_or_else(|| ExecutionError::MissingArtifact {
                step: step.clone(),
                artifact: name.to_string(),
            })
    }
}

fn record_sent(
    step: &StepId,
    sent: &SentTransaction,
    journal: &mut DeploymentJournal,
) -> Result<(), ExecutionError> {
    journal.record(JournalRecord::TransactionSent {
        step: step.clone(),
        tx_hash: sent.tx_hash,
        nonce: sent.nonce,
        gas_price: U256::from(sent.gas_price),
        timestamp: journal::now(),
    })?;
    Ok(())
}

/// Turn a reverted receipt into an error.
fn check_receipt(
    step: &StepId,
    receipt: Receipt,
    journal: &mut DeploymentJournal,
) -> Result<Receipt, ExecutionError> {
    if receipt.success {
        return Ok(receipt);
    }

    let reason = format!("transaction {} reverted on chain", receipt.tx_hash);
    Err(fail(step, receipt.tx_hash, reason, journal)?)
}

/// Journal a mined transaction that did not complete the step, so the next run submits
/// a new one instead of adopting it again.
fn fail(
    step: &StepId,
    tx_hash: TxHash,
    reason: String,
    journal: &mut DeploymentJournal,
) -> Result<ExecutionError, ExecutionError> {
    journal.record(JournalRecord::TransactionFailed {
        step: step.clone(),
        tx_hash,
        reason: reason.clone(),
        timestamp: journal::now(),
    })?;

    Ok(ExecutionError::TransactionReverted {
        step: step.clone(),
        tx_hash: Some(tx_hash),
        reason,
    })
}

/// Refuse to continue when a completed step no longer matches its declaration.
fn reconcile(plan: &ExecutionPlan, journal: &DeploymentJournal) -> Result<(), ExecutionError> {
    let declarations = plan
        .deployments
        .iter()
        .map(|s| (&s.id, StepDeclaration::deployment(&s.spec)))
        .chain(
            plan.calls
                .iter()
                .map(|s| (&s.id, StepDeclaration::call(&s.call))),
        );

    for (step, declaration) in declarations {
        if let Some(done) = journal.completed(step) {
            if done.fingerprint != declaration.compute_hash() {
                tracing::error!(
                    %step,
                    recorded = %done.fingerprint,
                    "Completed step no longer matches the module"
                );
                return Err(ExecutionError::Reconciliation { step: step.clone() });
            }
        }
    }

    Ok(())
}

fn resolve_contract(
    step: &StepId,
    contract: &str,
    journal: &DeploymentJournal,
) -> Result<Address, ExecutionError> {
    journal
        .address_of(contract)
        .ok_or_else(|| ExecutionError::DependencyNotReady {
            step: step.clone(),
            contract: contract.to_string(),
        })
}

fn resolve_arguments(
    step: &StepId,
    args: &[Argument],
    journal: &DeploymentJournal,
) -> Result<Vec<ResolvedArgument>, ExecutionError> {
    args.iter()
        .map(|arg| match arg {
            Argument::Contract { contract } => {
                resolve_contract(step, contract, journal).map(ResolvedArgument::Address)
            }
            Argument::Literal(value) => Ok(ResolvedArgument::Literal(value.clone())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::Bytes;
    use crate::module::{ConfigurationCall, ContractSpec, ModuleDefinition};

    fn module() -> ModuleDefinition {
        ModuleDefinition::new("M")
            .contract(ContractSpec::new("A"))
            .contract(ContractSpec::new("B").arg(Argument::contract("A")))
            .call(ConfigurationCall::new("A", "setB").arg(Argument::contract("B")))
    }

    #[test]
    fn test_reconcile_accepts_matching_fingerprints() {
        let plan = crate::plan::plan(&module()).unwrap();
        let mut journal = DeploymentJournal::in_memory();
        journal
            .record(JournalRecord::ContractDeployed {
                step: StepId::from("M#A"),
                contract: "A".to_string(),
                artifact: "A".to_string(),
                address: Address::with_last_byte(1),
                tx_hash: TxHash::with_last_byte(1),
                constructor_args: Bytes::new(),
                fingerprint: StepDeclaration::deployment(&ContractSpec::new("A")).compute_hash(),
                timestamp: 0,
            })
            .unwrap();

        assert!(reconcile(&plan, &journal).is_ok());
    }

    #[test]
    fn test_reconcile_rejects_changed_declaration() {
        let plan = crate::plan::plan(&module()).unwrap();
        let mut journal = DeploymentJournal::in_memory();
        journal
            .record(JournalRecord::ContractDeployed {
                step: StepId::from("M#B"),
                contract: "B".to_string(),
                artifact: "B".to_string(),
                address: Address::with_last_byte(2),
                tx_hash: TxHash::with_last_byte(2),
                constructor_args: Bytes::new(),
                fingerprint: StepDeclaration::deployment(&ContractSpec::new("B")).compute_hash(),
                timestamp: 0,
            })
            .unwrap();

        let err = reconcile(&plan, &journal).unwrap_err();
        assert_eq!(err.step(), Some(&StepId::from("M#B")));
        assert!(matches!(err, ExecutionError::Reconciliation { .. }));
    }

    #[test]
    fn test_unresolved_reference_is_dependency_not_ready() {
        let journal = DeploymentJournal::in_memory();
        let err = resolve_arguments(
            &StepId::from("M#B"),
            &[Argument::contract("A"), Argument::literal(7)],
            &journal,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::DependencyNotReady { ref contract, .. } if contract == "A"
        ));
    }

    #[test]
    fn test_transaction_errors_keep_step() {
        let step = StepId::from("M#A.setB");
        let err = ExecutionError::from_transaction(
            &step,
            TransactionError::Rejected("nonce too low".to_string()),
        );

        assert_eq!(err.step(), Some(&step));
        assert_eq!(
            err.to_string(),
            "step M#A.setB: transaction rejected: nonce too low"
        );
    }
}
