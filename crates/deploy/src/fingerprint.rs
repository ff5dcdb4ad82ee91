use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::module::{Argument, ConfigurationCall, ContractSpec};

/// Declaration-level parameters of a step.
///
/// Only what the module author wrote is included: resolved addresses, gas and nonces are
/// outcomes of execution, not part of the declaration. When any of these fields changes
/// for a step that the journal already marks complete, replaying the journal would no
/// longer reproduce the module and the deployment has to be reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDeclaration<'a> {
    Deployment {
        artifact: &'a str,
        args: &'a [Argument],
    },
    Call {
        target: &'a str,
        method: &'a str,
        args: &'a [Argument],
    },
}

impl<'a> StepDeclaration<'a> {
    pub fn deployment(spec: &'a ContractSpec) -> Self {
        Self::Deployment {
            artifact: spec.artifact_name(),
            args: &spec.args,
        }
    }

    pub fn call(call: &'a ConfigurationCall) -> Self {
        Self::Call {
            target: &call.target,
            method: &call.method,
            args: &call.args,
        }
    }

    /// Compute a SHA-256 hash of this declaration.
    ///
    /// The hash is deterministic: JSON objects inside literal arguments serialize with
    /// sorted keys.
    pub fn compute_hash(&self) -> String {
        let json = serde_json::to_string(self)
            .expect("StepDeclaration serialization should never fail");

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());

        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let spec = ContractSpec::new("VotingProposal")
            .arg(Argument::contract("ReputationSystem"))
            .arg(Argument::contract("ModelRegistry"));

        let hash1 = StepDeclaration::deployment(&spec).compute_hash();
        let hash2 = StepDeclaration::deployment(&spec.clone()).compute_hash();

        assert_eq!(hash1, hash2, "Hash should be deterministic");
        assert_eq!(hash1.len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_hash_changes_with_argument_order() {
        let spec = ContractSpec::new("VotingProposal")
            .arg(Argument::contract("ReputationSystem"))
            .arg(Argument::contract("ModelRegistry"));
        let swapped = ContractSpec::new("VotingProposal")
            .arg(Argument::contract("ModelRegistry"))
            .arg(Argument::contract("ReputationSystem"));

        assert_ne!(
            StepDeclaration::deployment(&spec).compute_hash(),
            StepDeclaration::deployment(&swapped).compute_hash(),
        );
    }

    #[test]
    fn test_hash_changes_with_artifact() {
        let spec = ContractSpec::new("Registry");
        let renamed = ContractSpec::new("Registry").artifact("ModelRegistryV2");

        assert_ne!(
            StepDeclaration::deployment(&spec).compute_hash(),
            StepDeclaration::deployment(&renamed).compute_hash(),
        );
    }

    #[test]
    fn test_hash_changes_with_call_target() {
        let to_core = ConfigurationCall::new("ModelRegistry", "transferOwnership")
            .arg(Argument::contract("Silens"));
        let to_proposal = ConfigurationCall::new("ModelRegistry", "transferOwnership")
            .arg(Argument::contract("VotingProposal"));

        assert_ne!(
            StepDeclaration::call(&to_core).compute_hash(),
            StepDeclaration::call(&to_proposal).compute_hash(),
        );
    }

    #[test]
    fn test_explicit_call_id_does_not_affect_hash() {
        let call = ConfigurationCall::new("ModelRegistry", "setIdentitySystem")
            .arg(Argument::contract("IdentityRegistry"));
        let with_id = call.clone().id("wire-identity");

        assert_eq!(
            StepDeclaration::call(&call).compute_hash(),
            StepDeclaration::call(&with_id).compute_hash(),
        );
    }

    #[test]
    fn test_deployment_and_call_never_collide() {
        let spec = ContractSpec::new("A");
        let call = ConfigurationCall::new("A", "A");

        assert_ne!(
            StepDeclaration::deployment(&spec).compute_hash(),
            StepDeclaration::call(&call).compute_hash(),
        );
    }
}
