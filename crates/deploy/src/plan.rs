//! Execution planning: validates a module and orders its steps.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use derive_more::Deref;
use serde::{Deserialize, Serialize};

use crate::module::{ConfigurationCall, ContractSpec, ModuleDefinition};

/// Identifier of a single step, unique within a module.
///
/// Constructions are named `<Module>#<ContractId>`, calls
/// `<Module>#<ContractId>.<method>` (or `<Module>#<id>` when the call carries an explicit id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn deployment(module_id: &str, spec: &ContractSpec) -> Self {
        Self(format!("{}#{}", module_id, spec.id))
    }

    pub fn call(module_id: &str, call: &ConfigurationCall) -> Self {
        match &call.id {
            Some(id) => Self(format!("{}#{}", module_id, id)),
            None => Self(format!("{}#{}.{}", module_id, call.target, call.method)),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Errors detected while planning. No transaction is ever sent when planning fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("module {module} declares no contracts")]
    EmptyModule { module: String },

    #[error("dependency cycle between contracts: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("step {step} references undeclared contract {reference}")]
    UnknownReference { step: StepId, reference: String },

    #[error("step {0} is declared more than once")]
    DuplicateStep(StepId),
}

/// A contract construction scheduled by the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployStep {
    pub id: StepId,
    pub spec: ContractSpec,
}

/// A configuration call scheduled by the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStep {
    pub id: StepId,
    pub call: ConfigurationCall,
}

/// Validated, ordered steps of a module.
///
/// Constructions come in a dependency-respecting order, calls in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub module_id: String,
    pub deployments: Vec<DeployStep>,
    pub calls: Vec<CallStep>,
}

impl ExecutionPlan {
    /// Total number of steps.
    pub fn len(&self) -> usize {
        self.deployments.len() + self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All step ids in execution order.
    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.deployments
            .iter()
            .map(|s| &s.id)
            .chain(self.calls.iter().map(|s| &s.id))
    }

    /// Look up a construction step by contract id.
    pub fn deployment(&self, contract_id: &str) -> Option<&DeployStep> {
        self.deployments.iter().find(|s| s.spec.id == contract_id)
    }
}

/// Validate a module and compute its execution order.
pub fn plan(module: &ModuleDefinition) -> Result<ExecutionPlan, PlanError> {
    if module.contracts.is_empty() {
        return Err(PlanError::EmptyModule {
            module: module.id.clone(),
        });
    }

    let mut seen_steps = HashSet::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for (i, spec) in module.contracts.iter().enumerate() {
        let step = StepId::deployment(&module.id, spec);
        if index.insert(spec.id.as_str(), i).is_some() || !seen_steps.insert(step.clone()) {
            return Err(PlanError::DuplicateStep(step));
        }
    }

    // Unresolved dependency count per contract, and the reverse edges.
    let mut pending = vec![0usize; module.contracts.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); module.contracts.len()];

    for (i, spec) in module.contracts.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for reference in spec.references() {
            let dep = *index
                .get(reference)
                .ok_or_else(|| PlanError::UnknownReference {
                    step: StepId::deployment(&module.id, spec),
                    reference: reference.to_string(),
                })?;
            deps.insert(dep);
        }

        if deps.contains(&i) {
            return Err(PlanError::Cycle {
                cycle: vec![spec.id.clone(), spec.id.clone()],
            });
        }

        pending[i] = deps.len();
        for dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut calls = Vec::with_capacity(module.calls.len());
    for call in &module.calls {
        let step = StepId::call(&module.id, call);
        if let Some(reference) = call.references().find(|r| !index.contains_key(r)) {
            return Err(PlanError::UnknownReference {
                step,
                reference: reference.to_string(),
            });
        }
        if !seen_steps.insert(step.clone()) {
            return Err(PlanError::DuplicateStep(step));
        }
        calls.push(CallStep {
            id: step,
            call: call.clone(),
        });
    }

    // Kahn's algorithm; the lowest declaration index among ready contracts goes first.
    let mut ready: BTreeSet<usize> = (0..module.contracts.len())
        .filter(|&i| pending[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(module.contracts.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < module.contracts.len() {
        return Err(PlanError::Cycle {
            cycle: find_cycle(module, &index, &pending),
        });
    }

    let deployments = order
        .into_iter()
        .map(|i| {
            let spec = &module.contracts[i];
            DeployStep {
                id: StepId::deployment(&module.id, spec),
                spec: spec.clone(),
            }
        })
        .collect();

    Ok(ExecutionPlan {
        module_id: module.id.clone(),
        deployments,
        calls,
    })
}

/// Walk unresolved references until a contract repeats.
///
/// Every contract left with pending dependencies references at least one other such
/// contract, so the walk always closes a loop.
fn find_cycle(
    module: &ModuleDefinition,
    index: &HashMap<&str, usize>,
    pending: &[usize],
) -> Vec<String> {
    let Some(start) = pending.iter().position(|&p| p > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;

    loop {
        let next = module.contracts[current]
            .references()
            .filter_map(|r| index.get(r).copied())
            .find(|&dep| pending[dep] > 0);

        let Some(next) = next else {
            break;
        };

        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| module.contracts[i].id.clone())
                .collect();
            cycle.push(module.contracts[next].id.clone());
            return cycle;
        }

        path.push(next);
        current = next;
    }

    path.into_iter()
        .map(|i| module.contracts[i].id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Argument, BuiltinModule};

    fn position(plan: &ExecutionPlan, id: &str) -> usize {
        plan.deployments
            .iter()
            .position(|s| s.spec.id == id)
            .unwrap()
    }

    #[test]
    fn test_every_contract_follows_its_dependencies() {
        for builtin in [
            BuiltinModule::Silens,
            BuiltinModule::SilensCoreOwned,
            BuiltinModule::SilensProposalOwned,
        ] {
            let module = builtin.definition().unwrap();
            let plan = plan(&module).unwrap();

            for step in &plan.deployments {
                for dep in step.spec.references() {
                    assert!(
                        position(&plan, dep) < position(&plan, &step.spec.id),
                        "{} must come after {}",
                        step.spec.id,
                        dep
                    );
                }
            }
        }
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let module = ModuleDefinition::new("M")
            .contract(ContractSpec::new("C").arg(Argument::contract("A")))
            .contract(ContractSpec::new("B"))
            .contract(ContractSpec::new("A"));

        let plan = plan(&module).unwrap();
        let order: Vec<_> = plan.deployments.iter().map(|s| s.spec.id.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_reverse_declared_chain() {
        let module = ModuleDefinition::new("M")
            .contract(ContractSpec::new("D").arg(Argument::contract("C")))
            .contract(ContractSpec::new("C").arg(Argument::contract("B")))
            .contract(ContractSpec::new("B").arg(Argument::contract("A")))
            .contract(ContractSpec::new("A"));

        let plan = plan(&module).unwrap();
        let order: Vec<_> = plan.deployments.iter().map(|s| s.spec.id.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let module = ModuleDefinition::new("M")
            .contract(ContractSpec::new("Root"))
            .contract(ContractSpec::new("A").arg(Argument::contract("B")))
            .contract(ContractSpec::new("B").arg(Argument::contract("C")))
            .contract(ContractSpec::new("C").arg(Argument::contract("A")));

        match plan(&module) {
            Err(PlanError::Cycle { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for id in ["A", "B", "C"] {
                    assert!(cycle.iter().any(|c| c == id));
                }
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let module =
            ModuleDefinition::new("M").contract(ContractSpec::new("A").arg(Argument::contract("A")));

        assert!(matches!(plan(&module), Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn test_unknown_constructor_reference() {
        let module = ModuleDefinition::new("M")
            .contract(ContractSpec::new("A").arg(Argument::contract("Missing")));

        assert_eq!(
            plan(&module),
            Err(PlanError::UnknownReference {
                step: StepId::from("M#A"),
                reference: "Missing".to_string(),
            })
        );
    }

    #[test]
    fn test_unknown_call_target_and_argument() {
        let base = ModuleDefinition::new("M").contract(ContractSpec::new("A"));

        let bad_target = base.clone().call(ConfigurationCall::new("Ghost", "init"));
        assert!(matches!(
            plan(&bad_target),
            Err(PlanError::UnknownReference { reference, .. }) if reference == "Ghost"
        ));

        let bad_arg = base.call(ConfigurationCall::new("A", "set").arg(Argument::contract("Ghost")));
        assert!(matches!(
            plan(&bad_arg),
            Err(PlanError::UnknownReference { step, .. }) if step == StepId::from("M#A.set")
        ));
    }

    #[test]
    fn test_duplicate_steps() {
        let dup_contract = ModuleDefinition::new("M")
            .contract(ContractSpec::new("A"))
            .contract(ContractSpec::new("A"));
        assert_eq!(
            plan(&dup_contract),
            Err(PlanError::DuplicateStep(StepId::from("M#A")))
        );

        let dup_call = ModuleDefinition::new("M")
            .contract(ContractSpec::new("A"))
            .call(ConfigurationCall::new("A", "poke"))
            .call(ConfigurationCall::new("A", "poke"));
        assert_eq!(
            plan(&dup_call),
            Err(PlanError::DuplicateStep(StepId::from("M#A.poke")))
        );

        let disambiguated = ModuleDefinition::new("M")
            .contract(ContractSpec::new("A"))
            .call(ConfigurationCall::new("A", "poke"))
            .call(ConfigurationCall::new("A", "poke").id("A.poke.again"));
        assert_eq!(plan(&disambiguated).unwrap().calls.len(), 2);
    }

    #[test]
    fn test_empty_module() {
        assert!(matches!(
            plan(&ModuleDefinition::new("Empty")),
            Err(PlanError::EmptyModule { .. })
        ));
    }

    #[test]
    fn test_calls_keep_declaration_order() {
        let module = BuiltinModule::SilensCoreOwned.definition().unwrap();
        let plan = plan(&module).unwrap();

        let ids: Vec<_> = plan.calls.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "SilensCoreOwnedModule#ModelRegistry.setReputationSystem",
                "SilensCoreOwnedModule#ModelRegistry.setIdentitySystem",
                "SilensCoreOwnedModule#VotingProposal.setIdentitySystem",
                "SilensCoreOwnedModule#ReputationSystem.setIdentitySystem",
                "SilensCoreOwnedModule#ModelRegistry.transferOwnership",
            ]
        );
        assert_eq!(plan.len(), 10);
    }
}
