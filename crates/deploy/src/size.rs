//! Bytecode size report.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use comfy_table::{Cell, CellAlignment, Color, Table, presets::UTF8_FULL};

use crate::{artifacts::Artifacts, config::ContractSizerConfig};

/// EIP-170 limit on deployed bytecode.
pub const DEPLOYED_SIZE_LIMIT: usize = 24_576;

/// EIP-3860 limit on initcode.
pub const INITCODE_SIZE_LIMIT: usize = 49_152;

/// Sizes of the previous report, used to show the change since the last run.
pub const SIZES_CACHE_FILENAME: &str = "contract-sizes.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractSize {
    pub name: String,
    pub deployed_size: usize,
    pub initcode_size: usize,
    /// Sizes reported by the previous run, if the contract existed then.
    pub previous: Option<(usize, usize)>,
}

impl ContractSize {
    pub fn exceeds_deployed_limit(&self) -> bool {
        self.deployed_size > DEPLOYED_SIZE_LIMIT
    }

    pub fn exceeds_initcode_limit(&self) -> bool {
        self.initcode_size > INITCODE_SIZE_LIMIT
    }

    pub fn is_oversized(&self) -> bool {
        self.exceeds_deployed_limit() || self.exceeds_initcode_limit()
    }
}

/// Sizes of every deployable contract of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeReport {
    pub contracts: Vec<ContractSize>,
}

fn kib(bytes: usize) -> String {
    format!("{:.3}", bytes as f64 / 1024.0)
}

fn size_cell(current: usize, previous: Option<usize>, limit: usize) -> Cell {
    let mut text = kib(current);
    if let Some(previous) = previous.filter(|previous| *previous != current) {
        let delta = current as f64 - previous as f64;
        text.push_str(&format!(" ({:+.3})", delta / 1024.0));
    }

    let cell = Cell::new(text).set_alignment(CellAlignment::Right);
    if current > limit {
        cell.fg(Color::Red)
    } else {
        cell
    }
}

impl SizeReport {
    /// Build the report. Contracts without runtime code (interfaces, abstract
    /// contracts) are left out.
    pub fn new(
        artifacts: &Artifacts,
        config: &ContractSizerConfig,
        previous: &BTreeMap<String, (usize, usize)>,
    ) -> Self {
        let mut contracts: Vec<_> = artifacts
            .iter()
            .filter(|artifact| !artifact.deployed_bytecode.is_empty())
            .map(|artifact| {
                let name = if config.disambiguate_paths {
                    artifact.qualified_name()
                } else {
                    artifact.contract_name.clone()
                };
                ContractSize {
                    previous: previous.get(&name).copied(),
                    name,
                    deployed_size: artifact.deployed_bytecode.len(),
                    initcode_size: artifact.bytecode.len(),
                }
            })
            .collect();

        if config.alpha_sort {
            contracts.sort_by(|a, b| a.name.cmp(&b.name));
        } else {
            contracts.sort_by(|a, b| {
                b.deployed_size
                    .cmp(&a.deployed_size)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }

        Self { contracts }
    }

    pub fn oversized(&self) -> impl Iterator<Item = &ContractSize> {
        self.contracts.iter().filter(|c| c.is_oversized())
    }

    pub fn render(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL).set_header(vec![
            "Contract Name",
            "Deployed size (KiB) (change)",
            "Initcode size (KiB) (change)",
        ]);

        for contract in &self.contracts {
            table.add_row(vec![
                Cell::new(&contract.name),
                size_cell(
                    contract.deployed_size,
                    contract.previous.map(|p| p.0),
                    DEPLOYED_SIZE_LIMIT,
                ),
                size_cell(
                    contract.initcode_size,
                    contract.previous.map(|p| p.1),
                    INITCODE_SIZE_LIMIT,
                ),
            ]);
        }

        table.to_string()
    }

    /// Log warnings for oversized contracts. Fails in strict mode.
    pub fn check_limits(&self, strict: bool) -> Result<()> {
        for contract in self.oversized() {
            if contract.exceeds_deployed_limit() {
                tracing::warn!(
                    contract = %contract.name,
                    size = contract.deployed_size,
                    limit = DEPLOYED_SIZE_LIMIT,
                    "Deployed bytecode exceeds the EIP-170 size limit"
                );
            }
            if contract.exceeds_initcode_limit() {
                tracing::warn!(
                    contract = %contract.name,
                    size = contract.initcode_size,
                    limit = INITCODE_SIZE_LIMIT,
                    "Initcode exceeds the EIP-3860 size limit"
                );
            }
        }

        let oversized = self.oversized().count();
        if strict && oversized > 0 {
            anyhow::bail!("{} contract(s) exceed a bytecode size limit", oversized);
        }

        Ok(())
    }

    /// Load sizes saved by a previous run. Missing or unreadable caches are empty.
    pub fn load_previous(cache_dir: &Path) -> BTreeMap<String, (usize, usize)> {
        std::fs::read_to_string(cache_dir.join(SIZES_CACHE_FILENAME))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        let sizes: BTreeMap<_, _> = self
            .contracts
            .iter()
            .map(|c| (c.name.clone(), (c.deployed_size, c.initcode_size)))
            .collect();

        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create cache directory {}", cache_dir.display()))?;
        let content = serde_json::to_string_pretty(&sizes).context("Failed to serialize sizes")?;
        std::fs::write(cache_dir.join(SIZES_CACHE_FILENAME), content)
            .context("Failed to write contract sizes cache")
    }
}
