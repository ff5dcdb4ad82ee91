//! Persisted, append-only record of deployment progress.
//!
//! One journal exists per (network, module) pair, stored at
//! `<deployments>/<network>/<module>/journal.jsonl`. Every line is a [`JournalRecord`].
//! Records are only ever appended: a completed step is never rewritten, which is what
//! makes replaying a module idempotent.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, Bytes, TxHash, U256};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{chain::SentTransaction, plan::StepId};

/// Journal file name inside a deployment directory.
pub const JOURNAL_FILENAME: &str = "journal.jsonl";
/// Address book file name inside a deployment directory.
pub const ADDRESS_BOOK_FILENAME: &str = "deployed_addresses.json";
/// Lock file guarding a deployment directory against concurrent writers.
const LOCK_FILENAME: &str = ".lock";

/// Final mapping from contract id to deployed address.
pub type AddressBook = BTreeMap<String, Address>;

/// Directory holding the journal of `module_id` deployed on `network`.
pub fn deployment_dir(deployments_root: &Path, network: &str, module_id: &str) -> PathBuf {
    deployments_root.join(network).join(module_id)
}

/// A single journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    /// A transaction was broadcast for the step but not yet confirmed.
    ///
    /// A step may accumulate several of these when a stuck transaction is replaced by one
    /// with the same nonce.
    TransactionSent {
        step: StepId,
        tx_hash: TxHash,
        nonce: u64,
        gas_price: U256,
        timestamp: i64,
    },
    /// The construction transaction of the step was confirmed.
    ContractDeployed {
        step: StepId,
        contract: String,
        artifact: String,
        address: Address,
        tx_hash: TxHash,
        constructor_args: Bytes,
        fingerprint: String,
        timestamp: i64,
    },
    /// The transaction broadcast for the step was mined without completing it, either
    /// reverted or creating no contract.
    ///
    /// The step is pending again and the next run submits a new transaction.
    TransactionFailed {
        step: StepId,
        tx_hash: TxHash,
        reason: String,
        timestamp: i64,
    },
    /// The configuration call of the step was confirmed.
    CallExecuted {
        step: StepId,
        tx_hash: TxHash,
        fingerprint: String,
        timestamp: i64,
    },
}

impl JournalRecord {
    pub fn step(&self) -> &StepId {
        match self {
            Self::TransactionSent { step, .. }
            | Self::TransactionFailed { step, .. }
            | Self::ContractDeployed { step, .. }
            | Self::CallExecuted { step, .. } => step,
        }
    }
}

/// Result of a completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedStep {
    pub tx_hash: TxHash,
    /// Deployed address, for construction steps.
    pub address: Option<Address>,
    pub fingerprint: String,
}

/// A contract whose construction has been confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedContract {
    pub step: StepId,
    pub contract: String,
    pub artifact: String,
    pub address: Address,
    pub tx_hash: TxHash,
    pub constructor_args: Bytes,
}

/// Status of a step as recorded by the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    /// Broadcast, awaiting confirmation.
    Sent(TxHash),
    Completed(CompletedStep),
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("deployment at {} is locked by another process", .path.display())]
    Locked { path: PathBuf },

    #[error("journal I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupted journal record at {}:{line}: {source}", .path.display())]
    Corrupted {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("step {0} is already complete and cannot be recorded again")]
    AlreadyCompleted(StepId),
}

/// Backing file of an on-disk journal. The lock is held for as long as the journal lives.
#[derive(Debug)]
struct JournalFile {
    dir: PathBuf,
    writer: File,
    _lock: File,
}

/// The deployment journal.
///
/// Not designed for concurrent writers: an on-disk journal holds an exclusive lock on
/// its directory while open.
#[derive(Debug, Default)]
pub struct DeploymentJournal {
    file: Option<JournalFile>,
    records: Vec<JournalRecord>,
    sent: HashMap<StepId, Vec<SentTransaction>>,
    completed: HashMap<StepId, CompletedStep>,
    address_book: AddressBook,
}

impl DeploymentJournal {
    /// A journal that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) the journal stored in `dir`, replaying its records.
    pub fn open(dir: &Path) -> Result<Self, JournalError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| JournalError::Io { path, source }
        };

        std::fs::create_dir_all(dir).map_err(io_err(dir))?;

        let lock_path = dir.join(LOCK_FILENAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;

        if let Err(e) = lock.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(JournalError::Locked {
                    path: dir.to_path_buf(),
                });
            }
            return Err(io_err(&lock_path)(e));
        }

        let journal_path = dir.join(JOURNAL_FILENAME);
        let mut journal = Self::default();

        // Set when the last byte of the file is not a newline, so the next record would be
        // glued onto the last one.
        let mut unterminated = false;

        if journal_path.exists() {
            let content =
                std::fs::read_to_string(&journal_path).map_err(io_err(&journal_path))?;
            unterminated = !content.is_empty() && !content.ends_with('\n');

            let lines: Vec<_> = content.split_terminator('\n').collect();
            let last = lines.len();
            let mut valid_len = 0u64;

            for (i, line) in lines.into_iter().enumerate() {
                if line.trim().is_empty() {
                    valid_len += line.len() as u64 + 1;
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(record) => {
                        valid_len += line.len() as u64 + 1;
                        journal.apply(record);
                    }
                    // A crash while appending can leave a torn final line. Cut it off so
                    // the next record starts on a fresh line.
                    Err(e) if i + 1 == last => {
                        tracing::warn!(
                            path = %journal_path.display(),
                            line = i + 1,
                            error = %e,
                            "Dropping truncated final journal record"
                        );
                        OpenOptions::new()
                            .write(true)
                            .open(&journal_path)
                            .and_then(|f| f.set_len(valid_len))
                            .map_err(io_err(&journal_path))?;
                        unterminated = false;
                    }
                    Err(source) => {
                        return Err(JournalError::Corrupted {
                            path: journal_path,
                            line: i + 1,
                            source,
                        });
                    }
                }
            }
        }

        let mut writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(io_err(&journal_path))?;

        if unterminated {
            tracing::debug!(path = %journal_path.display(), "Terminating last journal record");
            writer
                .write_all(b"\n")
                .and_then(|_| writer.sync_data())
                .map_err(io_err(&journal_path))?;
        }

        tracing::debug!(
            path = %journal_path.display(),
            records = journal.records.len(),
            completed = journal.completed.len(),
            "Journal opened"
        );

        journal.file = Some(JournalFile {
            dir: dir.to_path_buf(),
            writer,
            _lock: lock,
        });

        Ok(journal)
    }

    /// Delete the journal and address book stored in `dir`.
    pub fn reset(dir: &Path) -> Result<(), JournalError> {
        if !dir.exists() {
            return Ok(());
        }

        // Take the lock first so a running deployment is never wiped underneath.
        let journal = Self::open(dir)?;
        for name in [JOURNAL_FILENAME, ADDRESS_BOOK_FILENAME] {
            let path = dir.join(name);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|source| JournalError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        drop(journal);

        tracing::info!(path = %dir.display(), "Deployment journal reset");
        Ok(())
    }

    /// Directory of an on-disk journal.
    pub fn dir(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.dir.as_path())
    }

    pub fn records(&self) -> &[JournalRecord] {
        &self.records
    }

    pub fn completed(&self, step: &StepId) -> Option<&CompletedStep> {
        self.completed.get(step)
    }

    /// Transactions broadcast for a step that has not been confirmed yet, oldest first.
    pub fn pending_transactions(&self, step: &StepId) -> &[SentTransaction] {
        if self.completed.contains_key(step) {
            return &[];
        }
        self.sent.get(step).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn status(&self, step: &StepId) -> StepStatus {
        if let Some(done) = self.completed.get(step) {
            return StepStatus::Completed(done.clone());
        }
        match self.sent.get(step).and_then(|sent| sent.last()) {
            Some(sent) => StepStatus::Sent(sent.tx_hash),
            None => StepStatus::Pending,
        }
    }

    /// Contract id to address, for every confirmed construction.
    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub fn address_of(&self, contract: &str) -> Option<Address> {
        self.address_book.get(contract).copied()
    }

    /// Every confirmed construction, in completion order.
    pub fn deployed_contracts(&self) -> Vec<DeployedContract> {
        self.records
            .iter()
            .filter_map(|record| match record {
                JournalRecord::ContractDeployed {
                    step,
                    contract,
                    artifact,
                    address,
                    tx_hash,
                    constructor_args,
                    ..
                } => Some(DeployedContract {
                    step: step.clone(),
                    contract: contract.clone(),
                    artifact: artifact.clone(),
                    address: *address,
                    tx_hash: *tx_hash,
                    constructor_args: constructor_args.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Append a record. It is flushed to disk before the in-memory state changes.
    pub fn record(&mut self, record: JournalRecord) -> Result<(), JournalError> {
        if self.completed.contains_key(record.step()) {
            return Err(JournalError::AlreadyCompleted(record.step().clone()));
        }

        let deploys = matches!(record, JournalRecord::ContractDeployed { .. });

        if let Some(file) = self.file.as_mut() {
            let path = file.dir.join(JOURNAL_FILENAME);
            let mut line = serde_json::to_string(&record)
                .expect("JournalRecord serialization should never fail");
            line.push('\n');

            file.writer
                .write_all(line.as_bytes())
                .and_then(|_| file.writer.sync_data())
                .map_err(|source| JournalError::Io { path, source })?;
        }

        self.apply(record);

        if deploys {
            self.save_address_book()?;
        }

        Ok(())
    }

    fn apply(&mut self, record: JournalRecord) {
        match &record {
            JournalRecord::TransactionSent {
                step,
                tx_hash,
                nonce,
                gas_price,
                ..
            } => {
                self.sent.entry(step.clone()).or_default().push(SentTransaction {
                    tx_hash: *tx_hash,
                    nonce: *nonce,
                    gas_price: gas_price.saturating_to(),
                });
            }
            JournalRecord::TransactionFailed { step, .. } => {
                self.sent.remove(step);
            }
            JournalRecord::ContractDeployed {
                step,
                contract,
                address,
                tx_hash,
                fingerprint,
                ..
            } => {
                self.completed.insert(
                    step.clone(),
                    CompletedStep {
                        tx_hash: *tx_hash,
                        address: Some(*address),
                        fingerprint: fingerprint.clone(),
                    },
                );
                self.address_book.insert(contract.clone(), *address);
            }
            JournalRecord::CallExecuted {
                step,
                tx_hash,
                fingerprint,
                ..
            } => {
                self.completed.insert(
                    step.clone(),
                    CompletedStep {
                        tx_hash: *tx_hash,
                        address: None,
                        fingerprint: fingerprint.clone(),
                    },
                );
            }
        }
        self.records.push(record);
    }

    /// Write `deployed_addresses.json` next to the journal.
    fn save_address_book(&self) -> Result<(), JournalError> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };

        let path = file.dir.join(ADDRESS_BOOK_FILENAME);
        let json = serde_json::to_string_pretty(&self.address_book)
            .expect("AddressBook serialization should never fail");

        std::fs::write(&path, json).map_err(|source| JournalError::Io { path, source })
    }
}

/// Load a previously written address book.
pub fn load_address_book(dir: &Path) -> anyhow::Result<AddressBook> {
    use anyhow::Context;

    let path = dir.join(ADDRESS_BOOK_FILENAME);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read address book from {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse address book JSON")
}

/// Current unix timestamp, for journal records.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::keccak256;
    use tempdir::TempDir;

    fn sent(step: &str, last_byte: u8, nonce: u64) -> JournalRecord {
        JournalRecord::TransactionSent {
            step: StepId::from(step),
            tx_hash: keccak256([last_byte]),
            nonce,
            gas_price: U256::from(1_000_000_000u64),
            timestamp: 1737316800,
        }
    }

    fn deployed(step: &str, contract: &str, last_byte: u8) -> JournalRecord {
        JournalRecord::ContractDeployed {
            step: StepId::from(step),
            contract: contract.to_string(),
            artifact: contract.to_string(),
            address: Address::with_last_byte(last_byte),
            tx_hash: keccak256([last_byte]),
            constructor_args: Bytes::new(),
            fingerprint: "f".repeat(64),
            timestamp: 1737316800,
        }
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("sepolia/SilensModule");

        {
            let mut journal = DeploymentJournal::open(&dir).unwrap();
            journal
                .record(sent("SilensModule#ModelRegistry", 1, 0))
                .unwrap();
            journal
                .record(deployed("SilensModule#ModelRegistry", "ModelRegistry", 1))
                .unwrap();
            journal
                .record(sent("SilensModule#ReputationSystem", 2, 1))
                .unwrap();
        }

        let journal = DeploymentJournal::open(&dir).unwrap();
        assert_eq!(journal.records().len(), 3);
        assert_eq!(
            journal.address_of("ModelRegistry"),
            Some(Address::with_last_byte(1))
        );
        assert!(matches!(
            journal.status(&StepId::from("SilensModule#ModelRegistry")),
            StepStatus::Completed(_)
        ));
        assert_eq!(
            journal.pending_transactions(&StepId::from("SilensModule#ReputationSystem")),
            &[SentTransaction {
                tx_hash: keccak256([2u8]),
                nonce: 1,
                gas_price: 1_000_000_000,
            }]
        );
        assert_eq!(
            journal.status(&StepId::from("SilensModule#Silens")),
            StepStatus::Pending
        );

        let book = load_address_book(&dir).unwrap();
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_failed_transaction_clears_pending_state() {
        let step = StepId::from("M#A");
        let mut journal = DeploymentJournal::in_memory();
        journal.record(sent("M#A", 1, 0)).unwrap();
        assert_eq!(journal.status(&step), StepStatus::Sent(keccak256([1u8])));

        journal
            .record(JournalRecord::TransactionFailed {
                step: step.clone(),
                tx_hash: keccak256([1u8]),
                reason: "execution reverted".to_string(),
                timestamp: 1737316801,
            })
            .unwrap();
        assert_eq!(journal.status(&step), StepStatus::Pending);
        assert!(journal.pending_transactions(&step).is_empty());
    }

    #[test]
    fn test_replacements_accumulate_until_confirmed() {
        let step = StepId::from("M#A");
        let mut journal = DeploymentJournal::in_memory();
        journal.record(sent("M#A", 1, 4)).unwrap();
        journal.record(sent("M#A", 2, 4)).unwrap();

        let pending = journal.pending_transactions(&step);
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|tx| tx.nonce == 4));
        assert_eq!(journal.status(&step), StepStatus::Sent(keccak256([2u8])));

        journal.record(deployed("M#A", "A", 1)).unwrap();
        assert!(journal.pending_transactions(&step).is_empty());
    }

    #[test]
    fn test_unterminated_final_record_is_kept() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();

        // Complete record, crash before its newline reached the disk.
        let complete = serde_json::to_string(&deployed("M#A", "A", 1)).unwrap();
        std::fs::write(dir.join(JOURNAL_FILENAME), &complete).unwrap();

        let mut journal = DeploymentJournal::open(&dir).unwrap();
        assert_eq!(journal.records().len(), 1);
        journal.record(deployed("M#B", "B", 2)).unwrap();
        drop(journal);

        let journal = DeploymentJournal::open(&dir).unwrap();
        assert_eq!(journal.records().len(), 2);
        assert_eq!(journal.address_of("A"), Some(Address::with_last_byte(1)));
        assert_eq!(journal.address_of("B"), Some(Address::with_last_byte(2)));
    }

    #[test]
    fn test_completed_step_is_never_rewritten() {
        let mut journal = DeploymentJournal::in_memory();
        journal.record(deployed("M#A", "A", 1)).unwrap();

        let err = journal.record(deployed("M#A", "A", 2)).unwrap_err();
        assert!(matches!(err, JournalError::AlreadyCompleted(_)));
        assert_eq!(journal.address_of("A"), Some(Address::with_last_byte(1)));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("sepolia/SilensModule");

        let _first = DeploymentJournal::open(&dir).unwrap();
        let second = DeploymentJournal::open(&dir);
        assert!(matches!(second, Err(JournalError::Locked { .. })));
    }

    #[test]
    fn test_networks_are_independent() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let sepolia = deployment_dir(temp_dir.path(), "sepolia", "SilensModule");
        let scroll = deployment_dir(temp_dir.path(), "scrollSepolia", "SilensModule");

        let mut journal = DeploymentJournal::open(&sepolia).unwrap();
        journal.record(deployed("SilensModule#Silens", "Silens", 5)).unwrap();
        drop(journal);

        let other = DeploymentJournal::open(&scroll).unwrap();
        assert!(other.records().is_empty());
        assert!(other.address_book().is_empty());
    }

    #[test]
    fn test_truncated_final_line_is_ignored() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();

        let complete = serde_json::to_string(&deployed("M#A", "A", 1)).unwrap();
        std::fs::write(
            dir.join(JOURNAL_FILENAME),
            format!("{}\n{{\"type\":\"contract_dep", complete),
        )
        .unwrap();

        let mut journal = DeploymentJournal::open(&dir).unwrap();
        assert_eq!(journal.records().len(), 1);

        journal.record(deployed("M#B", "B", 2)).unwrap();
        drop(journal);

        let journal = DeploymentJournal::open(&dir).unwrap();
        assert_eq!(journal.records().len(), 2);
    }

    #[test]
    fn test_corrupted_middle_line_is_an_error() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();

        let complete = serde_json::to_string(&deployed("M#A", "A", 1)).unwrap();
        std::fs::write(
            dir.join(JOURNAL_FILENAME),
            format!("{{ invalid json }}\n{}\n", complete),
        )
        .unwrap();

        assert!(matches!(
            DeploymentJournal::open(&dir),
            Err(JournalError::Corrupted { line: 1, .. })
        ));
    }

    #[test]
    fn test_reset_clears_journal() {
        let temp_dir = TempDir::new("silens-journal").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("sepolia/SilensModule");

        let mut journal = DeploymentJournal::open(&dir).unwrap();
        journal.record(deployed("M#A", "A", 1)).unwrap();
        drop(journal);

        DeploymentJournal::reset(&dir).unwrap();
        let journal = DeploymentJournal::open(&dir).unwrap();
        assert!(journal.records().is_empty());
        assert!(!dir.join(ADDRESS_BOOK_FILENAME).exists());
    }
}
