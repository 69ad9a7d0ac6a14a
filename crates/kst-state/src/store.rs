//! The durable state document and its two-phase write protocol.
//!
//! One JSON document holds everything the pipeline must not lose: the
//! stream's configuration, the delivery watermark (`last_popped_id`), the
//! committed boxes, and, transiently while a two-phase commit is in
//! flight, a prepared boxes snapshot.
//!
//! # File protocol
//!
//! Three names inside the state directory:
//!
//! | name             | role                                   |
//! |------------------|----------------------------------------|
//! | `stream.ltn`     | canonical state                        |
//! | `stream.mod.ltn` | pending new version during a commit    |
//! | `stream.new.ltn` | staging file used only by `create`     |
//!
//! `commit` writes the full document to `stream.mod.ltn`, deletes
//! `stream.ltn`, then renames the pending file over the canonical name.
//! `open` undoes whatever a crash left behind: a leftover `stream.new.ltn`
//! is deleted; if the canonical file exists any pending file is an
//! incomplete commit and is deleted; if only the pending file exists the
//! prior commit got past the delete and the rename is completed. At every
//! instant exactly one of {canonical, pending} holds a valid version.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use kst_api::TransactionFilter;

use crate::boxes::Boxes;

pub const STATE_FILE: &str = "stream.ltn";
pub const PENDING_FILE: &str = "stream.mod.ltn";
pub const CREATE_FILE: &str = "stream.new.ltn";

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Stream configuration, persisted so a reopened stream observes the same
/// transaction set against the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Base URL of the remote node.
    pub endpoint: String,
    /// Only transactions touching this address are observed.
    pub address: Option<String>,
    /// Whether mining-reward transactions are observed.
    pub include_mined: bool,
}

impl StreamConfig {
    pub fn filter(&self) -> TransactionFilter {
        TransactionFilter {
            address: self.address.clone(),
            include_mined: self.include_mined,
        }
    }
}

/// The single serialized state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub config: StreamConfig,
    /// Highest transaction id already delivered to the inbox worker, or -1.
    pub last_popped_id: i64,
    pub committed: Boxes,
    /// Present only while a two-phase commit is in flight.
    #[serde(default)]
    pub prepared: Option<Boxes>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A state document bound to its directory.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    pub state: StoredState,
}

impl StateStore {
    /// Create a fresh state directory.
    ///
    /// `last_popped_id` is the node's current last transaction id, probed by
    /// the caller, so a new stream does not replay all history.
    pub fn create(dir: &Path, config: StreamConfig, last_popped_id: i64) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create state dir {}", dir.display()))?;
        if dir.join(STATE_FILE).exists() || dir.join(PENDING_FILE).exists() {
            bail!("state directory {} already holds a stream", dir.display());
        }
        let store = Self {
            dir: dir.to_path_buf(),
            state: StoredState {
                config,
                last_popped_id,
                committed: Boxes::default(),
                prepared: None,
            },
        };
        let staged = store.dir.join(CREATE_FILE);
        write_document(&staged, &store.state)?;
        fs::rename(&staged, store.dir.join(STATE_FILE))
            .with_context(|| format!("activate created state in {}", dir.display()))?;
        Ok(store)
    }

    /// Open an existing state directory, repairing any crash residue, then
    /// resolving a prepared snapshot against the caller's revision.
    ///
    /// A prepared snapshot is promoted to committed iff its revision equals
    /// `revision`; otherwise it is discarded. Either way the result is
    /// committed back to disk before this returns, so recovery is a single
    /// decision made once.
    pub fn open(dir: &Path, revision: Option<u64>) -> Result<Self> {
        let canonical = dir.join(STATE_FILE);
        let pending = dir.join(PENDING_FILE);
        let staged = dir.join(CREATE_FILE);

        remove_if_present(&staged)?;
        if canonical.exists() {
            // A crash mid-commit before the canonical delete: the pending
            // file is incomplete and loses.
            remove_if_present(&pending)?;
        } else if pending.exists() {
            // A crash between the delete and the rename: the pending file
            // is the only complete version, so finish the rename.
            fs::rename(&pending, &canonical)
                .with_context(|| format!("complete interrupted commit in {}", dir.display()))?;
        } else {
            bail!("{} is not a stream state directory", dir.display());
        }

        let raw = fs::read(&canonical)
            .with_context(|| format!("read state file {}", canonical.display()))?;
        let mut state: StoredState = serde_json::from_slice(&raw)
            .with_context(|| format!("parse state file {}", canonical.display()))?;

        match (state.prepared.take(), revision) {
            (Some(prepared), Some(wanted)) if prepared.revision == wanted => {
                info!(revision = wanted, "promoting prepared state");
                state.committed = prepared;
            }
            (Some(prepared), _) => {
                info!(revision = prepared.revision, "discarding prepared state");
            }
            (None, _) => {}
        }

        let mut store = Self {
            dir: dir.to_path_buf(),
            state,
        };
        // Persist the recovery decision unconditionally.
        store.commit()?;
        Ok(store)
    }

    /// Durably replace the canonical document with the in-memory state.
    pub fn commit(&mut self) -> Result<()> {
        let canonical = self.dir.join(STATE_FILE);
        let pending = self.dir.join(PENDING_FILE);
        write_document(&pending, &self.state)?;
        remove_if_present(&canonical)?;
        fs::rename(&pending, &canonical)
            .with_context(|| format!("activate committed state in {}", self.dir.display()))?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn write_document(path: &Path, state: &StoredState) -> Result<()> {
    let json = serde_json::to_vec(state).context("serialize state document")?;
    let mut file = fs::File::create(path)
        .with_context(|| format!("create state file {}", path.display()))?;
    file.write_all(&json)
        .with_context(|| format!("write state file {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync state file {}", path.display()))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
