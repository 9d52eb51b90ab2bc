//! Run state storage: atomic snapshot plus append-only history log.
//!
//! Every run owns a directory under the logs root containing `state.json`
//! (rewritten atomically on each mutation) and `history.log` (append-only
//! event lines). All mutations go through [`StateStore::update`] so the
//! snapshot and the log always advance together; readers may open either
//! file at any time and observe a consistent, possibly slightly stale view.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::core::types::{RunSnapshot, validate_snapshot};
use crate::error::LuigiError;

/// Single-writer store for one run's persisted state.
pub struct StateStore {
    run_dir: PathBuf,
    inner: Mutex<RunSnapshot>,
}

impl StateStore {
    /// Create the run directory and write the initial snapshot.
    pub fn create(logs_root: &Path, snapshot: RunSnapshot) -> Result<Self> {
        validate_run_id(&snapshot.run_id)?;
        let run_dir = logs_root.join(&snapshot.run_id);
        fs::create_dir_all(&run_dir).map_err(|err| {
            anyhow!(LuigiError::storage(format!(
                "create run dir {}: {err}",
                run_dir.display()
            )))
        })?;
        let store = Self {
            run_dir,
            inner: Mutex::new(snapshot),
        };
        store.persist_locked(&store.inner.lock().expect("state lock poisoned"))?;
        Ok(store)
    }

    /// Load an existing run's snapshot from disk.
    pub fn load(logs_root: &Path, run_id: &str) -> Result<Self> {
        validate_run_id(run_id)?;
        let run_dir = logs_root.join(run_id);
        let state_path = run_dir.join("state.json");
        let contents = fs::read_to_string(&state_path)
            .with_context(|| format!("read {}", state_path.display()))?;
        let snapshot: RunSnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", state_path.display()))?;
        Ok(Self {
            run_dir,
            inner: Mutex::new(snapshot),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.run_dir.join("prompts")
    }

    /// Cloned view of the current snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.inner.lock().expect("state lock poisoned").clone()
    }

    /// The mutation funnel: apply `mutate`, record `event` in the history
    /// log, and rewrite the snapshot atomically.
    pub fn update<T>(
        &self,
        event: &str,
        mutate: impl FnOnce(&mut RunSnapshot) -> T,
    ) -> Result<T> {
        let mut guard = self.inner.lock().expect("state lock poisoned");
        let value = mutate(&mut guard);
        let violations = validate_snapshot(&guard);
        if !violations.is_empty() {
            warn!(?violations, "snapshot invariants violated after mutation");
        }
        self.append_history(event)?;
        self.persist_locked(&guard)?;
        debug!(event, "state updated");
        Ok(value)
    }

    /// Record an event without mutating the snapshot.
    pub fn note(&self, event: &str) -> Result<()> {
        self.update(event, |_| ())
    }

    fn append_history(&self, event: &str) -> Result<()> {
        let line = format!(
            "[{}] {event}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let path = self.run_dir.join("history.log");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                anyhow!(LuigiError::storage(format!(
                    "open {}: {err}",
                    path.display()
                )))
            })?;
        file.write_all(line.as_bytes()).map_err(|err| {
            anyhow!(LuigiError::storage(format!(
                "append {}: {err}",
                path.display()
            )))
        })?;
        Ok(())
    }

    /// Atomic snapshot write: sibling temp file, fsync, rename.
    fn persist_locked(&self, snapshot: &RunSnapshot) -> Result<()> {
        let path = self.run_dir.join("state.json");
        let tmp_path = self.run_dir.join("state.json.tmp");
        let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
        buf.push('\n');

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(buf.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        };
        write().map_err(|err| {
            anyhow!(LuigiError::storage(format!(
                "write {}: {err}",
                path.display()
            )))
        })?;
        Ok(())
    }
}

/// Run ids double as directory names; refuse anything that could escape the
/// logs root.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let trimmed = run_id.trim();
    if trimmed.is_empty() {
        return Err(anyhow!(LuigiError::config("run id must be non-empty")));
    }
    if trimmed == "." || trimmed.contains("..") {
        return Err(anyhow!(LuigiError::config(format!(
            "invalid run id {trimmed:?}"
        ))));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(anyhow!(LuigiError::config(format!(
            "run id must not contain path separators: {trimmed:?}"
        ))));
    }
    Ok(())
}
