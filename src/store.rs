use crate::error::RemoteError;
use crate::model::CanonicalEvent;
use crate::reconcile::{MappedEvent, RemoteEventBody, RemoteStore};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub fingerprint: String,
    pub slot_keys: Vec<String>,
    pub body: RemoteEventBody,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed remote store: remote id → last written representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub schema_version: u32,
    pub calendar_key: String,
    pub events: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    pub fn new(calendar_key: &str) -> Self {
        Self {
            schema_version: 1,
            calendar_key: calendar_key.to_string(),
            events: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn next_remote_id(&self, fingerprint: &str) -> String {
        let base = format!("evt-{}", &fingerprint[..fingerprint.len().min(16)]);
        if !self.events.contains_key(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.events.contains_key(candidate))
            .unwrap_or(base)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new("")
    }
}

impl RemoteStore for Ledger {
    fn lookup(&self, fingerprint: &str) -> Result<Option<String>, RemoteError> {
        Ok(self
            .events
            .iter()
            .find(|(_, entry)| entry.fingerprint == fingerprint)
            .map(|(id, _)| id.clone()))
    }

    fn lookup_slot(&self, slot_key: &str) -> Result<Option<String>, RemoteError> {
        Ok(self
            .events
            .iter()
            .find(|(_, entry)| entry.slot_keys.iter().any(|k| k == slot_key))
            .map(|(id, _)| id.clone()))
    }

    fn stored_body(&self, remote_id: &str) -> Result<Option<RemoteEventBody>, RemoteError> {
        Ok(self.events.get(remote_id).map(|entry| entry.body.clone()))
    }

    fn create(
        &mut self,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
    ) -> Result<String, RemoteError> {
        let now = Utc::now();
        let remote_id = self.next_remote_id(&mapped.fingerprint);
        debug!(remote_id = %remote_id, title = %event.title, "ledger insert");
        self.events.insert(
            remote_id.clone(),
            LedgerEntry {
                fingerprint: mapped.fingerprint.clone(),
                slot_keys: mapped.slot_keys.clone(),
                body: mapped.body.clone(),
                revision: 0,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(remote_id)
    }

    fn update(
        &mut self,
        remote_id: &str,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
    ) -> Result<(), RemoteError> {
        let entry = self
            .events
            .get_mut(remote_id)
            .ok_or_else(|| RemoteError::Rejected(format!("unknown remote id {remote_id}")))?;
        debug!(remote_id = %remote_id, title = %event.title, "ledger update");
        entry.fingerprint = mapped.fingerprint.clone();
        entry.slot_keys = mapped.slot_keys.clone();
        entry.body = mapped.body.clone();
        entry.revision = entry.revision.saturating_add(1);
        entry.updated_at = Utc::now();
        Ok(())
    }
}

pub fn ledger_path(state_dir: &Path, calendar_dir_name: &str) -> PathBuf {
    state_dir.join(format!("{calendar_dir_name}.json"))
}

pub fn load_ledger(path: &Path, calendar_key: &str) -> Result<Ledger> {
    if !path.exists() {
        return Ok(Ledger::new(calendar_key));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger file {}", path.display()))?;
    let ledger: Ledger = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse ledger file {}", path.display()))?;
    if ledger.calendar_key != calendar_key {
        warn!(
            file = %path.display(),
            expected = calendar_key,
            found = %ledger.calendar_key,
            "ledger belongs to a different calendar key"
        );
    }
    Ok(ledger)
}

pub fn save_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state directory {}", parent.display()))?;
    }

    let serialized = serde_json::to_string_pretty(ledger)?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed to write ledger file {}", path.display()))?;
    Ok(())
}

/// Exclusive writer token for one calendar's ledger, held for the duration of
/// a reconciliation pass. The OS lock goes away with the file handle; a pass
/// that dies without unwinding leaves only an unlocked `.lock` file.
#[derive(Debug)]
pub struct CalendarLock {
    file: File,
    path: PathBuf,
}

impl CalendarLock {
    pub fn acquire(ledger_path: &Path) -> Result<Self> {
        let path = ledger_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "calendar ledger is locked by another pass ({})",
                path.display()
            )
        })?;
        debug!(file = %path.display(), "calendar lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CalendarLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(file = %self.path.display(), error = %err, "failed to release calendar lock");
        }
    }
}
