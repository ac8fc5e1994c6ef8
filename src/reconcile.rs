use crate::error::RemoteError;
use crate::model::{
    CanonicalEvent, EventOrigin, ReconcileAction, ReconciliationRecord, ReconciliationReport,
    normalize_title,
};
use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Stable identity over normalized title, start instant and all-day flag.
pub fn fingerprint(event: &CanonicalEvent) -> String {
    let identity = format!(
        "{}|{}|{}",
        normalize_title(&event.title),
        event
            .start
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        if event.all_day { "all-day" } else { "timed" }
    );
    let digest = Sha256::digest(identity.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Secondary keys naming the calendar slot an event occupies, most specific
/// first. They let a moved or renamed event find its earlier remote copy.
pub fn slot_keys(event: &CanonicalEvent) -> Vec<String> {
    let date = event.local_date();
    let clock = if event.all_day {
        "all-day".to_string()
    } else {
        event.local_time().format("%H:%M").to_string()
    };

    let mut keys = Vec::with_capacity(3);
    if let Some(url) = &event.source_url {
        keys.push(format!("link:{url}|{date}"));
    }
    keys.push(format!("title-day:{}|{date}", normalize_title(&event.title)));
    keys.push(format!("day-time:{date}|{clock}"));
    keys
}

/// Remote representation of an event. Field equality with the stored body
/// decides `skip` versus `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEventBody {
    pub summary: String,
    pub start: String,
    pub end: String,
    pub all_day: bool,
    pub timezone: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Calendar-wide fields folded into every remote representation.
#[derive(Debug, Clone, Default)]
pub struct EventMapping {
    pub timezone: String,
    pub location: Option<String>,
}

impl EventMapping {
    pub fn map(&self, event: &CanonicalEvent) -> RemoteEventBody {
        let (start, end) = if event.all_day {
            let first = event.local_date();
            let after = first + Duration::days(1);
            (first.to_string(), after.to_string())
        } else {
            (
                event.start.to_rfc3339_opts(SecondsFormat::Secs, false),
                event.end.to_rfc3339_opts(SecondsFormat::Secs, false),
            )
        };

        let description = match event.origin {
            EventOrigin::Scraped => None,
            EventOrigin::RecurringExpansion => event
                .pattern_label
                .as_ref()
                .map(|label| format!("Recurring: {label}")),
        };

        RemoteEventBody {
            summary: event.title.clone(),
            start,
            end,
            all_day: event.all_day,
            timezone: self.timezone.clone(),
            location: self.location.clone(),
            description,
            source_url: event.source_url.clone(),
        }
    }

    pub fn mapped(&self, event: &CanonicalEvent) -> MappedEvent {
        MappedEvent {
            fingerprint: fingerprint(event),
            slot_keys: slot_keys(event),
            body: self.map(event),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedEvent {
    pub fingerprint: String,
    pub slot_keys: Vec<String>,
    pub body: RemoteEventBody,
}

/// Remote calendar collaborator. Lookups must be side-effect free; only one
/// reconciliation pass may write to a given calendar at a time.
pub trait RemoteStore {
    fn lookup(&self, fingerprint: &str) -> Result<Option<String>, RemoteError>;

    fn lookup_slot(&self, slot_key: &str) -> Result<Option<String>, RemoteError>;

    fn stored_body(&self, remote_id: &str) -> Result<Option<RemoteEventBody>, RemoteError>;

    fn create(&mut self, event: &CanonicalEvent, mapped: &MappedEvent)
    -> Result<String, RemoteError>;

    fn update(
        &mut self,
        remote_id: &str,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
    ) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    #[default]
    Apply,
    /// Decide every action but never call `create`/`update`.
    DryRun,
}

enum Match {
    Found(String),
    Missing,
    Failed(RemoteError),
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    mapping: EventMapping,
    mode: ReconcileMode,
}

impl Reconciler {
    pub fn new(mapping: EventMapping, mode: ReconcileMode) -> Self {
        Self { mapping, mode }
    }

    pub fn reconcile<S: RemoteStore + ?Sized>(
        &self,
        local: &[CanonicalEvent],
        store: &mut S,
    ) -> ReconciliationReport {
        let mapped = local
            .iter()
            .map(|event| self.mapping.mapped(event))
            .collect::<Vec<_>>();

        // First occurrence of a fingerprint owns it; repeats are reported as skips.
        let mut first_index: HashMap<&str, usize> = HashMap::new();
        let duplicate_of = mapped
            .iter()
            .enumerate()
            .map(|(idx, m)| match first_index.get(m.fingerprint.as_str()) {
                Some(first) => Some(*first),
                None => {
                    first_index.insert(m.fingerprint.as_str(), idx);
                    None
                }
            })
            .collect::<Vec<_>>();

        let mut claimed = HashSet::new();
        let mut lookups = Vec::with_capacity(local.len());
        for (idx, m) in mapped.iter().enumerate() {
            if duplicate_of[idx].is_some() {
                lookups.push(Match::Missing);
                continue;
            }
            let found = match store.lookup(&m.fingerprint) {
                Ok(Some(id)) if claimed.insert(id.clone()) => Match::Found(id),
                Ok(_) => Match::Missing,
                Err(err) => Match::Failed(err),
            };
            lookups.push(found);
        }

        for (idx, m) in mapped.iter().enumerate() {
            if duplicate_of[idx].is_some() || !matches!(lookups[idx], Match::Missing) {
                continue;
            }
            for slot in &m.slot_keys {
                match store.lookup_slot(slot) {
                    Ok(Some(id)) if !claimed.contains(&id) => {
                        debug!(slot = %slot, remote_id = %id, "matched by slot");
                        claimed.insert(id.clone());
                        lookups[idx] = Match::Found(id);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        lookups[idx] = Match::Failed(err);
                        break;
                    }
                }
            }
        }

        let mut report = ReconciliationReport::default();
        let mut outcomes: Vec<Option<String>> = Vec::with_capacity(local.len());
        for (idx, (event, m)) in local.iter().zip(&mapped).enumerate() {
            let record = match (duplicate_of[idx], std::mem::replace(&mut lookups[idx], Match::Missing)) {
                (Some(first), _) => self.record(event, m, ReconcileAction::Skip, outcomes[first].clone(), None),
                (None, Match::Failed(err)) => self.failed(event, m, None, &err),
                (None, Match::Found(remote_id)) => self.settle_existing(event, m, remote_id, store),
                (None, Match::Missing) => self.create(event, m, store),
            };
            outcomes.push(record.remote_id.clone());
            report.push(record);
        }

        info!(
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            dry_run = self.mode == ReconcileMode::DryRun,
            "reconciliation complete"
        );
        report
    }

    fn settle_existing<S: RemoteStore + ?Sized>(
        &self,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
        remote_id: String,
        store: &mut S,
    ) -> ReconciliationRecord {
        let stored = match store.stored_body(&remote_id) {
            Ok(stored) => stored,
            Err(err) => return self.failed(event, mapped, Some(remote_id), &err),
        };

        let Some(stored) = stored else {
            debug!(remote_id = %remote_id, "remote entry vanished; recreating");
            return self.create(event, mapped, store);
        };

        if stored == mapped.body {
            return self.record(event, mapped, ReconcileAction::Skip, Some(remote_id), None);
        }

        if self.mode == ReconcileMode::DryRun {
            return self.record(event, mapped, ReconcileAction::Update, Some(remote_id), None);
        }

        match store.update(&remote_id, event, mapped) {
            Ok(()) => {
                info!(title = %event.title, start = %event.start, remote_id = %remote_id, "updated event");
                self.record(event, mapped, ReconcileAction::Update, Some(remote_id), None)
            }
            Err(err) => self.failed(event, mapped, Some(remote_id), &err),
        }
    }

    fn create<S: RemoteStore + ?Sized>(
        &self,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
        store: &mut S,
    ) -> ReconciliationRecord {
        if self.mode == ReconcileMode::DryRun {
            return self.record(event, mapped, ReconcileAction::Create, None, None);
        }

        match store.create(event, mapped) {
            Ok(remote_id) => {
                info!(title = %event.title, start = %event.start, remote_id = %remote_id, "created event");
                self.record(event, mapped, ReconcileAction::Create, Some(remote_id), None)
            }
            Err(err) => self.failed(event, mapped, None, &err),
        }
    }

    fn failed(
        &self,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
        remote_id: Option<String>,
        err: &RemoteError,
    ) -> ReconciliationRecord {
        warn!(title = %event.title, start = %event.start, error = %err, "remote operation failed");
        self.record(
            event,
            mapped,
            ReconcileAction::Failed,
            remote_id,
            Some(err.to_string()),
        )
    }

    fn record(
        &self,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
        action: ReconcileAction,
        remote_id: Option<String>,
        error: Option<String>,
    ) -> ReconciliationRecord {
        ReconciliationRecord {
            fingerprint: mapped.fingerprint.clone(),
            title: event.title.clone(),
            start: event.start,
            action,
            remote_id,
            error,
        }
    }
}
