use anyhow::Result;
use chrono::NaiveDate;
use chrono_tz::America::New_York;
use fcsync::error::RemoteError;
use fcsync::model::{CanonicalEvent, RawEventFragment, ReconcileAction};
use fcsync::normalize::Normalizer;
use fcsync::reconcile::{
    EventMapping, MappedEvent, ReconcileMode, Reconciler, RemoteEventBody, RemoteStore,
    fingerprint,
};
use fcsync::store::Ledger;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
}

fn event(title: &str, time: Option<&str>, day: NaiveDate) -> Result<CanonicalEvent> {
    let (event, _) = Normalizer::new(New_York, 60).canonicalize(RawEventFragment {
        title_text: title.to_string(),
        time_text: time.map(str::to_string),
        date_context: Some(day),
        source_url: None,
    })?;
    Ok(event)
}

fn reconciler(mode: ReconcileMode) -> Reconciler {
    Reconciler::new(
        EventMapping {
            timezone: "America/New_York".to_string(),
            location: Some("Antioch Boone".to_string()),
        },
        mode,
    )
}

fn week() -> Result<Vec<CanonicalEvent>> {
    Ok(vec![
        event("Early Morning Prayer", Some("6:30a"), date(2025, 9, 2))?,
        event("Evening Prayer", Some("5:15p"), date(2025, 9, 2))?,
        event("Church Potluck", None, date(2025, 9, 6))?,
    ])
}

/// Ledger that refuses to create one title, as a flaky remote would.
struct FlakyStore {
    inner: Ledger,
    failing_title: String,
}

impl RemoteStore for FlakyStore {
    fn lookup(&self, fingerprint: &str) -> Result<Option<String>, RemoteError> {
        self.inner.lookup(fingerprint)
    }

    fn lookup_slot(&self, slot_key: &str) -> Result<Option<String>, RemoteError> {
        self.inner.lookup_slot(slot_key)
    }

    fn stored_body(&self, remote_id: &str) -> Result<Option<RemoteEventBody>, RemoteError> {
        self.inner.stored_body(remote_id)
    }

    fn create(
        &mut self,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
    ) -> Result<String, RemoteError> {
        if event.title == self.failing_title {
            return Err(RemoteError::Transient("503 from calendar api".to_string()));
        }
        self.inner.create(event, mapped)
    }

    fn update(
        &mut self,
        remote_id: &str,
        event: &CanonicalEvent,
        mapped: &MappedEvent,
    ) -> Result<(), RemoteError> {
        self.inner.update(remote_id, event, mapped)
    }
}

#[test]
fn fingerprint_ignores_case_and_spacing_of_title() -> Result<()> {
    let a = event("Evening Prayer", Some("5:15p"), date(2025, 9, 2))?;
    let b = event("evening   PRAYER", Some("17:15"), date(2025, 9, 2))?;
    let c = event("Evening Prayer", Some("5:15p"), date(2025, 9, 3))?;
    assert_eq!(fingerprint(&a), fingerprint(&b));
    assert_ne!(fingerprint(&a), fingerprint(&c));
    assert_eq!(fingerprint(&a).len(), 32);
    Ok(())
}

#[test]
fn second_pass_over_unchanged_input_only_skips() -> Result<()> {
    let events = week()?;
    let mut ledger = Ledger::new("church");

    let first = reconciler(ReconcileMode::Apply).reconcile(&events, &mut ledger);
    assert_eq!(first.created, 3);
    assert_eq!(ledger.len(), 3);
    assert!(first.records.iter().all(|r| r.remote_id.is_some()));

    let second = reconciler(ReconcileMode::Apply).reconcile(&events, &mut ledger);
    assert_eq!((second.created, second.updated, second.skipped, second.failed), (0, 0, 3, 0));
    assert_eq!(ledger.len(), 3);
    Ok(())
}

#[test]
fn time_shift_updates_existing_remote_event() -> Result<()> {
    let mut ledger = Ledger::new("church");
    reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut ledger);

    let mut moved = week()?;
    moved[0] = event("Early Morning Prayer", Some("7a"), date(2025, 9, 2))?;
    let report = reconciler(ReconcileMode::Apply).reconcile(&moved, &mut ledger);

    assert_eq!((report.created, report.updated, report.skipped), (0, 1, 2));
    assert_eq!(ledger.len(), 3);
    let entry = ledger
        .events
        .values()
        .find(|entry| entry.body.summary == "Early Morning Prayer")
        .expect("entry kept");
    assert_eq!(entry.revision, 1);
    assert_eq!(entry.body.start, "2025-09-02T07:00:00-04:00");
    assert_eq!(entry.fingerprint, fingerprint(&moved[0]));
    Ok(())
}

#[test]
fn title_edit_updates_existing_remote_event() -> Result<()> {
    let mut ledger = Ledger::new("church");
    reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut ledger);

    let mut renamed = week()?;
    renamed[1] = event("Evening Prayer & Praise", Some("5:15p"), date(2025, 9, 2))?;
    let report = reconciler(ReconcileMode::Apply).reconcile(&renamed, &mut ledger);

    assert_eq!((report.created, report.updated, report.skipped), (0, 1, 2));
    assert!(
        ledger
            .events
            .values()
            .any(|entry| entry.body.summary == "Evening Prayer & Praise")
    );
    Ok(())
}

#[test]
fn transient_failure_is_recorded_and_pass_continues() -> Result<()> {
    let mut store = FlakyStore {
        inner: Ledger::new("church"),
        failing_title: "Evening Prayer".to_string(),
    };

    let report = reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut store);
    assert_eq!((report.created, report.failed), (2, 1));

    let failed = report.failures().next().expect("one failure");
    assert_eq!(failed.title, "Evening Prayer");
    assert_eq!(failed.action, ReconcileAction::Failed);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("503")));
    assert_eq!(store.inner.len(), 2);

    // next pass retries the failed event
    store.failing_title.clear();
    let retry = reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut store);
    assert_eq!((retry.created, retry.skipped, retry.failed), (1, 2, 0));
    Ok(())
}

#[test]
fn dry_run_plans_without_writing() -> Result<()> {
    let mut ledger = Ledger::new("church");
    let report = reconciler(ReconcileMode::DryRun).reconcile(&week()?, &mut ledger);

    assert_eq!(report.created, 3);
    assert!(ledger.is_empty());
    assert!(report.records.iter().all(|r| r.remote_id.is_none()));
    Ok(())
}

#[test]
fn repeated_fingerprint_in_one_pass_is_skipped() -> Result<()> {
    let mut events = week()?;
    events.push(event("early morning prayer", Some("6:30a"), date(2025, 9, 2))?);
    let mut ledger = Ledger::new("church");

    let report = reconciler(ReconcileMode::Apply).reconcile(&events, &mut ledger);
    assert_eq!((report.created, report.skipped), (3, 1));
    assert_eq!(ledger.len(), 3);
    assert_eq!(report.records[3].remote_id, report.records[0].remote_id);
    Ok(())
}

#[test]
fn mapped_body_carries_calendar_fields() -> Result<()> {
    let mapping = EventMapping {
        timezone: "America/New_York".to_string(),
        location: Some("Antioch Boone".to_string()),
    };
    let potluck = event("Church Potluck", None, date(2025, 9, 6))?;
    let body = mapping.map(&potluck);

    assert!(body.all_day);
    assert_eq!(body.start, "2025-09-06");
    assert_eq!(body.end, "2025-09-07");
    assert_eq!(body.location.as_deref(), Some("Antioch Boone"));
    assert_eq!(body.description, None);
    Ok(())
}

#[test]
fn remote_edit_to_any_field_is_overwritten() -> Result<()> {
    let mut ledger = Ledger::new("church");
    reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut ledger);

    let entry = ledger
        .events
        .values_mut()
        .find(|entry| entry.body.summary == "Church Potluck")
        .expect("potluck stored");
    entry.body.description = Some("bring a dish".to_string());

    let report = reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut ledger);
    assert_eq!((report.created, report.updated, report.skipped), (0, 1, 2));

    let entry = ledger
        .events
        .values()
        .find(|entry| entry.body.summary == "Church Potluck")
        .expect("potluck kept");
    assert_eq!(entry.body.description, None);
    assert_eq!(entry.revision, 1);

    let again = reconciler(ReconcileMode::Apply).reconcile(&week()?, &mut ledger);
    assert_eq!((again.updated, again.skipped), (0, 3));
    Ok(())
}
