//! Time-window state computation and the per-record write loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use recruit_core::{PlannedTransition, RecruitmentRecord, ReconcileSummary, StateCatalog};
use recruit_storage::{CalendarNotifier, RecruitmentStore, StoreError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::HistorySynchronizer;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recruitment {id} has a session start but a non-positive duration ({minutes} min)")]
    InvalidDuration { id: Uuid, minutes: i32 },
    #[error("writing state of recruitment {id}: {source}")]
    Store {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

/// Interprets a stored wall-clock time in `tz`. Repeated local times resolve to
/// the earlier instant; times skipped by a DST jump move forward by an hour.
pub fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .unwrap_or_else(|| tz.from_utc_datetime(&naive))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    Before,
    Within,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl SessionWindow {
    /// `None` when the record has no session scheduled.
    pub fn for_record(record: &RecruitmentRecord, tz: &Tz) -> Result<Option<Self>, RecordError> {
        let Some(naive_start) = record.session_start else {
            return Ok(None);
        };
        let minutes = record.duration_minutes();
        if minutes <= 0 {
            return Err(RecordError::InvalidDuration {
                id: record.id,
                minutes,
            });
        }
        let start = resolve_local(tz, naive_start);
        let end = start + chrono::Duration::minutes(i64::from(minutes));
        Ok(Some(Self { start, end }))
    }

    /// Both window edges count as inside.
    pub fn position(&self, now: &DateTime<Tz>) -> WindowPosition {
        if *now < self.start {
            WindowPosition::Before
        } else if *now <= self.end {
            WindowPosition::Within
        } else {
            WindowPosition::After
        }
    }
}

/// The state a record should hold at `now`, ignoring the overwrite guard.
pub fn target_state(
    record: &RecruitmentRecord,
    catalog: &StateCatalog,
    now: &DateTime<Tz>,
    tz: &Tz,
) -> Result<Uuid, RecordError> {
    let waiting = if record.has_participant() {
        catalog.in_progress()
    } else {
        catalog.pending()
    };

    let Some(window) = SessionWindow::for_record(record, tz)? else {
        return Ok(waiting);
    };

    Ok(match window.position(now) {
        WindowPosition::Before => waiting,
        WindowPosition::Within => catalog.in_progress(),
        WindowPosition::After if record.state_id == catalog.finished() => record.state_id,
        WindowPosition::After => catalog.finished(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Write { from: Uuid, to: Uuid },
    /// Current state is outside the overwritable set.
    Protected { current: Uuid, target: Uuid },
    AlreadyAtTarget,
}

pub fn decide(
    record: &RecruitmentRecord,
    catalog: &StateCatalog,
    now: &DateTime<Tz>,
    tz: &Tz,
) -> Result<Decision, RecordError> {
    let target = target_state(record, catalog, now, tz)?;
    let current = record.state_id;
    if !catalog.is_overwritable(current) {
        return Ok(Decision::Protected { current, target });
    }
    if target == current {
        return Ok(Decision::AlreadyAtTarget);
    }
    Ok(Decision::Write {
        from: current,
        to: target,
    })
}

/// Dry run over already-loaded records. Invalid records are left out.
pub fn plan(
    catalog: &StateCatalog,
    records: &[RecruitmentRecord],
    now: DateTime<Utc>,
    tz: &Tz,
) -> Vec<PlannedTransition> {
    let now = now.with_timezone(tz);
    records
        .iter()
        .filter_map(|record| match decide(record, catalog, &now, tz) {
            Ok(Decision::Write { from, to }) => Some(PlannedTransition {
                recruitment_id: record.id,
                from_state: from,
                to_state: to,
                from_name: catalog.name_of(from).map(str::to_string),
                to_name: catalog.name_of(to).map(str::to_string),
            }),
            Ok(_) => None,
            Err(err) => {
                warn!(recruitment_id = %record.id, error = %err, "skipping invalid recruitment in plan");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Updated,
    Unchanged,
}

pub struct Reconciler {
    records: Arc<dyn RecruitmentStore>,
    calendar: Arc<dyn CalendarNotifier>,
    history: HistorySynchronizer,
    tz: Tz,
    side_effect_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        records: Arc<dyn RecruitmentStore>,
        calendar: Arc<dyn CalendarNotifier>,
        history: HistorySynchronizer,
        tz: Tz,
        side_effect_timeout: Duration,
    ) -> Self {
        Self {
            records,
            calendar,
            history,
            tz,
            side_effect_timeout,
        }
    }

    /// One pass over `records`. Per-record failures end up in
    /// `summary.errors`; nothing here aborts the pass.
    pub async fn reconcile(
        &self,
        catalog: &StateCatalog,
        records: &[RecruitmentRecord],
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> ReconcileSummary {
        let now = now.with_timezone(&self.tz);
        let mut summary = ReconcileSummary {
            total: records.len(),
            ..Default::default()
        };

        for (index, record) in records.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                summary.skipped = records.len() - index;
                summary.deadline_exceeded = true;
                warn!(
                    processed = index,
                    skipped = summary.skipped,
                    "reconciliation deadline reached; not starting remaining records"
                );
                break;
            }

            match self.process_record(catalog, record, &now).await {
                Ok(RecordOutcome::Updated) => summary.updated += 1,
                Ok(RecordOutcome::Unchanged) => summary.unchanged += 1,
                Err(err) => {
                    warn!(recruitment_id = %record.id, error = %err, "failed to reconcile recruitment");
                    summary.errors.push(record.id);
                }
            }
        }

        summary
    }

    async fn process_record(
        &self,
        catalog: &StateCatalog,
        record: &RecruitmentRecord,
        now: &DateTime<Tz>,
    ) -> Result<RecordOutcome, RecordError> {
        let (from, to) = match decide(record, catalog, now, &self.tz)? {
            Decision::Write { from, to } => (from, to),
            Decision::Protected { current, target } => {
                if current != target {
                    debug!(
                        recruitment_id = %record.id,
                        current = catalog.name_of(current).unwrap_or("unknown"),
                        target = catalog.name_of(target).unwrap_or("unknown"),
                        "state is not overwritable; leaving it"
                    );
                }
                return Ok(RecordOutcome::Unchanged);
            }
            Decision::AlreadyAtTarget => return Ok(RecordOutcome::Unchanged),
        };

        let written = self
            .records
            .update_recruitment_state(record.id, from, to)
            .await
            .map_err(|source| RecordError::Store {
                id: record.id,
                source,
            })?;
        if !written {
            info!(
                recruitment_id = %record.id,
                "state changed by another writer since it was read; skipping"
            );
            return Ok(RecordOutcome::Unchanged);
        }

        info!(
            recruitment_id = %record.id,
            from = catalog.name_of(from).unwrap_or("unknown"),
            to = catalog.name_of(to).unwrap_or("unknown"),
            "recruitment state updated"
        );

        if to == catalog.finished() {
            self.after_finished(record).await;
        }
        Ok(RecordOutcome::Updated)
    }

    /// History and calendar side effects of a Finished transition. Both run
    /// to completion (or timeout) and neither can fail the record.
    async fn after_finished(&self, record: &RecruitmentRecord) {
        let history = tokio::time::timeout(self.side_effect_timeout, self.history.sync_one(record));
        let calendar = tokio::time::timeout(
            self.side_effect_timeout,
            self.calendar.notify_calendar_sync(record.id),
        );
        let (history, calendar) = tokio::join!(history, calendar);

        match history {
            Ok(outcome) => debug!(recruitment_id = %record.id, ?outcome, "history sync finished"),
            Err(_) => warn!(
                recruitment_id = %record.id,
                timeout_ms = self.side_effect_timeout.as_millis() as u64,
                "history sync timed out"
            ),
        }
        match calendar {
            Ok(Ok(())) => debug!(recruitment_id = %record.id, "calendar sync requested"),
            Ok(Err(err)) => {
                warn!(recruitment_id = %record.id, error = %err, "calendar sync notification failed")
            }
            Err(_) => warn!(
                recruitment_id = %record.id,
                timeout_ms = self.side_effect_timeout.as_millis() as u64,
                "calendar sync notification timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono_tz::America::{Mexico_City, New_York};
    use recruit_core::{ParticipantRef, SchedulingState, SchedulingStateRow};

    struct Fixture {
        catalog: StateCatalog,
        ids: Vec<Uuid>,
    }

    impl Fixture {
        fn new() -> Self {
            let rows = SchedulingState::ALL
                .iter()
                .map(|s| SchedulingStateRow {
                    id: Uuid::new_v4(),
                    name: s.name().to_string(),
                })
                .collect::<Vec<_>>();
            Self {
                catalog: StateCatalog::from_rows(&rows).expect("catalog"),
                ids: rows.iter().map(|r| r.id).collect(),
            }
        }

        fn id(&self, state: SchedulingState) -> Uuid {
            self.catalog.id_of(state).expect("state present")
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn local_now(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
        tz.from_local_datetime(&naive).single().unwrap()
    }

    fn record(
        state_id: Uuid,
        start: Option<NaiveDateTime>,
        participant: ParticipantRef,
    ) -> RecruitmentRecord {
        RecruitmentRecord {
            id: Uuid::new_v4(),
            investigation_id: Uuid::new_v4(),
            session_start: start,
            session_duration_minutes: Some(60),
            state_id,
            participant,
            facilitator_id: None,
        }
    }

    #[test]
    fn unscheduled_target_depends_only_on_participant() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let now = local_now(&tz, at(2026, 3, 2, 9, 0));
        for current in fx.ids.iter().copied() {
            let with = record(current, None, ParticipantRef::External(Uuid::new_v4()));
            let without = record(current, None, ParticipantRef::None);
            assert_eq!(
                target_state(&with, &fx.catalog, &now, &tz).unwrap(),
                fx.id(SchedulingState::InProgress)
            );
            assert_eq!(
                target_state(&without, &fx.catalog, &now, &tz).unwrap(),
                fx.id(SchedulingState::Pending)
            );
        }
    }

    #[test]
    fn window_edges_are_inclusive() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let r = record(
            fx.id(SchedulingState::Pending),
            Some(at(2026, 3, 2, 10, 0)),
            ParticipantRef::None,
        );
        for (h, m) in [(10, 0), (10, 30), (11, 0)] {
            let now = local_now(&tz, at(2026, 3, 2, h, m));
            assert_eq!(
                target_state(&r, &fx.catalog, &now, &tz).unwrap(),
                fx.id(SchedulingState::InProgress),
                "{h}:{m:02} should be inside the window"
            );
        }
        let before = local_now(&tz, at(2026, 3, 2, 9, 59));
        assert_eq!(
            target_state(&r, &fx.catalog, &before, &tz).unwrap(),
            fx.id(SchedulingState::Pending)
        );
        let after = local_now(&tz, at(2026, 3, 2, 11, 1));
        assert_eq!(
            target_state(&r, &fx.catalog, &after, &tz).unwrap(),
            fx.id(SchedulingState::Finished)
        );
    }

    #[test]
    fn missing_duration_defaults_to_an_hour() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let mut r = record(
            fx.id(SchedulingState::Pending),
            Some(at(2026, 3, 2, 10, 0)),
            ParticipantRef::None,
        );
        r.session_duration_minutes = None;
        let now = local_now(&tz, at(2026, 3, 2, 10, 59));
        assert_eq!(
            target_state(&r, &fx.catalog, &now, &tz).unwrap(),
            fx.id(SchedulingState::InProgress)
        );
    }

    #[test]
    fn zero_duration_is_a_record_error() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let mut r = record(
            fx.id(SchedulingState::Pending),
            Some(at(2026, 3, 2, 10, 0)),
            ParticipantRef::None,
        );
        r.session_duration_minutes = Some(0);
        let now = local_now(&tz, at(2026, 3, 2, 10, 0));
        assert!(matches!(
            decide(&r, &fx.catalog, &now, &tz),
            Err(RecordError::InvalidDuration { minutes: 0, .. })
        ));
    }

    #[test]
    fn pending_record_inside_window_is_written_in_progress() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let r = record(
            fx.id(SchedulingState::Pending),
            Some(at(2026, 3, 2, 10, 0)),
            ParticipantRef::None,
        );
        let now = local_now(&tz, at(2026, 3, 2, 10, 30));
        assert_eq!(
            decide(&r, &fx.catalog, &now, &tz).unwrap(),
            Decision::Write {
                from: fx.id(SchedulingState::Pending),
                to: fx.id(SchedulingState::InProgress),
            }
        );
    }

    #[test]
    fn in_progress_record_past_window_is_protected() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let r = record(
            fx.id(SchedulingState::InProgress),
            Some(at(2026, 3, 2, 10, 0)),
            ParticipantRef::Internal(Uuid::new_v4()),
        );
        let now = local_now(&tz, at(2026, 3, 2, 11, 30));
        assert_eq!(
            decide(&r, &fx.catalog, &now, &tz).unwrap(),
            Decision::Protected {
                current: fx.id(SchedulingState::InProgress),
                target: fx.id(SchedulingState::Finished),
            }
        );
    }

    #[test]
    fn finished_and_unknown_states_are_never_rewritten() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let now = local_now(&tz, at(2026, 3, 2, 10, 30));
        for current in [
            fx.id(SchedulingState::Finished),
            fx.id(SchedulingState::Cancelled),
            Uuid::new_v4(),
        ] {
            for start in [None, Some(at(2026, 3, 2, 10, 0)), Some(at(2026, 2, 1, 10, 0))] {
                let r = record(current, start, ParticipantRef::External(Uuid::new_v4()));
                assert!(matches!(
                    decide(&r, &fx.catalog, &now, &tz).unwrap(),
                    Decision::Protected { .. }
                ));
            }
        }
        let finished = record(
            fx.id(SchedulingState::Finished),
            Some(at(2026, 2, 1, 10, 0)),
            ParticipantRef::None,
        );
        assert_eq!(
            target_state(&finished, &fx.catalog, &now, &tz).unwrap(),
            fx.id(SchedulingState::Finished)
        );
    }

    #[test]
    fn pending_scheduling_with_participant_moves_in_progress() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let r = record(
            fx.id(SchedulingState::PendingScheduling),
            None,
            ParticipantRef::FriendFamily(Uuid::new_v4()),
        );
        let now = local_now(&tz, at(2026, 7, 9, 18, 0));
        assert_eq!(
            decide(&r, &fx.catalog, &now, &tz).unwrap(),
            Decision::Write {
                from: fx.id(SchedulingState::PendingScheduling),
                to: fx.id(SchedulingState::InProgress),
            }
        );
    }

    #[test]
    fn windows_are_compared_in_local_time_across_dst() {
        // 2026-03-08 02:30 does not exist in New York; clocks jump 02:00 -> 03:00.
        let tz = New_York;
        let gap = resolve_local(&tz, at(2026, 3, 8, 2, 30));
        assert_eq!(gap.naive_local(), at(2026, 3, 8, 3, 30));

        // 2026-11-01 01:30 happens twice; the first (EDT) occurrence wins.
        let overlap = resolve_local(&tz, at(2026, 11, 1, 1, 30));
        assert_eq!(
            overlap.with_timezone(&Utc).naive_utc(),
            at(2026, 11, 1, 5, 30)
        );

        // A 09:00 local session on the first EDT day starts at 13:00 UTC, not 14:00.
        let fx = Fixture::new();
        let r = record(
            fx.id(SchedulingState::Pending),
            Some(at(2026, 3, 8, 9, 0)),
            ParticipantRef::None,
        );
        let now = Utc
            .from_utc_datetime(&at(2026, 3, 8, 13, 30))
            .with_timezone(&tz);
        assert_eq!(
            target_state(&r, &fx.catalog, &now, &tz).unwrap(),
            fx.id(SchedulingState::InProgress)
        );
    }

    #[test]
    fn plan_reports_only_writes() {
        let fx = Fixture::new();
        let tz = Mexico_City;
        let write = record(fx.id(SchedulingState::Pending), None, ParticipantRef::Internal(Uuid::new_v4()));
        let keep = record(fx.id(SchedulingState::InProgress), None, ParticipantRef::None);
        let mut broken = record(
            fx.id(SchedulingState::Pending),
            Some(at(2026, 3, 2, 10, 0)),
            ParticipantRef::None,
        );
        broken.session_duration_minutes = Some(-5);
        let now = Utc.from_utc_datetime(&at(2026, 3, 2, 12, 0));

        let planned = plan(&fx.catalog, &[write.clone(), keep, broken], now, &tz);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].recruitment_id, write.id);
        assert_eq!(planned[0].to_name.as_deref(), Some("InProgress"));
    }
}
