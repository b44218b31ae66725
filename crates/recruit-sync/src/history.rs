//! Participation history: the per-transition append and the bulk backfill.

use std::collections::HashSet;
use std::sync::Arc;

use recruit_core::{
    BackfillScope, BackfillSummary, ParticipationHistoryRecord, RecruitmentRecord, SessionStatus,
    StateCatalog,
};
use recruit_storage::{HistoryStore, RecruitmentStore, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoParticipant,
    NotScheduled,
    ParticipantMissing,
    LookupFailed,
    DedupCheckFailed,
    InsertFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOneOutcome {
    Inserted,
    Duplicate,
    Skipped(SkipReason),
}

pub struct HistorySynchronizer {
    records: Arc<dyn RecruitmentStore>,
    history: Arc<dyn HistoryStore>,
    created_by: Option<Uuid>,
}

impl HistorySynchronizer {
    pub fn new(
        records: Arc<dyn RecruitmentStore>,
        history: Arc<dyn HistoryStore>,
        created_by: Option<Uuid>,
    ) -> Self {
        Self {
            records,
            history,
            created_by,
        }
    }

    /// Appends a `completed` row for a record that just finished. Every
    /// failure is logged and reported as a skip.
    pub async fn sync_one(&self, record: &RecruitmentRecord) -> SyncOneOutcome {
        let (Some(category), Some(participant_id)) =
            (record.participant.category(), record.participant.id())
        else {
            debug!(recruitment_id = %record.id, "no participant; nothing to record");
            return SyncOneOutcome::Skipped(SkipReason::NoParticipant);
        };
        let Some(session_start) = record.session_start else {
            warn!(recruitment_id = %record.id, "finished recruitment has no session start");
            return SyncOneOutcome::Skipped(SkipReason::NotScheduled);
        };

        let participant_name = match self.records.find_participant_name(record.participant).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                warn!(recruitment_id = %record.id, %category, %participant_id, "participant not found; history not recorded");
                return SyncOneOutcome::Skipped(SkipReason::ParticipantMissing);
            }
            Err(err) => {
                warn!(recruitment_id = %record.id, %category, error = %err, "participant lookup failed; history not recorded");
                return SyncOneOutcome::Skipped(SkipReason::LookupFailed);
            }
        };

        let row = ParticipationHistoryRecord {
            category,
            participant_id,
            investigation_id: record.investigation_id,
            recruitment_id: None,
            participation_date: session_start.date(),
            session_status: SessionStatus::Completed,
            duration_minutes: record.duration_minutes(),
            facilitator_id: record.facilitator_id,
            observations: format!("{participant_name} completed the scheduled session"),
            created_by: self.created_by,
        };

        match self.history.find_existing_history(category, &row.key()).await {
            Ok(true) => {
                debug!(recruitment_id = %record.id, %category, "history row already present");
                return SyncOneOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(recruitment_id = %record.id, %category, error = %err, "history dedup check failed");
                return SyncOneOutcome::Skipped(SkipReason::DedupCheckFailed);
            }
        }

        match self.history.insert_history_records(category, &[row]).await {
            Ok(0) => SyncOneOutcome::Duplicate,
            Ok(_) => {
                info!(recruitment_id = %record.id, %category, "participation history recorded");
                SyncOneOutcome::Inserted
            }
            Err(err) => {
                warn!(recruitment_id = %record.id, %category, error = %err, "history insert failed");
                SyncOneOutcome::Skipped(SkipReason::InsertFailed)
            }
        }
    }

    /// Regenerates missing history rows for every scheduled recruitment in
    /// `scope`. Existing rows are never duplicated.
    pub async fn rebuild(
        &self,
        scope: &BackfillScope,
        catalog: &StateCatalog,
    ) -> Result<BackfillSummary, StoreError> {
        let (mut summary, rows) = self.prepare_rows(scope, catalog, true).await?;
        summary.inserted = self
            .history
            .insert_history_records(scope.category, &rows)
            .await?;
        info!(
            category = %scope.category,
            candidates = summary.candidates,
            inserted = summary.inserted,
            duplicates = summary.duplicates_skipped,
            "participation history backfill complete"
        );
        Ok(summary)
    }

    /// Replaces the scope's history with freshly built rows. Only ever run on
    /// an explicit operator request. Rows are built before anything is
    /// deleted and the store swaps them in as one unit, so a failure leaves
    /// the existing history in place.
    pub async fn destructive_resync(
        &self,
        scope: &BackfillScope,
        catalog: &StateCatalog,
    ) -> Result<BackfillSummary, StoreError> {
        let (mut summary, rows) = self.prepare_rows(scope, catalog, false).await?;
        let replaced = self.history.replace_history(scope, &rows).await?;
        summary.deleted_before_insert = replaced.deleted;
        summary.inserted = replaced.inserted;
        warn!(
            category = %scope.category,
            investigation_id = ?scope.investigation_id,
            deleted = replaced.deleted,
            inserted = replaced.inserted,
            "participation history replaced by resync"
        );
        Ok(summary)
    }

    /// Builds backfill rows for `scope`. With `skip_existing`, keys already in
    /// the history table are left out; either way a key appears once.
    async fn prepare_rows(
        &self,
        scope: &BackfillScope,
        catalog: &StateCatalog,
        skip_existing: bool,
    ) -> Result<(BackfillSummary, Vec<ParticipationHistoryRecord>), StoreError> {
        let records = self.records.load_all_recruitment_records().await?;
        let candidates = records
            .iter()
            .filter(|r| scope.covers(r) && r.session_start.is_some())
            .collect::<Vec<_>>();

        let existing = async {
            if skip_existing {
                self.history.load_history_keys(scope).await
            } else {
                Ok(HashSet::new())
            }
        };
        let (participants, investigations, mut seen) = tokio::try_join!(
            self.records.load_participant_names(scope.category),
            self.records.load_investigation_names(),
            existing,
        )?;

        let mut summary = BackfillSummary {
            category: Some(scope.category),
            candidates: candidates.len(),
            ..Default::default()
        };
        let mut rows = Vec::with_capacity(candidates.len());

        for record in candidates {
            let (Some(participant_id), Some(session_start)) =
                (record.participant.id(), record.session_start)
            else {
                continue;
            };
            let Some(participant_name) = participants.get(&participant_id) else {
                warn!(recruitment_id = %record.id, %participant_id, "participant missing; skipping backfill row");
                continue;
            };
            let investigation = investigations
                .get(&record.investigation_id)
                .map(String::as_str)
                .unwrap_or("unknown investigation");
            let state_name = catalog.name_of(record.state_id).unwrap_or("unknown state");

            let row = ParticipationHistoryRecord {
                category: scope.category,
                participant_id,
                investigation_id: record.investigation_id,
                recruitment_id: Some(record.id),
                participation_date: session_start.date(),
                session_status: SessionStatus::from_state(catalog.state_of(record.state_id)),
                duration_minutes: record.duration_minutes(),
                facilitator_id: record.facilitator_id,
                observations: format!(
                    "{participant_name} / {investigation}: backfilled from recruitment state {state_name}"
                ),
                created_by: self.created_by,
            };

            if !seen.insert(row.key()) {
                summary.duplicates_skipped += 1;
                continue;
            }
            rows.push(row);
        }

        Ok((summary, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use recruit_core::{ParticipantCategory, ParticipantRef, SchedulingState, SchedulingStateRow};
    use recruit_storage::MemoryStore;

    fn catalog_rows() -> Vec<SchedulingStateRow> {
        SchedulingState::ALL
            .iter()
            .map(|s| SchedulingStateRow {
                id: Uuid::new_v4(),
                name: s.name().to_string(),
            })
            .collect()
    }

    fn start(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    struct Setup {
        store: Arc<MemoryStore>,
        catalog: StateCatalog,
        sync: HistorySynchronizer,
        investigation: Uuid,
    }

    async fn setup() -> Setup {
        let rows = catalog_rows();
        let catalog = StateCatalog::from_rows(&rows).unwrap();
        let store = Arc::new(MemoryStore::new(rows));
        let investigation = Uuid::new_v4();
        store.insert_investigation(investigation, "Checkout usability").await;
        let sync = HistorySynchronizer::new(store.clone(), store.clone(), None);
        Setup {
            store,
            catalog,
            sync,
            investigation,
        }
    }

    async fn add_record(
        s: &Setup,
        state: SchedulingState,
        participant: ParticipantRef,
        session_start: Option<NaiveDateTime>,
    ) -> RecruitmentRecord {
        s.store.insert_participant(participant, "Ada Lovelace").await;
        let record = RecruitmentRecord {
            id: Uuid::new_v4(),
            investigation_id: s.investigation,
            session_start,
            session_duration_minutes: Some(45),
            state_id: s.catalog.id_of(state).unwrap(),
            participant,
            facilitator_id: Some(Uuid::new_v4()),
        };
        s.store.insert_record(record.clone()).await;
        record
    }

    #[tokio::test]
    async fn sync_one_inserts_once_per_day() {
        let s = setup().await;
        let participant = ParticipantRef::External(Uuid::new_v4());
        let record = add_record(&s, SchedulingState::Finished, participant, Some(start(2))).await;

        assert_eq!(s.sync.sync_one(&record).await, SyncOneOutcome::Inserted);
        assert_eq!(s.sync.sync_one(&record).await, SyncOneOutcome::Duplicate);

        let rows = s.store.history(ParticipantCategory::External).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_status, SessionStatus::Completed);
        assert_eq!(rows[0].duration_minutes, 45);
        assert_eq!(rows[0].recruitment_id, None);
        assert_eq!(rows[0].participation_date, start(2).date());
    }

    #[tokio::test]
    async fn sync_one_swallows_lookup_failures() {
        let s = setup().await;
        let record = add_record(
            &s,
            SchedulingState::Finished,
            ParticipantRef::Internal(Uuid::new_v4()),
            Some(start(2)),
        )
        .await;
        s.store.fail_participant_lookups().await;
        assert_eq!(
            s.sync.sync_one(&record).await,
            SyncOneOutcome::Skipped(SkipReason::LookupFailed)
        );
        assert!(s.store.history(ParticipantCategory::Internal).await.is_empty());
    }

    #[tokio::test]
    async fn sync_one_skips_unknown_participant() {
        let s = setup().await;
        let mut record = add_record(
            &s,
            SchedulingState::Finished,
            ParticipantRef::Internal(Uuid::new_v4()),
            Some(start(2)),
        )
        .await;
        record.participant = ParticipantRef::Internal(Uuid::new_v4());
        assert_eq!(
            s.sync.sync_one(&record).await,
            SyncOneOutcome::Skipped(SkipReason::ParticipantMissing)
        );
    }

    #[tokio::test]
    async fn rebuild_maps_states_and_is_idempotent() {
        let s = setup().await;
        let category = ParticipantCategory::FriendFamily;
        let finished = add_record(&s, SchedulingState::Finished, ParticipantRef::FriendFamily(Uuid::new_v4()), Some(start(2))).await;
        let cancelled = add_record(&s, SchedulingState::Cancelled, ParticipantRef::FriendFamily(Uuid::new_v4()), Some(start(3))).await;
        let pending = add_record(&s, SchedulingState::Pending, ParticipantRef::FriendFamily(Uuid::new_v4()), Some(start(4))).await;
        // not eligible: no session, wrong category
        add_record(&s, SchedulingState::Finished, ParticipantRef::FriendFamily(Uuid::new_v4()), None).await;
        add_record(&s, SchedulingState::Finished, ParticipantRef::External(Uuid::new_v4()), Some(start(2))).await;

        let scope = BackfillScope::category(category);
        let first = s.sync.rebuild(&scope, &s.catalog).await.unwrap();
        assert_eq!(first.candidates, 3);
        assert_eq!(first.inserted, 3);

        let rows = s.store.history(category).await;
        let status_of = |id: Uuid| {
            rows.iter()
                .find(|r| r.recruitment_id == Some(id))
                .map(|r| r.session_status)
        };
        assert_eq!(status_of(finished.id), Some(SessionStatus::Completed));
        assert_eq!(status_of(cancelled.id), Some(SessionStatus::Cancelled));
        assert_eq!(status_of(pending.id), Some(SessionStatus::Rescheduled));

        let second = s.sync.rebuild(&scope, &s.catalog).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates_skipped, 3);
        assert!(s.store.history(ParticipantCategory::External).await.is_empty());
    }

    #[tokio::test]
    async fn rebuild_dedups_within_one_batch() {
        let s = setup().await;
        let participant = ParticipantRef::Internal(Uuid::new_v4());
        add_record(&s, SchedulingState::Cancelled, participant, Some(start(5))).await;
        let mut later = start(5);
        later += chrono::Duration::hours(4);
        add_record(&s, SchedulingState::Finished, participant, Some(later)).await;

        let summary = s
            .sync
            .rebuild(&BackfillScope::category(ParticipantCategory::Internal), &s.catalog)
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn destructive_resync_reports_deleted_rows() {
        let s = setup().await;
        let participant = ParticipantRef::External(Uuid::new_v4());
        let record = add_record(&s, SchedulingState::Finished, participant, Some(start(6))).await;
        assert_eq!(s.sync.sync_one(&record).await, SyncOneOutcome::Inserted);

        let scope = BackfillScope {
            category: ParticipantCategory::External,
            investigation_id: Some(s.investigation),
        };
        let summary = s.sync.destructive_resync(&scope, &s.catalog).await.unwrap();
        assert_eq!(summary.deleted_before_insert, 1);
        assert_eq!(summary.inserted, 1);

        let rows = s.store.history(ParticipantCategory::External).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recruitment_id, Some(record.id));
    }

    #[tokio::test]
    async fn failed_resync_keeps_existing_history() {
        let s = setup().await;
        let participant = ParticipantRef::External(Uuid::new_v4());
        let record = add_record(&s, SchedulingState::Finished, participant, Some(start(6))).await;
        assert_eq!(s.sync.sync_one(&record).await, SyncOneOutcome::Inserted);
        let scope = BackfillScope::category(ParticipantCategory::External);

        s.store.fail_participant_lookups().await;
        assert!(s.sync.destructive_resync(&scope, &s.catalog).await.is_err());
        assert_eq!(s.store.history(ParticipantCategory::External).await.len(), 1);

        let s = setup().await;
        let record = add_record(&s, SchedulingState::Finished, participant, Some(start(6))).await;
        assert_eq!(s.sync.sync_one(&record).await, SyncOneOutcome::Inserted);
        s.store.fail_history_inserts().await;
        assert!(s.sync.destructive_resync(&scope, &s.catalog).await.is_err());
        let rows = s.store.history(ParticipantCategory::External).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recruitment_id, None);
    }

    #[tokio::test]
    async fn rebuild_propagates_store_failures() {
        let s = setup().await;
        add_record(&s, SchedulingState::Finished, ParticipantRef::External(Uuid::new_v4()), Some(start(2))).await;
        s.store.fail_history_access().await;
        assert!(s
            .sync
            .rebuild(&BackfillScope::category(ParticipantCategory::External), &s.catalog)
            .await
            .is_err());
    }
}
