use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use recruit_core::{
    BackfillScope, HistoryKey, ParticipantCategory, ParticipantRef, ParticipationHistoryRecord,
    RecruitmentRecord, SchedulingStateRow,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    CalendarNotifier, HistoryReplacement, HistoryStore, NotifyError, RecruitmentStore, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<RecruitmentRecord>,
    states: Vec<SchedulingStateRow>,
    investigations: HashMap<Uuid, String>,
    participants: HashMap<(ParticipantCategory, Uuid), String>,
    history: Vec<ParticipationHistoryRecord>,
    update_calls: usize,
    fail_catalog: bool,
    fail_record_load: bool,
    fail_participant_lookups: bool,
    fail_history: bool,
    fail_history_inserts: bool,
    fail_updates_for: HashSet<Uuid>,
    interleaved_writes: HashMap<Uuid, Uuid>,
}

/// Process-local store with the same semantics as the Postgres backend,
/// including unique history keys and compare-and-swap state writes. Failure
/// switches let callers exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(states: Vec<SchedulingStateRow>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                states,
                ..Default::default()
            }),
        }
    }

    pub async fn insert_record(&self, record: RecruitmentRecord) {
        let mut state = self.state.lock().await;
        state.records.retain(|r| r.id != record.id);
        state.records.push(record);
    }

    pub async fn insert_investigation(&self, id: Uuid, name: impl Into<String>) {
        self.state.lock().await.investigations.insert(id, name.into());
    }

    pub async fn insert_participant(&self, participant: ParticipantRef, name: impl Into<String>) {
        if let (Some(category), Some(id)) = (participant.category(), participant.id()) {
            self.state
                .lock()
                .await
                .participants
                .insert((category, id), name.into());
        }
    }

    pub async fn push_history(&self, record: ParticipationHistoryRecord) {
        self.state.lock().await.history.push(record);
    }

    pub async fn record(&self, id: Uuid) -> Option<RecruitmentRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn history(&self, category: ParticipantCategory) -> Vec<ParticipationHistoryRecord> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.category == category)
            .cloned()
            .collect()
    }

    pub async fn update_calls(&self) -> usize {
        self.state.lock().await.update_calls
    }

    pub async fn fail_catalog_loads(&self) {
        self.state.lock().await.fail_catalog = true;
    }

    pub async fn fail_record_loads(&self) {
        self.state.lock().await.fail_record_load = true;
    }

    pub async fn fail_participant_lookups(&self) {
        self.state.lock().await.fail_participant_lookups = true;
    }

    pub async fn fail_history_access(&self) {
        self.state.lock().await.fail_history = true;
    }

    /// Fails only the insert step of history writes; reads and deletes work.
    pub async fn fail_history_inserts(&self) {
        self.state.lock().await.fail_history_inserts = true;
    }

    pub async fn fail_updates_for(&self, id: Uuid) {
        self.state.lock().await.fail_updates_for.insert(id);
    }

    /// Simulates another writer moving `id` to `state_id` just before the
    /// next state update for that record lands.
    pub async fn interleave_write(&self, id: Uuid, state_id: Uuid) {
        self.state.lock().await.interleaved_writes.insert(id, state_id);
    }
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{what} disabled for this store"))
}

#[async_trait]
impl RecruitmentStore for MemoryStore {
    async fn load_all_recruitment_records(&self) -> Result<Vec<RecruitmentRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_record_load {
            return Err(unavailable("recruitment reads"));
        }
        Ok(state.records.clone())
    }

    async fn load_scheduling_states(&self) -> Result<Vec<SchedulingStateRow>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_catalog {
            return Err(unavailable("catalog reads"));
        }
        Ok(state.states.clone())
    }

    async fn update_recruitment_state(
        &self,
        id: Uuid,
        expected_state: Uuid,
        new_state: Uuid,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.update_calls += 1;
        if state.fail_updates_for.contains(&id) {
            return Err(unavailable("state writes"));
        }
        let interleaved = state.interleaved_writes.remove(&id);
        let Some(record) = state.records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if let Some(other) = interleaved {
            record.state_id = other;
        }
        if record.state_id != expected_state {
            return Ok(false);
        }
        record.state_id = new_state;
        Ok(true)
    }

    async fn load_investigation_names(&self) -> Result<HashMap<Uuid, String>, StoreError> {
        Ok(self.state.lock().await.investigations.clone())
    }

    async fn find_participant_name(
        &self,
        participant: ParticipantRef,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_participant_lookups {
            return Err(unavailable("participant lookups"));
        }
        let (Some(category), Some(id)) = (participant.category(), participant.id()) else {
            return Ok(None);
        };
        Ok(state.participants.get(&(category, id)).cloned())
    }

    async fn load_participant_names(
        &self,
        category: ParticipantCategory,
    ) -> Result<HashMap<Uuid, String>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_participant_lookups {
            return Err(unavailable("participant lookups"));
        }
        Ok(state
            .participants
            .iter()
            .filter(|((c, _), _)| *c == category)
            .map(|((_, id), name)| (*id, name.clone()))
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn find_existing_history(
        &self,
        category: ParticipantCategory,
        key: &HistoryKey,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        if state.fail_history {
            return Err(unavailable("history access"));
        }
        Ok(state
            .history
            .iter()
            .any(|h| h.category == category && h.key() == *key))
    }

    async fn load_history_keys(
        &self,
        scope: &BackfillScope,
    ) -> Result<HashSet<HistoryKey>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_history {
            return Err(unavailable("history access"));
        }
        Ok(state
            .history
            .iter()
            .filter(|h| in_scope(scope, h))
            .map(ParticipationHistoryRecord::key)
            .collect())
    }

    async fn insert_history_records(
        &self,
        category: ParticipantCategory,
        records: &[ParticipationHistoryRecord],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_history {
            return Err(unavailable("history access"));
        }
        if state.fail_history_inserts {
            return Err(unavailable("history inserts"));
        }
        check_category(category, records)?;
        Ok(push_new_rows(&mut state.history, records))
    }

    async fn delete_all_history(&self, scope: &BackfillScope) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_history {
            return Err(unavailable("history access"));
        }
        let before = state.history.len();
        state.history.retain(|h| !in_scope(scope, h));
        Ok(before - state.history.len())
    }

    async fn replace_history(
        &self,
        scope: &BackfillScope,
        records: &[ParticipationHistoryRecord],
    ) -> Result<HistoryReplacement, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_history {
            return Err(unavailable("history access"));
        }
        check_category(scope.category, records)?;

        let mut kept = state
            .history
            .iter()
            .filter(|h| !in_scope(scope, h))
            .cloned()
            .collect::<Vec<_>>();
        let deleted = state.history.len() - kept.len();
        if state.fail_history_inserts {
            return Err(unavailable("history inserts"));
        }
        let inserted = push_new_rows(&mut kept, records);
        state.history = kept;
        Ok(HistoryReplacement { deleted, inserted })
    }
}

fn in_scope(scope: &BackfillScope, row: &ParticipationHistoryRecord) -> bool {
    row.category == scope.category
        && scope
            .investigation_id
            .map_or(true, |id| id == row.investigation_id)
}

fn check_category(
    category: ParticipantCategory,
    records: &[ParticipationHistoryRecord],
) -> Result<(), StoreError> {
    match records.iter().find(|r| r.category != category) {
        Some(stray) => Err(StoreError::InvalidRow {
            table: "participation_history",
            message: format!("{} row passed to the {} table", stray.category, category),
        }),
        None => Ok(()),
    }
}

/// Appends rows whose key is not taken yet; mirrors `ON CONFLICT DO NOTHING`.
fn push_new_rows(
    history: &mut Vec<ParticipationHistoryRecord>,
    records: &[ParticipationHistoryRecord],
) -> usize {
    let mut inserted = 0;
    for record in records {
        let exists = history
            .iter()
            .any(|h| h.category == record.category && h.key() == record.key());
        if !exists {
            history.push(record.clone());
            inserted += 1;
        }
    }
    inserted
}

/// Records notifications instead of sending them.
#[derive(Debug, Default)]
pub struct MemoryCalendarNotifier {
    calls: Mutex<Vec<Uuid>>,
    fail: bool,
    delay: Option<Duration>,
}

impl MemoryCalendarNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CalendarNotifier for MemoryCalendarNotifier {
    async fn notify_calendar_sync(&self, recruitment_id: Uuid) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().await.push(recruitment_id);
        if self.fail {
            return Err(NotifyError::Rejected(format!(
                "calendar unavailable for {recruitment_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use recruit_core::SessionStatus;

    fn history_row(participant_id: Uuid, investigation_id: Uuid) -> ParticipationHistoryRecord {
        ParticipationHistoryRecord {
            category: ParticipantCategory::Internal,
            participant_id,
            investigation_id,
            recruitment_id: None,
            participation_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            session_status: SessionStatus::Completed,
            duration_minutes: 60,
            facilitator_id: None,
            observations: String::new(),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn state_update_is_compare_and_swap() {
        let store = MemoryStore::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let id = Uuid::new_v4();
        store
            .insert_record(RecruitmentRecord {
                id,
                investigation_id: Uuid::new_v4(),
                session_start: None,
                session_duration_minutes: None,
                state_id: a,
                participant: ParticipantRef::None,
                facilitator_id: None,
            })
            .await;

        assert!(!store.update_recruitment_state(id, b, c).await.unwrap());
        assert!(store.update_recruitment_state(id, a, c).await.unwrap());
        assert_eq!(store.record(id).await.unwrap().state_id, c);
        assert_eq!(store.update_calls().await, 2);
    }

    #[tokio::test]
    async fn history_inserts_skip_existing_keys() {
        let store = MemoryStore::default();
        let participant = Uuid::new_v4();
        let investigation = Uuid::new_v4();
        let row = history_row(participant, investigation);
        let inserted = store
            .insert_history_records(ParticipantCategory::Internal, &[row.clone(), row.clone()])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert!(store
            .find_existing_history(ParticipantCategory::Internal, &row.key())
            .await
            .unwrap());
        assert!(!store
            .find_existing_history(ParticipantCategory::External, &row.key())
            .await
            .unwrap());

        let deleted = store
            .delete_all_history(&BackfillScope::category(ParticipantCategory::Internal))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.history(ParticipantCategory::Internal).await.is_empty());
    }

    #[tokio::test]
    async fn replace_history_is_all_or_nothing() {
        let store = MemoryStore::default();
        let investigation = Uuid::new_v4();
        let old = history_row(Uuid::new_v4(), investigation);
        let other = history_row(Uuid::new_v4(), Uuid::new_v4());
        store.push_history(old.clone()).await;
        store.push_history(other.clone()).await;
        let scope = BackfillScope {
            category: ParticipantCategory::Internal,
            investigation_id: Some(investigation),
        };

        let fresh = history_row(Uuid::new_v4(), investigation);
        store.fail_history_inserts().await;
        assert!(store.replace_history(&scope, &[fresh.clone()]).await.is_err());
        assert_eq!(store.history(ParticipantCategory::Internal).await.len(), 2);

        store.state.lock().await.fail_history_inserts = false;
        let replaced = store.replace_history(&scope, &[fresh.clone()]).await.unwrap();
        assert_eq!(replaced, HistoryReplacement { deleted: 1, inserted: 1 });
        let keys = store
            .history(ParticipantCategory::Internal)
            .await
            .iter()
            .map(ParticipationHistoryRecord::key)
            .collect::<HashSet<_>>();
        assert!(keys.contains(&fresh.key()));
        assert!(keys.contains(&other.key()));
        assert!(!keys.contains(&old.key()));
    }
}
