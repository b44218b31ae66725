//! Core domain model for recruitment session reconciliation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recruit-core";

/// Session length assumed when a record has no explicit duration.
pub const DEFAULT_SESSION_DURATION_MINUTES: i32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantCategory {
    External,
    Internal,
    FriendFamily,
}

impl ParticipantCategory {
    pub const ALL: [ParticipantCategory; 3] = [
        ParticipantCategory::External,
        ParticipantCategory::Internal,
        ParticipantCategory::FriendFamily,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantCategory::External => "external",
            ParticipantCategory::Internal => "internal",
            ParticipantCategory::FriendFamily => "friend-family",
        }
    }
}

impl fmt::Display for ParticipantCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown participant category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for ParticipantCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_name(s).as_str() {
            "external" => Ok(ParticipantCategory::External),
            "internal" => Ok(ParticipantCategory::Internal),
            "friendfamily" | "friendsfamily" => Ok(ParticipantCategory::FriendFamily),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

/// The participant assigned to a recruitment, if any.
///
/// Stores keep three nullable foreign keys; this is the single place that
/// decides which one counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "category", content = "id", rename_all = "kebab-case")]
pub enum ParticipantRef {
    #[default]
    None,
    External(Uuid),
    Internal(Uuid),
    FriendFamily(Uuid),
}

impl ParticipantRef {
    /// Builds the variant from the three nullable columns, preferring external,
    /// then internal, then friend-family. The second value reports whether more
    /// than one column was set.
    pub fn from_columns(
        external: Option<Uuid>,
        internal: Option<Uuid>,
        friend_family: Option<Uuid>,
    ) -> (Self, bool) {
        let set = [external, internal, friend_family]
            .iter()
            .filter(|v| v.is_some())
            .count();
        let participant = match (external, internal, friend_family) {
            (Some(id), _, _) => ParticipantRef::External(id),
            (None, Some(id), _) => ParticipantRef::Internal(id),
            (None, None, Some(id)) => ParticipantRef::FriendFamily(id),
            (None, None, None) => ParticipantRef::None,
        };
        (participant, set > 1)
    }

    pub fn new(category: ParticipantCategory, id: Uuid) -> Self {
        match category {
            ParticipantCategory::External => ParticipantRef::External(id),
            ParticipantCategory::Internal => ParticipantRef::Internal(id),
            ParticipantCategory::FriendFamily => ParticipantRef::FriendFamily(id),
        }
    }

    pub fn is_assigned(&self) -> bool {
        !matches!(self, ParticipantRef::None)
    }

    pub fn category(&self) -> Option<ParticipantCategory> {
        match self {
            ParticipantRef::None => None,
            ParticipantRef::External(_) => Some(ParticipantCategory::External),
            ParticipantRef::Internal(_) => Some(ParticipantCategory::Internal),
            ParticipantRef::FriendFamily(_) => Some(ParticipantCategory::FriendFamily),
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            ParticipantRef::None => None,
            ParticipantRef::External(id)
            | ParticipantRef::Internal(id)
            | ParticipantRef::FriendFamily(id) => Some(*id),
        }
    }
}

/// One recruitment: a single participant's planned or completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecruitmentRecord {
    pub id: Uuid,
    pub investigation_id: Uuid,
    /// Wall-clock start in the organisation's civil time.
    pub session_start: Option<NaiveDateTime>,
    pub session_duration_minutes: Option<i32>,
    pub state_id: Uuid,
    pub participant: ParticipantRef,
    pub facilitator_id: Option<Uuid>,
}

impl RecruitmentRecord {
    pub fn has_participant(&self) -> bool {
        self.participant.is_assigned()
    }

    pub fn duration_minutes(&self) -> i32 {
        self.session_duration_minutes
            .unwrap_or(DEFAULT_SESSION_DURATION_MINUTES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulingState {
    Pending,
    PendingScheduling,
    InProgress,
    Finished,
    Cancelled,
}

impl SchedulingState {
    pub const ALL: [SchedulingState; 5] = [
        SchedulingState::Pending,
        SchedulingState::PendingScheduling,
        SchedulingState::InProgress,
        SchedulingState::Finished,
        SchedulingState::Cancelled,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SchedulingState::Pending => "Pending",
            SchedulingState::PendingScheduling => "PendingScheduling",
            SchedulingState::InProgress => "InProgress",
            SchedulingState::Finished => "Finished",
            SchedulingState::Cancelled => "Cancelled",
        }
    }

    /// Matches a catalog name, ignoring case, spaces and punctuation.
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = normalize_name(name);
        Self::ALL
            .into_iter()
            .find(|state| normalize_name(state.name()) == wanted)
    }

    /// States the reconciler is allowed to replace.
    pub fn is_overwritable(self) -> bool {
        matches!(
            self,
            SchedulingState::Pending | SchedulingState::PendingScheduling
        )
    }
}

impl fmt::Display for SchedulingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn normalize_name(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// A row of the scheduling state catalog as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingStateRow {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("scheduling state catalog has no `{0}` state")]
    MissingState(SchedulingState),
    #[error("scheduling state `{state}` appears more than once (ids {first} and {second})")]
    DuplicateState {
        state: SchedulingState,
        first: Uuid,
        second: Uuid,
    },
}

/// Name to id resolution for one run. Built fresh from the store each time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCatalog {
    ids: HashMap<SchedulingState, Uuid>,
    states: HashMap<Uuid, SchedulingState>,
    names: HashMap<Uuid, String>,
}

impl StateCatalog {
    /// Pending, InProgress and Finished must be present; everything the
    /// reconciler writes resolves to one of them.
    pub const REQUIRED: [SchedulingState; 3] = [
        SchedulingState::Pending,
        SchedulingState::InProgress,
        SchedulingState::Finished,
    ];

    pub fn from_rows(rows: &[SchedulingStateRow]) -> Result<Self, CatalogError> {
        let mut ids = HashMap::new();
        let mut states = HashMap::new();
        let mut names = HashMap::new();

        for row in rows {
            names.insert(row.id, row.name.clone());
            let Some(state) = SchedulingState::from_name(&row.name) else {
                continue;
            };
            if let Some(first) = ids.insert(state, row.id) {
                if first != row.id {
                    return Err(CatalogError::DuplicateState {
                        state,
                        first,
                        second: row.id,
                    });
                }
            }
            states.insert(row.id, state);
        }

        for state in Self::REQUIRED {
            if !ids.contains_key(&state) {
                return Err(CatalogError::MissingState(state));
            }
        }

        Ok(Self { ids, states, names })
    }

    pub fn id_of(&self, state: SchedulingState) -> Option<Uuid> {
        self.ids.get(&state).copied()
    }

    /// Id of a state guaranteed by [`StateCatalog::REQUIRED`].
    pub fn required(&self, state: SchedulingState) -> Result<Uuid, CatalogError> {
        self.id_of(state).ok_or(CatalogError::MissingState(state))
    }

    pub fn pending(&self) -> Uuid {
        self.ids[&SchedulingState::Pending]
    }

    pub fn in_progress(&self) -> Uuid {
        self.ids[&SchedulingState::InProgress]
    }

    pub fn finished(&self) -> Uuid {
        self.ids[&SchedulingState::Finished]
    }

    pub fn state_of(&self, id: Uuid) -> Option<SchedulingState> {
        self.states.get(&id).copied()
    }

    pub fn name_of(&self, id: Uuid) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn is_overwritable(&self, id: Uuid) -> bool {
        self.state_of(id)
            .map(SchedulingState::is_overwritable)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Cancelled,
    Rescheduled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Rescheduled => "rescheduled",
        }
    }

    /// Coarse mapping used by history backfill. Every state that is neither
    /// Finished nor Cancelled, including never-scheduled ones, reports as
    /// rescheduled.
    pub fn from_state(state: Option<SchedulingState>) -> Self {
        match state {
            Some(SchedulingState::Finished) => SessionStatus::Completed,
            Some(SchedulingState::Cancelled) => SessionStatus::Cancelled,
            _ => SessionStatus::Rescheduled,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup identity of a history row within one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryKey {
    pub participant_id: Uuid,
    pub investigation_id: Uuid,
    pub participation_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationHistoryRecord {
    pub category: ParticipantCategory,
    pub participant_id: Uuid,
    pub investigation_id: Uuid,
    /// Only backfilled rows keep a link to their recruitment.
    pub recruitment_id: Option<Uuid>,
    pub participation_date: NaiveDate,
    pub session_status: SessionStatus,
    pub duration_minutes: i32,
    pub facilitator_id: Option<Uuid>,
    pub observations: String,
    pub created_by: Option<Uuid>,
}

impl ParticipationHistoryRecord {
    pub fn key(&self) -> HistoryKey {
        HistoryKey {
            participant_id: self.participant_id,
            investigation_id: self.investigation_id,
            participation_date: self.participation_date,
        }
    }
}

/// Which history rows a backfill or resync touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillScope {
    pub category: ParticipantCategory,
    pub investigation_id: Option<Uuid>,
}

impl BackfillScope {
    pub fn category(category: ParticipantCategory) -> Self {
        Self {
            category,
            investigation_id: None,
        }
    }

    pub fn covers(&self, record: &RecruitmentRecord) -> bool {
        record.participant.category() == Some(self.category)
            && self
                .investigation_id
                .map_or(true, |id| id == record.investigation_id)
    }
}

/// Counts produced by a single pass of the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub updated: usize,
    pub unchanged: usize,
    pub errors: Vec<Uuid>,
    pub total: usize,
    /// Records never started because the run deadline passed.
    pub skipped: usize,
    pub deadline_exceeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: Vec<Uuid>,
    pub total: usize,
    pub skipped: usize,
    pub deadline_exceeded: bool,
}

impl RunSummary {
    pub fn from_reconcile(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        evaluated_at: DateTime<Utc>,
        summary: ReconcileSummary,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at,
            evaluated_at,
            updated: summary.updated,
            unchanged: summary.unchanged,
            errors: summary.errors,
            total: summary.total,
            skipped: summary.skipped,
            deadline_exceeded: summary.deadline_exceeded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub category: Option<ParticipantCategory>,
    pub inserted: usize,
    pub deleted_before_insert: usize,
    pub candidates: usize,
    pub duplicates_skipped: usize,
}

/// A write the reconciler would perform, reported by dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTransition {
    pub recruitment_id: Uuid,
    pub from_state: Uuid,
    pub to_state: Uuid,
    pub from_name: Option<String>,
    pub to_name: Option<String>,
}
