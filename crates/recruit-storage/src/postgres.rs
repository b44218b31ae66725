use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use recruit_core::{
    BackfillScope, HistoryKey, ParticipantCategory, ParticipantRef, ParticipationHistoryRecord,
    RecruitmentRecord, SchedulingStateRow,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::warn;
use uuid::Uuid;

use crate::{HistoryReplacement, HistoryStore, RecruitmentStore, StoreError};

/// Rows per INSERT statement; keeps bind parameters well under the
/// Postgres limit of 65535.
const HISTORY_INSERT_CHUNK: usize = 1000;

/// Table and column names that differ between participant categories.
#[derive(Debug, Clone, Copy)]
struct CategoryTables {
    participants: &'static str,
    history: &'static str,
    participant_column: &'static str,
    duration_column: &'static str,
}

fn tables(category: ParticipantCategory) -> CategoryTables {
    match category {
        ParticipantCategory::External => CategoryTables {
            participants: "external_participants",
            history: "external_participation_history",
            participant_column: "external_participant_id",
            duration_column: "duration_minutes",
        },
        ParticipantCategory::Internal => CategoryTables {
            participants: "internal_participants",
            history: "internal_participation_history",
            participant_column: "internal_participant_id",
            duration_column: "session_duration_minutes",
        },
        ParticipantCategory::FriendFamily => CategoryTables {
            participants: "friend_family_participants",
            history: "friend_family_participation_history",
            participant_column: "friend_family_participant_id",
            duration_column: "duration_minutes",
        },
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the SQL migrations found in `dir`.
    pub async fn migrate(&self, dir: &Path) -> anyhow::Result<()> {
        let migrator = Migrator::new(dir)
            .await
            .with_context(|| format!("loading migrations from {}", dir.display()))?;
        migrator
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(())
    }
}

fn recruitment_from_row(row: &PgRow) -> Result<RecruitmentRecord, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let (participant, conflicting) = ParticipantRef::from_columns(
        row.try_get("external_participant_id")?,
        row.try_get("internal_participant_id")?,
        row.try_get("friend_family_participant_id")?,
    );
    if conflicting {
        warn!(
            recruitment_id = %id,
            kept = ?participant.category(),
            "recruitment references more than one participant"
        );
    }
    Ok(RecruitmentRecord {
        id,
        investigation_id: row.try_get("investigation_id")?,
        session_start: row.try_get::<Option<NaiveDateTime>, _>("session_start")?,
        session_duration_minutes: row.try_get("session_duration_minutes")?,
        state_id: row.try_get("state_id")?,
        participant,
        facilitator_id: row.try_get("facilitator_id")?,
    })
}

fn names_from_rows(rows: Vec<PgRow>) -> Result<HashMap<Uuid, String>, StoreError> {
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        out.insert(row.try_get("id")?, row.try_get("name")?);
    }
    Ok(out)
}

#[async_trait]
impl RecruitmentStore for PgStore {
    async fn load_all_recruitment_records(&self) -> Result<Vec<RecruitmentRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id,
                   investigation_id,
                   session_start,
                   session_duration_minutes,
                   state_id,
                   external_participant_id,
                   internal_participant_id,
                   friend_family_participant_id,
                   facilitator_id
              FROM recruitments
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(recruitment_from_row).collect()
    }

    async fn load_scheduling_states(&self) -> Result<Vec<SchedulingStateRow>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM scheduling_states ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SchedulingStateRow {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn update_recruitment_state(
        &self,
        id: Uuid,
        expected_state: Uuid,
        new_state: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE recruitments
               SET state_id = $1,
                   updated_at = NOW()
             WHERE id = $2
               AND state_id = $3
            "#,
        )
        .bind(new_state)
        .bind(id)
        .bind(expected_state)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_investigation_names(&self) -> Result<HashMap<Uuid, String>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM investigations")
            .fetch_all(&self.pool)
            .await?;
        names_from_rows(rows)
    }

    async fn find_participant_name(
        &self,
        participant: ParticipantRef,
    ) -> Result<Option<String>, StoreError> {
        let (Some(category), Some(id)) = (participant.category(), participant.id()) else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT full_name FROM {} WHERE id = $1",
            tables(category).participants
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(row.try_get("full_name")?)),
            None => Ok(None),
        }
    }

    async fn load_participant_names(
        &self,
        category: ParticipantCategory,
    ) -> Result<HashMap<Uuid, String>, StoreError> {
        let sql = format!(
            "SELECT id, full_name AS name FROM {}",
            tables(category).participants
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        names_from_rows(rows)
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn find_existing_history(
        &self,
        category: ParticipantCategory,
        key: &HistoryKey,
    ) -> Result<bool, StoreError> {
        let t = tables(category);
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM {}
                 WHERE {} = $1
                   AND investigation_id = $2
                   AND participation_date = $3
            ) AS found
            "#,
            t.history, t.participant_column
        );
        let row = sqlx::query(&sql)
            .bind(key.participant_id)
            .bind(key.investigation_id)
            .bind(key.participation_date)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("found")?)
    }

    async fn load_history_keys(
        &self,
        scope: &BackfillScope,
    ) -> Result<HashSet<HistoryKey>, StoreError> {
        let t = tables(scope.category);
        let sql = format!(
            r#"
            SELECT {} AS participant_id, investigation_id, participation_date
              FROM {}
             WHERE ($1::uuid IS NULL OR investigation_id = $1)
            "#,
            t.participant_column, t.history
        );
        let rows = sqlx::query(&sql)
            .bind(scope.investigation_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(HistoryKey {
                participant_id: row.try_get("participant_id")?,
                investigation_id: row.try_get("investigation_id")?,
                participation_date: row.try_get::<NaiveDate, _>("participation_date")?,
            });
        }
        Ok(out)
    }

    async fn insert_history_records(
        &self,
        category: ParticipantCategory,
        records: &[ParticipationHistoryRecord],
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        check_category(category, records)?;

        let mut tx = self.pool.begin().await?;
        let inserted = insert_chunks(&mut tx, category, records).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_all_history(&self, scope: &BackfillScope) -> Result<usize, StoreError> {
        let result = sqlx::query(&delete_scope_sql(scope))
            .bind(scope.investigation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn replace_history(
        &self,
        scope: &BackfillScope,
        records: &[ParticipationHistoryRecord],
    ) -> Result<HistoryReplacement, StoreError> {
        check_category(scope.category, records)?;

        // Dropping the transaction on an early return rolls the delete back.
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&delete_scope_sql(scope))
            .bind(scope.investigation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        let inserted = insert_chunks(&mut tx, scope.category, records).await?;
        tx.commit().await?;
        Ok(HistoryReplacement { deleted, inserted })
    }
}

fn check_category(
    category: ParticipantCategory,
    records: &[ParticipationHistoryRecord],
) -> Result<(), StoreError> {
    match records.iter().find(|r| r.category != category) {
        Some(stray) => Err(StoreError::InvalidRow {
            table: tables(category).history,
            message: format!("{} row passed to the {} table", stray.category, category),
        }),
        None => Ok(()),
    }
}

fn delete_scope_sql(scope: &BackfillScope) -> String {
    format!(
        "DELETE FROM {} WHERE ($1::uuid IS NULL OR investigation_id = $1)",
        tables(scope.category).history
    )
}

async fn insert_chunks(
    conn: &mut PgConnection,
    category: ParticipantCategory,
    records: &[ParticipationHistoryRecord],
) -> Result<usize, StoreError> {
    let t = tables(category);
    let mut inserted = 0usize;
    for chunk in records.chunks(HISTORY_INSERT_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, investigation_id, recruitment_id, participation_date, \
             session_status, {}, facilitator_id, observations, created_by) ",
            t.history, t.participant_column, t.duration_column
        ));
        builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.participant_id)
                .push_bind(r.investigation_id)
                .push_bind(r.recruitment_id)
                .push_bind(r.participation_date)
                .push_bind(r.session_status.as_str())
                .push_bind(r.duration_minutes)
                .push_bind(r.facilitator_id)
                .push_bind(r.observations.clone())
                .push_bind(r.created_by);
        });
        builder.push(format!(
            " ON CONFLICT ({}, investigation_id, participation_date) DO NOTHING",
            t.participant_column
        ));
        let result = builder.build().execute(&mut *conn).await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}
