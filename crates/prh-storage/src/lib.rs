//! Persistence gateway for participants and scrape bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prh_core::{ParticipantId, ParticipantProfile, ScrapeRunRecord};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "prh-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("count {0} does not fit the schema")]
    CountOverflow(usize),
}

/// Operations the coordinators need from durable storage.
///
/// Implementations scope every call to the current run; see [`PgRunScope`].
#[async_trait]
pub trait ParticipantStore: Send {
    async fn last_successful_scrape_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert ids, ignoring ones already present. Returns only the new ids.
    async fn upsert_participants(
        &mut self,
        ids: &BTreeSet<ParticipantId>,
    ) -> Result<BTreeSet<ParticipantId>, StoreError>;

    async fn append_scrape_record(
        &mut self,
        new_count: usize,
        success: bool,
    ) -> Result<ScrapeRunRecord, StoreError>;

    async fn participants_missing_name(
        &mut self,
        limit: u32,
    ) -> Result<Vec<ParticipantId>, StoreError>;

    async fn update_participant_name(
        &mut self,
        id: &ParticipantId,
        name: &str,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }

    /// Open the transaction that spans one coordinator run.
    pub async fn begin_run(&self) -> Result<PgRunScope, StoreError> {
        Ok(PgRunScope {
            tx: self.pool.begin().await?,
        })
    }
}

/// Store that holds one run's writes until it is committed or rolled back.
#[async_trait]
pub trait RunScope: ParticipantStore + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Run-scoped transaction. Dropping it without committing rolls back.
pub struct PgRunScope {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RunScope for PgRunScope {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        debug!("run transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        debug!("run transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl ParticipantStore for PgRunScope {
    async fn last_successful_scrape_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_scrape_time
              FROM public.last_scrape_metadata
             WHERE success = true
             ORDER BY last_scrape_time DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&mut *self.tx)
        .await?;

        let watermark = match row {
            Some(row) => Some(row.try_get::<DateTime<Utc>, _>("last_scrape_time")?),
            None => None,
        };
        info!(watermark = ?watermark, "last successful scrape");
        Ok(watermark)
    }

    async fn upsert_participants(
        &mut self,
        ids: &BTreeSet<ParticipantId>,
    ) -> Result<BTreeSet<ParticipantId>, StoreError> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let values = ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>();
        let rows = sqlx::query(
            r#"
            INSERT INTO public.runners (id)
            SELECT UNNEST($1::text[])
                ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&values)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut inserted = BTreeSet::new();
        for row in rows {
            inserted.insert(ParticipantId::new(row.try_get::<String, _>("id")?));
        }
        info!(submitted = ids.len(), inserted = inserted.len(), "participants upserted");
        Ok(inserted)
    }

    async fn append_scrape_record(
        &mut self,
        new_count: usize,
        success: bool,
    ) -> Result<ScrapeRunRecord, StoreError> {
        let count = i32::try_from(new_count).map_err(|_| StoreError::CountOverflow(new_count))?;
        let record = ScrapeRunRecord {
            timestamp: Utc::now(),
            new_participant_count: new_count,
            success,
        };
        sqlx::query(
            r#"
            INSERT INTO public.last_scrape_metadata (last_scrape_time, new_parkrunners_count, success)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(record.timestamp)
        .bind(count)
        .bind(success)
        .execute(&mut *self.tx)
        .await?;
        info!(new_count, success, "scrape record appended");
        Ok(record)
    }

    async fn participants_missing_name(
        &mut self,
        limit: u32,
    ) -> Result<Vec<ParticipantId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM public.runners
             WHERE name IS NULL
             ORDER BY id
             LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&mut *self.tx)
        .await?;

        let ids = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("id").map(ParticipantId::new))
            .collect::<Result<Vec<_>, _>>()?;
        info!(limit, found = ids.len(), "participants missing a name");
        Ok(ids)
    }

    async fn update_participant_name(
        &mut self,
        id: &ParticipantId,
        name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE public.runners SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
        debug!(%id, name, "participant name updated");
        Ok(())
    }
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    participants: BTreeMap<ParticipantId, Option<String>>,
    records: Vec<ScrapeRunRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose history holds one successful run at `timestamp`.
    pub fn with_watermark(timestamp: DateTime<Utc>) -> Self {
        Self {
            records: vec![ScrapeRunRecord {
                timestamp,
                new_participant_count: 0,
                success: true,
            }],
            ..Default::default()
        }
    }

    pub fn with_participants<I>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = ParticipantProfile>,
    {
        for profile in profiles {
            self.participants.insert(profile.id, profile.display_name);
        }
        self
    }

    pub fn records(&self) -> &[ScrapeRunRecord] {
        &self.records
    }

    pub fn participants(&self) -> Vec<ParticipantProfile> {
        self.participants
            .iter()
            .map(|(id, name)| ParticipantProfile {
                id: id.clone(),
                display_name: name.clone(),
            })
            .collect()
    }

    pub fn display_name(&self, id: &ParticipantId) -> Option<&str> {
        self.participants.get(id).and_then(|name| name.as_deref())
    }
}

#[async_trait]
impl ParticipantStore for MemoryStore {
    async fn last_successful_scrape_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.success)
            .map(|r| r.timestamp)
            .max())
    }

    async fn upsert_participants(
        &mut self,
        ids: &BTreeSet<ParticipantId>,
    ) -> Result<BTreeSet<ParticipantId>, StoreError> {
        let mut inserted = BTreeSet::new();
        for id in ids {
            if !self.participants.contains_key(id) {
                self.participants.insert(id.clone(), None);
                inserted.insert(id.clone());
            }
        }
        Ok(inserted)
    }

    async fn append_scrape_record(
        &mut self,
        new_count: usize,
        success: bool,
    ) -> Result<ScrapeRunRecord, StoreError> {
        let record = ScrapeRunRecord {
            timestamp: Utc::now(),
            new_participant_count: new_count,
            success,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    async fn participants_missing_name(
        &mut self,
        limit: u32,
    ) -> Result<Vec<ParticipantId>, StoreError> {
        Ok(self
            .participants
            .iter()
            .filter(|(_, name)| name.is_none())
            .map(|(id, _)| id.clone())
            .take(limit as usize)
            .collect())
    }

    async fn update_participant_name(
        &mut self,
        id: &ParticipantId,
        name: &str,
    ) -> Result<(), StoreError> {
        if let Some(slot) = self.participants.get_mut(id) {
            *slot = Some(name.to_string());
        }
        Ok(())
    }
}

/// Writes are applied in place and vanish with the store, so both ends of
/// the scope are no-ops.
#[async_trait]
impl RunScope for MemoryStore {
    async fn commit(self) -> Result<(), StoreError> {
        debug!(
            participants = self.participants.len(),
            records = self.records.len(),
            "in-memory run finished"
        );
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn set(values: &[&str]) -> BTreeSet<ParticipantId> {
        values.iter().copied().map(ParticipantId::from).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let mut store = MemoryStore::new();

        let first = store.upsert_participants(&set(&["1", "2"])).await.unwrap();
        let second = store.upsert_participants(&set(&["1", "2"])).await.unwrap();
        let third = store.upsert_participants(&set(&["2", "3"])).await.unwrap();

        assert_eq!(first, set(&["1", "2"]));
        assert!(second.is_empty());
        assert_eq!(third, set(&["3"]));
    }

    #[tokio::test]
    async fn watermark_ignores_failed_runs() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 15, 8, 0, 0).single().unwrap();
        let mut store = MemoryStore::with_watermark(ts);
        store.append_scrape_record(3, false).await.unwrap();

        assert_eq!(store.last_successful_scrape_time().await.unwrap(), Some(ts));
        assert_eq!(store.records().len(), 2);
        assert!(MemoryStore::new().last_successful_scrape_time().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_names_are_bounded_and_updatable() {
        let mut store = MemoryStore::new().with_participants(vec![
            ParticipantProfile { id: "10".into(), display_name: None },
            ParticipantProfile { id: "11".into(), display_name: Some("Known Name".into()) },
            ParticipantProfile { id: "12".into(), display_name: None },
            ParticipantProfile { id: "13".into(), display_name: None },
        ]);

        let missing = store.participants_missing_name(2).await.unwrap();
        assert_eq!(missing, vec![ParticipantId::from("10"), ParticipantId::from("12")]);

        store
            .update_participant_name(&ParticipantId::from("10"), "John Doe")
            .await
            .unwrap();
        assert_eq!(store.display_name(&ParticipantId::from("10")), Some("John Doe"));
        assert_eq!(
            store.participants_missing_name(10).await.unwrap(),
            vec![ParticipantId::from("12"), ParticipantId::from("13")]
        );
    }
}
