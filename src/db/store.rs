use async_trait::async_trait;
use tracing::{debug, error};

use crate::db::models::ScrapeRunRow;
use crate::error::{PersistenceError, Result};
use crate::types::ScrapeRun;

/// Append-only persistence for scrape runs.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert one run and return its assigned id.
    async fn save(&self, run: &ScrapeRun) -> Result<i64>;

    /// Most recent runs, newest first by `scraped_at`, at most `limit`.
    async fn list_recent(&self, limit: i64) -> Result<Vec<ScrapeRun>>;
}

pub struct SqliteResultStore {
    pool: sqlx::SqlitePool,
}

impl SqliteResultStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(&self, run: &ScrapeRun) -> Result<i64> {
        let scraped_at = run.scraped_at.timestamp_millis();
        let results = serde_json::to_string(&run.results)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO scrape_runs (scraped_at, results)
            VALUES (?, ?)
            "#,
        )
        .bind(scraped_at)
        .bind(results)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(run_id = id, results = run.results.len(), "Scrape run saved");
                Ok(id)
            }
            Err(e) => {
                error!("DB write error: {e}");
                Err(classify_write_error(e).into())
            }
        }
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<ScrapeRun>> {
        let rows: Vec<ScrapeRunRow> = sqlx::query_as(
            r#"
            SELECT id, scraped_at, results
            FROM scrape_runs
            ORDER BY scraped_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScrapeRunRow::into_run).collect()
    }
}

// SQLite primary result codes (extended codes carry them in the low byte).
const SQLITE_PERM: i64 = 3;
const SQLITE_READONLY: i64 = 8;
const SQLITE_AUTH: i64 = 23;

/// Map a backend write failure onto the persistence taxonomy.
pub fn classify_write_error(err: sqlx::Error) -> PersistenceError {
    let sqlx::Error::Database(db_err) = &err else {
        return PersistenceError::Other(err);
    };

    let message = db_err.message().to_string();
    let lowered = message.to_ascii_lowercase();
    let primary_code = db_err
        .code()
        .and_then(|c| c.parse::<i64>().ok())
        .map(|c| c & 0xff);

    if lowered.contains("no such table") {
        PersistenceError::SchemaMissing
    } else if matches!(primary_code, Some(SQLITE_PERM | SQLITE_READONLY | SQLITE_AUTH))
        || lowered.contains("readonly")
        || lowered.contains("permission")
        || lowered.contains("policy")
    {
        PersistenceError::PermissionDenied(message)
    } else {
        PersistenceError::Other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::types::MarketResult;
    use chrono::{DateTime, Duration, Utc};
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;

    async fn memory_pool(migrate: bool) -> sqlx::SqlitePool {
        // One connection: every connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        if migrate {
            sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        }
        pool
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_790_000_000 + secs, 0).unwrap()
    }

    fn run_at(at: DateTime<Utc>, name: &str) -> ScrapeRun {
        ScrapeRun::new(
            at,
            vec![MarketResult {
                market_name: name.to_string(),
                raw_numbers: "599-39-568".to_string(),
                open: "599".to_string(),
                jodi: "39".to_string(),
                close: "568".to_string(),
                raw_text: format!("{name} 599-39-568"),
                position: 1,
                captured_at: at,
            }],
        )
    }

    #[tokio::test]
    async fn save_assigns_increasing_ids_and_round_trips_results() {
        let store = SqliteResultStore::new(memory_pool(true).await);

        let first = store.save(&run_at(ts(0), "KALYAN")).await.unwrap();
        let second = store.save(&run_at(ts(10), "MILAN")).await.unwrap();
        assert!(second > first);

        let runs = store.list_recent(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, Some(second));
        assert_eq!(runs[0].scraped_at, ts(10));
        assert_eq!(runs[0].results[0].market_name, "MILAN");
        assert_eq!(runs[0].results[0].close, "568");
    }

    #[tokio::test]
    async fn list_recent_is_newest_first_and_truncated() {
        let store = SqliteResultStore::new(memory_pool(true).await);

        // Inserted out of chronological order on purpose.
        for offset in [30, 5, 50, 20, 40, 10, 0, 60, 15, 25, 35, 45] {
            store.save(&run_at(ts(offset), "M")).await.unwrap();
        }

        let runs = store.list_recent(10).await.unwrap();
        assert_eq!(runs.len(), 10);
        assert!(runs.windows(2).all(|w| w[0].scraped_at >= w[1].scraped_at));
        assert_eq!(runs[0].scraped_at, ts(60));
        assert_eq!(runs[9].scraped_at, ts(10));
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_insert_order() {
        let store = SqliteResultStore::new(memory_pool(true).await);
        let a = store.save(&run_at(ts(0), "A")).await.unwrap();
        let b = store.save(&run_at(ts(0), "B")).await.unwrap();

        let ids: Vec<_> = store
            .list_recent(5)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec![Some(b), Some(a)]);
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let store = SqliteResultStore::new(memory_pool(true).await);
        assert!(store.list_recent(10).await.unwrap().is_empty());
        assert!(store.list_recent(-1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_table_is_schema_missing() {
        let store = SqliteResultStore::new(memory_pool(false).await);
        let err = store.save(&run_at(ts(0), "A")).await.unwrap_err();
        assert!(
            matches!(err, AppError::Persistence(PersistenceError::SchemaMissing)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn read_only_database_is_permission_denied() {
        let path = std::env::temp_dir().join(format!(
            "market-results-ro-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();

        let writable = SqliteConnectOptions::from_str(&format!("sqlite:{path_str}"))
            .unwrap()
            .journal_mode(SqliteJournalMode::Delete)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(writable).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool.close().await;

        let read_only = SqliteConnectOptions::from_str(&format!("sqlite:{path_str}"))
            .unwrap()
            .journal_mode(SqliteJournalMode::Delete)
            .read_only(true);
        let pool = SqlitePoolOptions::new().connect_with(read_only).await.unwrap();
        let store = SqliteResultStore::new(pool.clone());

        let err = store.save(&run_at(ts(0), "A")).await.unwrap_err();
        assert!(
            matches!(err, AppError::Persistence(PersistenceError::PermissionDenied(_))),
            "got {err:?}"
        );

        pool.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn non_database_errors_are_other() {
        let classified = classify_write_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(classified, PersistenceError::Other(_)));
    }

    #[test]
    fn timestamps_survive_millisecond_storage() {
        let at = ts(0) + Duration::milliseconds(123);
        let row = ScrapeRunRow {
            id: 7,
            scraped_at: at.timestamp_millis(),
            results: "[]".to_string(),
        };
        let run = row.into_run().unwrap();
        assert_eq!(run.scraped_at, at);
        assert_eq!(run.run_id, Some(7));
        assert!(run.results.is_empty());
    }
}
