/// Database row types matching `migrations/`.
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{MarketResult, ScrapeRun};

#[derive(Debug, sqlx::FromRow)]
pub struct ScrapeRunRow {
    pub id: i64,
    /// Epoch milliseconds UTC.
    pub scraped_at: i64,
    /// JSON array of `MarketResult`.
    pub results: String,
}

impl ScrapeRunRow {
    pub fn into_run(self) -> Result<ScrapeRun> {
        let results: Vec<MarketResult> = serde_json::from_str(&self.results)?;
        Ok(ScrapeRun {
            run_id: Some(self.id),
            scraped_at: DateTime::<Utc>::from_timestamp_millis(self.scraped_at).unwrap_or_default(),
            results,
        })
    }
}
