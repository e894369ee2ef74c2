use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use tracing::info;

use crate::db::ResultStore;
use crate::error::Result;
use crate::extractor::extract;
use crate::fetcher::PageFetcher;
use crate::types::ScrapeRun;

/// Runs one fetch → extract → save pass. Holds no mutable state, so
/// concurrent calls are independent; the scheduler decides whether they may
/// overlap.
pub struct Orchestrator {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ResultStore>,
    target_url: String,
    nav_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ResultStore>,
        target_url: String,
        nav_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            target_url,
            nav_timeout,
        }
    }

    pub async fn run_once(&self) -> Result<ScrapeRun> {
        let html = self.fetcher.fetch(&self.target_url, self.nav_timeout).await?;

        // Millisecond precision matches what the store keeps.
        let now = Utc::now().trunc_subsecs(3);
        let results = extract(&html, now);
        info!(results = results.len(), "Found {} market results", results.len());

        let mut run = ScrapeRun::new(now, results);
        let run_id = self.store.save(&run).await?;
        run.run_id = Some(run_id);
        Ok(run)
    }
}
