use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scraped records
// ---------------------------------------------------------------------------

/// One market entry parsed from the results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketResult {
    pub market_name: String,
    /// Unparsed delimited value as scraped, e.g. "599-39-568".
    pub raw_numbers: String,
    pub open: String,
    pub jodi: String,
    pub close: String,
    pub raw_text: String,
    /// 1-based document order among all visited entries.
    pub position: u32,
    pub captured_at: DateTime<Utc>,
}

/// One execution of the fetch → extract → persist pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    /// Assigned by the store on insert; None until saved.
    pub run_id: Option<i64>,
    pub scraped_at: DateTime<Utc>,
    pub results: Vec<MarketResult>,
}

impl ScrapeRun {
    pub fn new(scraped_at: DateTime<Utc>, results: Vec<MarketResult>) -> Self {
        Self {
            run_id: None,
            scraped_at,
            results,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler status
// ---------------------------------------------------------------------------

/// Consistent copy of the scheduler's timing state, taken under one lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub update_interval_hours: f64,
    pub running: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// What caused a run to be requested. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    OnDemand,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Startup => "startup",
            Trigger::Timer => "timer",
            Trigger::OnDemand => "on_demand",
        };
        write!(f, "{s}")
    }
}
