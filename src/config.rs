use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const TARGET_URL: &str = "https://spboss.in";

/// Desktop Chrome identity presented to the target site.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Page load + network-idle timeout (seconds).
pub const NAV_TIMEOUT_SECS: u64 = 60;

/// Cadence between successful runs (hours).
pub const UPDATE_INTERVAL_HOURS: u64 = 6;

/// Delay before retrying after a failed run (seconds).
pub const RETRY_DELAY_SECS: u64 = 5 * 60;

/// Log an escalated error every N consecutive failed runs.
pub const FAILURE_ESCALATION_EVERY: u32 = 5;

/// Maximum runs returned by /history.
pub const HISTORY_LIMIT: i64 = 10;

/// Browser window / viewport size.
pub const WINDOW_WIDTH: u32 = 1280;
pub const WINDOW_HEIGHT: u32 = 800;

/// Network idle: no request in flight and no network event for this long.
pub const NETWORK_IDLE_QUIET_MS: u64 = 500;
/// Network idle: how often readiness is checked.
pub const NETWORK_IDLE_POLL_MS: u64 = 100;

#[cfg(windows)]
const DEFAULT_CHROME_PATH: &str = r"C:\Program Files\Google\Chrome\Application\chrome.exe";
#[cfg(not(windows))]
const DEFAULT_CHROME_PATH: &str = "/usr/bin/google-chrome-stable";

#[derive(Debug, Clone)]
pub struct Config {
    pub target_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Explicit browser binary (CHROME_EXECUTABLE_PATH / PUPPETEER_EXECUTABLE_PATH).
    /// None lets chromiumoxide auto-detect.
    pub chrome_executable: Option<String>,
    /// HEADLESS=false opens a visible window, useful when debugging locally.
    pub headless: bool,
    pub nav_timeout: Duration,
    pub update_interval: Duration,
    pub retry_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_port = std::env::var("API_PORT")
            .or_else(|_| std::env::var("PORT"))
            .unwrap_or_else(|_| "3001".to_string())
            .parse::<u16>()
            .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?;

        let update_interval = hours(positive(
            "UPDATE_INTERVAL_HOURS",
            env_u64("UPDATE_INTERVAL_HOURS", UPDATE_INTERVAL_HOURS)?,
        )?)?;
        let nav_timeout = Duration::from_secs(positive(
            "NAV_TIMEOUT_SECS",
            env_u64("NAV_TIMEOUT_SECS", NAV_TIMEOUT_SECS)?,
        )?);
        let retry_delay = Duration::from_secs(positive(
            "RETRY_DELAY_SECS",
            env_u64("RETRY_DELAY_SECS", RETRY_DELAY_SECS)?,
        )?);

        Ok(Self {
            target_url: std::env::var("TARGET_URL").unwrap_or_else(|_| TARGET_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "results.db".to_string()),
            api_port,
            chrome_executable: resolve_chrome_executable(
                std::env::var("CHROME_EXECUTABLE_PATH")
                    .or_else(|_| std::env::var("PUPPETEER_EXECUTABLE_PATH"))
                    .ok(),
            ),
            headless: parse_bool(std::env::var("HEADLESS").ok().as_deref(), true),
            nav_timeout,
            update_interval,
            retry_delay,
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    parse_u64(name, std::env::var(name).ok(), default)
}

/// Unset means `default`; anything set must be a whole number.
fn parse_u64(name: &str, raw: Option<String>, default: u64) -> Result<u64> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|_| AppError::Config(format!("{name} must be a whole number, got {v:?}"))),
    }
}

fn positive(name: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(AppError::Config(format!("{name} must be at least 1")));
    }
    Ok(value)
}

fn hours(h: u64) -> Result<Duration> {
    h.checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::Config(format!("UPDATE_INTERVAL_HOURS is too large: {h}")))
}

/// Explicit path wins; otherwise the platform default if it exists on disk.
fn resolve_chrome_executable(explicit: Option<String>) -> Option<String> {
    match explicit.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(path) => Some(path),
        None if Path::new(DEFAULT_CHROME_PATH).exists() => Some(DEFAULT_CHROME_PATH.to_string()),
        None => None,
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|s| s.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
