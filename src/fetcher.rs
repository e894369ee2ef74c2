use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::Page;
use futures_util::{stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{
    Config, NETWORK_IDLE_POLL_MS, NETWORK_IDLE_QUIET_MS, USER_AGENT, WINDOW_HEIGHT, WINDOW_WIDTH,
};
use crate::error::{AppError, Result};

/// Headroom on CDP command deadlines so the caller's own timeout fires first.
const CDP_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Loads a page and returns its rendered HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String>;
}

/// Renders pages in a fresh headless Chromium per call.
pub struct ChromeFetcher {
    executable: Option<String>,
    headless: bool,
}

impl ChromeFetcher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            executable: cfg.chrome_executable.clone(),
            headless: cfg.headless,
        }
    }

    fn browser_config(&self, timeout: Duration) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(WINDOW_WIDTH, WINDOW_HEIGHT)
            .request_timeout(cdp_request_timeout(timeout))
            .args([
                "--disable-setuid-sandbox",
                "--disable-dev-shm-usage",
                "--disable-gpu",
                "--ignore-certificate-errors",
            ]);
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        builder.build().map_err(AppError::BrowserLaunch)
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String> {
        info!(
            executable = self.executable.as_deref().unwrap_or("auto"),
            headless = self.headless,
            "Launching browser"
        );
        let session = BrowserSession::launch(self.browser_config(timeout)?).await?;

        let result = session.render(url, timeout).await;
        session.close().await;
        result
    }
}

fn cdp_request_timeout(timeout: Duration) -> Duration {
    timeout.saturating_add(CDP_TIMEOUT_MARGIN)
}

fn navigation_error(e: impl std::fmt::Display) -> AppError {
    AppError::Navigation(e.to_string())
}

/// The browser is already up when a tab fails to open, so this is a
/// transient page failure rather than a launch failure.
fn page_open_error(e: impl std::fmt::Display) -> AppError {
    AppError::Navigation(format!("could not open page: {e}"))
}

// ---------------------------------------------------------------------------
// BrowserSession: one disposable browser, released on every exit path
// ---------------------------------------------------------------------------

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    async fn launch(config: BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserLaunch(e.to_string()))?;

        // The CDP connection only makes progress while its handler is polled.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler stopped: {e}");
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    async fn render(&self, url: &str, timeout: Duration) -> Result<String> {
        let page = self.browser.new_page("about:blank").await.map_err(page_open_error)?;
        page.set_user_agent(USER_AGENT).await.map_err(navigation_error)?;

        // Subscribed before navigating so the document request itself is seen.
        let (activity, listener) = watch_network(&page).await?;

        info!(url, timeout_secs = timeout.as_secs(), "Navigating");
        let settled = tokio::time::timeout(timeout, navigate_and_settle(&page, url, activity)).await;
        listener.abort();
        match settled {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AppError::Navigation(format!(
                    "page did not settle within {}s",
                    timeout.as_secs()
                )))
            }
        }

        let html = page
            .content()
            .await
            .map_err(|e| AppError::Navigation(format!("could not read page content: {e}")))?;
        debug!(bytes = html.len(), "Page content captured");
        Ok(html)
    }

    async fn close(mut self) {
        match self.browser.close().await {
            Ok(_) => {
                if let Err(e) = self.browser.wait().await {
                    warn!("Browser process did not exit cleanly: {e}");
                }
                debug!("Browser closed");
            }
            Err(e) => warn!("Error closing browser: {e}"),
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // chromiumoxide kills the child process when `Browser` drops; the
        // handler task would otherwise outlive it.
        self.handler.abort();
    }
}

/// Navigation goes through a raw `Page.navigate` so the only deadline is the
/// caller's timeout, not chromiumoxide's built-in navigation deadline.
async fn navigate_and_settle(
    page: &Page,
    url: &str,
    activity: watch::Receiver<NetworkActivity>,
) -> Result<()> {
    let navigated = page
        .execute(NavigateParams::new(url))
        .await
        .map_err(navigation_error)?;
    if let Some(reason) = navigated.result.error_text.as_deref() {
        return Err(AppError::Navigation(reason.to_string()));
    }

    let response = page
        .wait_for_navigation_response()
        .await
        .map_err(navigation_error)?;
    let status = response
        .as_ref()
        .and_then(|req| req.response.as_ref())
        .map(|resp| resp.status);
    check_status(status)?;

    wait_for_network_idle(page, activity).await
}

/// The main document must have answered with a 2xx status.
fn check_status(status: Option<i64>) -> Result<()> {
    match status {
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(code) => Err(AppError::Navigation(format!("Failed to load the page. Status: {code}"))),
        None => Err(AppError::Navigation(
            "Failed to load the page. Status: unknown".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Network activity
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum NetworkEvent {
    Started(String),
    Settled(String),
}

/// Requests the page has issued that have neither finished nor failed.
#[derive(Debug, Default)]
struct InFlightRequests {
    pending: HashSet<String>,
    events: u64,
}

/// Snapshot published to the idle wait after every network event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NetworkActivity {
    in_flight: usize,
    /// Total events seen; a change means traffic happened between polls.
    events: u64,
}

impl InFlightRequests {
    fn apply(&mut self, event: NetworkEvent) -> NetworkActivity {
        match event {
            // Redirects reuse the request id, so the set absorbs them.
            NetworkEvent::Started(id) => {
                self.pending.insert(id);
            }
            NetworkEvent::Settled(id) => {
                self.pending.remove(&id);
            }
        }
        self.events += 1;
        NetworkActivity {
            in_flight: self.pending.len(),
            events: self.events,
        }
    }
}

/// Follow the page's request lifecycle events on a background task.
async fn watch_network(page: &Page) -> Result<(watch::Receiver<NetworkActivity>, JoinHandle<()>)> {
    let started = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(navigation_error)?
        .map(|e| NetworkEvent::Started(e.request_id.inner().clone()));
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(navigation_error)?
        .map(|e| NetworkEvent::Settled(e.request_id.inner().clone()));
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(navigation_error)?
        .map(|e| NetworkEvent::Settled(e.request_id.inner().clone()));

    let mut events = Box::pin(stream::select(started, stream::select(finished, failed)));
    let (tx, rx) = watch::channel(NetworkActivity::default());
    let task = tokio::spawn(async move {
        let mut requests = InFlightRequests::default();
        while let Some(event) = events.next().await {
            tx.send_replace(requests.apply(event));
        }
    });
    Ok((rx, task))
}

const DOCUMENT_COMPLETE_JS: &str = r#"document.readyState === "complete""#;

async fn wait_for_network_idle(page: &Page, activity: watch::Receiver<NetworkActivity>) -> Result<()> {
    let mut idle = IdleTracker::new(Duration::from_millis(NETWORK_IDLE_QUIET_MS));
    let poll = Duration::from_millis(NETWORK_IDLE_POLL_MS);

    loop {
        let complete: bool = page
            .evaluate(DOCUMENT_COMPLETE_JS)
            .await
            .map_err(navigation_error)?
            .into_value()
            .map_err(|e| AppError::Navigation(format!("readyState probe: {e}")))?;

        let snapshot = *activity.borrow();
        if idle.observe(complete.then_some(snapshot), Instant::now()) {
            debug!(events = snapshot.events, "Network idle");
            return Ok(());
        }
        tokio::time::sleep(poll).await;
    }
}

// ---------------------------------------------------------------------------
// IdleTracker
// ---------------------------------------------------------------------------

/// Decides when a page has gone quiet: the document is loaded, no request is
/// in flight, and no network event has arrived for `quiet`.
#[derive(Debug)]
struct IdleTracker {
    quiet: Duration,
    last_events: Option<u64>,
    quiet_since: Option<Instant>,
}

impl IdleTracker {
    fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_events: None,
            quiet_since: None,
        }
    }

    /// `activity` is None while the document is still loading.
    fn observe(&mut self, activity: Option<NetworkActivity>, now: Instant) -> bool {
        let Some(activity) = activity.filter(|a| a.in_flight == 0) else {
            self.last_events = None;
            self.quiet_since = None;
            return false;
        };

        if self.last_events != Some(activity.events) {
            self.last_events = Some(activity.events);
            self.quiet_since = Some(now);
            return false;
        }

        self.quiet_since
            .is_some_and(|since| now.duration_since(since) >= self.quiet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_after(events: u64) -> Option<NetworkActivity> {
        Some(NetworkActivity { in_flight: 0, events })
    }

    fn busy(in_flight: usize, events: u64) -> Option<NetworkActivity> {
        Some(NetworkActivity { in_flight, events })
    }

    #[test]
    fn success_statuses_pass() {
        assert!(check_status(Some(200)).is_ok());
        assert!(check_status(Some(204)).is_ok());
    }

    #[test]
    fn non_success_or_missing_status_is_navigation_error() {
        assert!(matches!(check_status(Some(503)), Err(AppError::Navigation(_))));
        assert!(matches!(check_status(Some(301)), Err(AppError::Navigation(_))));
        assert!(matches!(check_status(None), Err(AppError::Navigation(_))));
    }

    #[test]
    fn idle_requires_a_full_quiet_window() {
        let t0 = Instant::now();
        let mut idle = IdleTracker::new(Duration::from_millis(500));

        assert!(!idle.observe(quiet_after(10), t0));
        assert!(!idle.observe(quiet_after(10), t0 + Duration::from_millis(300)));
        assert!(idle.observe(quiet_after(10), t0 + Duration::from_millis(500)));
    }

    #[test]
    fn slow_request_in_flight_is_never_idle() {
        let t0 = Instant::now();
        let mut idle = IdleTracker::new(Duration::from_millis(500));

        // One data request stays open for two seconds with no other traffic.
        for ms in (0..=2000).step_by(100) {
            assert!(!idle.observe(busy(1, 7), t0 + Duration::from_millis(ms)));
        }
        assert!(!idle.observe(quiet_after(8), t0 + Duration::from_millis(2100)));
        assert!(!idle.observe(quiet_after(8), t0 + Duration::from_millis(2500)));
        assert!(idle.observe(quiet_after(8), t0 + Duration::from_millis(2600)));
    }

    #[test]
    fn traffic_between_polls_restarts_the_quiet_window() {
        let t0 = Instant::now();
        let mut idle = IdleTracker::new(Duration::from_millis(500));

        assert!(!idle.observe(quiet_after(10), t0));
        // A request started and finished between two polls.
        assert!(!idle.observe(quiet_after(12), t0 + Duration::from_millis(400)));
        assert!(!idle.observe(quiet_after(12), t0 + Duration::from_millis(800)));
        assert!(idle.observe(quiet_after(12), t0 + Duration::from_millis(900)));
    }

    #[test]
    fn loading_document_is_never_idle() {
        let t0 = Instant::now();
        let mut idle = IdleTracker::new(Duration::from_millis(100));

        assert!(!idle.observe(quiet_after(3), t0));
        assert!(!idle.observe(None, t0 + Duration::from_millis(200)));
        assert!(!idle.observe(quiet_after(3), t0 + Duration::from_millis(250)));
        assert!(idle.observe(quiet_after(3), t0 + Duration::from_millis(350)));
    }

    #[test]
    fn in_flight_requests_follow_the_request_lifecycle() {
        let mut requests = InFlightRequests::default();

        let a = requests.apply(NetworkEvent::Started("doc".to_string()));
        assert_eq!(a, NetworkActivity { in_flight: 1, events: 1 });
        requests.apply(NetworkEvent::Started("xhr".to_string()));
        // A redirect re-announces the same id.
        let a = requests.apply(NetworkEvent::Started("doc".to_string()));
        assert_eq!(a.in_flight, 2);

        requests.apply(NetworkEvent::Settled("doc".to_string()));
        let a = requests.apply(NetworkEvent::Settled("xhr".to_string()));
        assert_eq!(a, NetworkActivity { in_flight: 0, events: 5 });

        // Unknown ids (requests issued before subscribing) are ignored.
        let a = requests.apply(NetworkEvent::Settled("early".to_string()));
        assert_eq!(a.in_flight, 0);
    }

    #[test]
    fn tab_open_failure_is_a_retryable_navigation_error() {
        let err = page_open_error("Request timed out.");
        assert!(matches!(err, AppError::Navigation(ref m) if m.contains("Request timed out")));
        assert!(err.is_retryable());
    }

    #[test]
    fn cdp_deadline_outlasts_the_navigation_timeout() {
        let nav = Duration::from_secs(60);
        assert!(cdp_request_timeout(nav) > nav);
        assert_eq!(cdp_request_timeout(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn explicit_executable_config_builds() {
        let fetcher = ChromeFetcher {
            executable: Some("/nonexistent/chrome".to_string()),
            headless: false,
        };
        assert!(fetcher.browser_config(Duration::from_secs(60)).is_ok());
    }
}
