//! Ephemeral page handles.
//!
//! A `Page` is one CDP target with its own WebSocket connection, owned by a
//! single logical operation (a resolution, a preload preparation, or a
//! capture) until it is closed. Close is idempotent; a handle dropped
//! without being closed is a defect and is logged as such while a
//! best-effort close runs.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use tubetap_core::{Error, Result};

use crate::cdp::CdpClient;
use crate::session::{get_target_ws_url, BrowserSession};

/// Poll cadence for `wait_for_selector`.
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Handle to one browser tab. Cheap to clone; all clones refer to the same
/// underlying target, and the first `close` wins.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

struct PageInner {
    target_id: String,
    cdp: Arc<CdpClient>,
    session: Arc<BrowserSession>,
    closed: AtomicBool,
    /// Task answering intercepted ad requests; aborted on close.
    blocker: tokio::task::JoinHandle<()>,
}

impl Page {
    /// Connect to a freshly created target: resolve its WebSocket URL, enable
    /// the domains every operation needs, and install ad-domain blocking
    /// before any navigation happens.
    pub(crate) async fn attach(
        session: Arc<BrowserSession>,
        target_id: String,
        ad_domains: &[String],
    ) -> Result<Page> {
        let ws_url = get_target_ws_url(session.debug_port, &target_id).await?;
        let cdp = Arc::new(CdpClient::connect(&ws_url).await?);

        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        cdp.enable_domain("Network").await?;

        let blocker = install_ad_blocking(cdp.clone(), ad_domains).await?;

        Ok(Page {
            inner: Arc::new(PageInner {
                target_id,
                cdp,
                session,
                closed: AtomicBool::new(false),
                blocker,
            }),
        })
    }

    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Navigate and wait for the page's load event, bounded.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let mut loaded = self.inner.cdp.subscribe_event("Page.loadEventFired").await;
        self.inner.cdp.navigate(url).await?;

        match tokio::time::timeout(timeout, loaded.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::Cdp("page connection closed during navigation".into())),
            Err(_) => Err(Error::NavigationTimeout(format!(
                "{} did not reach load within {}s",
                url,
                timeout.as_secs()
            ))),
        }
    }

    /// Poll until a selector matches, bounded. Fails with `NotFound` when
    /// nothing renders in time.
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let quoted = serde_json::to_string(selector)?;
        let probe = format!("!!document.querySelector({})", quoted);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.inner.cdp.evaluate(&probe).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NotFound(format!(
                    "selector {:?} did not render within {}s",
                    selector,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    /// Evaluate JavaScript in the page and return the result value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.inner.cdp.evaluate(expression).await
    }

    /// Expose a page-to-host binding and return the stream of its calls.
    /// Each received value is the `Runtime.bindingCalled` params object
    /// (`{name, payload, ...}`). Deep buffer: chunk relay must survive a
    /// briefly stalled consumer without losing messages.
    pub async fn add_binding(&self, name: &str) -> Result<mpsc::Receiver<Value>> {
        let rx = self
            .inner
            .cdp
            .subscribe_event_with_capacity("Runtime.bindingCalled", 256)
            .await;
        self.inner.cdp.add_binding(name).await?;
        Ok(rx)
    }

    /// Close the underlying target. Idempotent: the first call closes, later
    /// calls (from convergent failure paths) are no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.blocker.abort();
        if let Err(e) = self
            .inner
            .session
            .cdp
            .close_target(&self.inner.target_id)
            .await
        {
            debug!(target_id = %self.inner.target_id, "close_target failed (may already be gone): {}", e);
        }
    }
}

impl Drop for PageInner {
    fn drop(&mut self) {
        self.blocker.abort();
        if !self.closed.load(Ordering::SeqCst) {
            warn!(target_id = %self.target_id, "page dropped without close");
            // Best-effort close so the tab does not outlive its owner.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let session = self.session.clone();
                let target_id = self.target_id.clone();
                handle.spawn(async move {
                    let _ = session.cdp.close_target(&target_id).await;
                });
            }
        }
    }
}

/// Derive Fetch request patterns from the ad-domain list.
fn ad_patterns(domains: &[String]) -> Vec<Value> {
    domains
        .iter()
        .flat_map(|domain| {
            [
                json!({"urlPattern": format!("*://{}/*", domain)}),
                json!({"urlPattern": format!("*://*.{}/*", domain)}),
            ]
        })
        .collect()
}

/// Install the network-layer ad rule: intercept requests matching the
/// ad-domain patterns and abort every one of them. Only matching requests
/// pause, so the handler never sees legitimate traffic.
async fn install_ad_blocking(
    cdp: Arc<CdpClient>,
    ad_domains: &[String],
) -> Result<tokio::task::JoinHandle<()>> {
    let patterns = ad_patterns(ad_domains);
    let mut paused = cdp.subscribe_event("Fetch.requestPaused").await;

    if !patterns.is_empty() {
        cdp.enable_fetch(patterns).await?;
    }

    let handle = tokio::spawn(async move {
        while let Some(event) = paused.recv().await {
            let Some(request_id) = event.get("requestId").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(url) = event
                .get("request")
                .and_then(|r| r.get("url"))
                .and_then(|v| v.as_str())
            {
                trace!(url, "blocked ad request");
            }
            if let Err(e) = cdp.fetch_fail(request_id, "BlockedByClient").await {
                debug!("failed to abort intercepted request: {}", e);
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ad_patterns_cover_domain_and_subdomains() {
        let patterns = ad_patterns(&["doubleclick.net".to_string()]);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0]["urlPattern"], "*://doubleclick.net/*");
        assert_eq!(patterns[1]["urlPattern"], "*://*.doubleclick.net/*");
    }

    #[test]
    fn ad_patterns_empty_for_empty_list() {
        assert!(ad_patterns(&[]).is_empty());
    }
}
