//! In-page advertisement detection and dismissal.
//!
//! A recurring host-side poll runs one self-contained script in the target
//! page per tick. The script only acts when an ad is confirmed: the overlay
//! marker must be visible before the skip control is even considered, and
//! the control must be enabled and visible before it is clicked. Ambiguous
//! states produce no action.

use std::time::Duration;
use tracing::{debug, trace};

use tubetap_browser::Page;

/// Consecutive evaluate failures after which the poll gives up. Transient
/// failures (page mid-navigation) are tolerated below this.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Check-and-skip in one round trip, so the click never acts on a stale
/// observation. Returns "no-ad", "ad-playing", or "skipped".
const AD_CHECK_JS: &str = r#"(() => {
    const visible = (el) => !!el && el.offsetWidth > 0 && el.offsetHeight > 0;
    const player = document.querySelector('.html5-video-player');
    const marked = !!player && (player.classList.contains('ad-showing')
        || player.classList.contains('ad-interrupting'));
    const overlay = document.querySelector('.ytp-ad-player-overlay, .ytp-ad-player-overlay-layout');
    if (!marked && !visible(overlay)) return 'no-ad';
    const button = document.querySelector('.ytp-ad-skip-button, .ytp-ad-skip-button-modern, .ytp-skip-ad-button');
    if (button && !button.disabled && visible(button)) {
        button.click();
        return 'skipped';
    }
    return 'ad-playing';
})()"#;

/// Handle to a running ad-skip poll. Cancelling (or dropping) the handle
/// stops the poll; both are idempotent.
pub struct AdSkipHandle {
    task: tokio::task::JoinHandle<()>,
}

impl AdSkipHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for AdSkipHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Install the supervisor on a page primed for capture.
pub fn install(page: Page, interval: Duration) -> AdSkipHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures = 0u32;

        loop {
            ticker.tick().await;
            if page.is_closed() {
                break;
            }
            match page.evaluate(AD_CHECK_JS).await {
                Ok(state) => {
                    failures = 0;
                    if state.as_str() == Some("skipped") {
                        debug!(target_id = %page.target_id(), "skipped an ad");
                    }
                }
                Err(e) => {
                    failures += 1;
                    trace!(target_id = %page.target_id(), "ad check failed ({}/{}): {}", failures, MAX_CONSECUTIVE_FAILURES, e);
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        debug!(target_id = %page.target_id(), "ad-skip poll exiting after repeated failures");
                        break;
                    }
                }
            }
        }
    });

    AdSkipHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_script_is_conservative() {
        // The skip control must only be consulted after the overlay marker
        // check; a bare skip-button match without a confirmed ad never
        // reaches the click.
        let marker_check = AD_CHECK_JS.find("'no-ad'").unwrap();
        let click = AD_CHECK_JS.find("button.click()").unwrap();
        assert!(marker_check < click);
        assert!(AD_CHECK_JS.contains("!button.disabled"));
        assert!(AD_CHECK_JS.contains("visible(button)"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let handle = AdSkipHandle { task };
        handle.cancel();
        handle.cancel();
    }
}
