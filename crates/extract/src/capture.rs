//! Stream capture bridge: in-page `MediaRecorder` → host byte stream.
//!
//! Capture attaches to the page's media element, relays encoded chunks
//! through a CDP binding into an `AudioStream`, and guarantees one
//! idempotent cleanup no matter which side ends the capture first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tubetap_browser::{BrowserManager, Page};
use tubetap_core::config::{AdSkipConfig, TimeoutConfig};
use tubetap_core::{Error, Result, TrackDescriptor};

use crate::adskip::{self, AdSkipHandle};
use crate::preload::PreparedPage;
use crate::stream::{decode_chunk, AudioStream, SinkMessage};

/// Name of the page→host binding the capture script posts through.
pub const SINK_BINDING: &str = "__tubetapSink";

/// How close playback position must be to total duration, together with the
/// element reporting ended, before the recorder is stopped.
const END_TOLERANCE_SECS: &str = "0.5";

/// Recorder timeslice: one chunk roughly every 250 ms.
const TIMESLICE_MS: &str = "250";

/// In-page capture start. Chunk delivery is serialized through a promise
/// chain so output order always matches production order, and the final
/// `end` message queues behind every pending chunk.
const START_CAPTURE_TEMPLATE: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return 'no-media';
    if (window.__tubetapRecorder) return 'already-capturing';
    let stream;
    try { stream = v.captureStream(); } catch (e) { return 'capture-failed: ' + e.message; }
    const tracks = stream.getAudioTracks();
    if (!tracks.length) return 'no-audio-track';
    let recorder;
    try {
        recorder = new MediaRecorder(new MediaStream(tracks), { mimeType: 'audio/webm;codecs=opus' });
    } catch (e) { return 'recorder-failed: ' + e.message; }
    const send = (msg) => { try { window.@@SINK@@(JSON.stringify(msg)); } catch (e) {} };
    let queue = Promise.resolve();
    recorder.ondataavailable = (ev) => {
        if (!ev.data || !ev.data.size) return;
        queue = queue.then(() => ev.data.arrayBuffer()).then((buf) => {
            const bytes = new Uint8Array(buf);
            let binary = '';
            for (let i = 0; i < bytes.length; i += 0x8000) {
                binary += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
            }
            send({ type: 'chunk', data: btoa(binary) });
        });
    };
    recorder.onstop = () => {
        clearInterval(window.__tubetapMonitor);
        queue = queue.then(() => send({ type: 'end' }));
    };
    recorder.onerror = (ev) => {
        clearInterval(window.__tubetapMonitor);
        send({ type: 'error', message: (ev.error && ev.error.message) || 'recorder error' });
    };
    window.__tubetapRecorder = recorder;
    window.__tubetapStop = () => {
        try { if (recorder.state !== 'inactive') recorder.stop(); } catch (e) {}
    };
    window.__tubetapMonitor = setInterval(() => {
        if (v.ended && isFinite(v.duration)
            && Math.abs(v.duration - v.currentTime) < @@TOLERANCE@@) {
            window.__tubetapStop();
        }
    }, 500);
    recorder.start(@@TIMESLICE@@);
    v.play().catch(() => {});
    return 'ok';
})()"#;

/// Best-effort in-page recorder stop, used by cleanup.
const STOP_CAPTURE_JS: &str = r#"(() => {
    if (window.__tubetapStop) { window.__tubetapStop(); return 'stopped'; }
    return 'no-recorder';
})()"#;

fn start_capture_script() -> String {
    START_CAPTURE_TEMPLATE
        .replace("@@SINK@@", SINK_BINDING)
        .replace("@@TOLERANCE@@", END_TOLERANCE_SECS)
        .replace("@@TIMESLICE@@", TIMESLICE_MS)
}

/// First-trigger guard for the unified cleanup routine: exactly one of the
/// convergent triggers wins, the rest are no-ops.
#[derive(Default)]
pub(crate) struct CleanupGuard(AtomicBool);

impl CleanupGuard {
    /// Returns true for the first caller only.
    pub(crate) fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Turns primed or freshly-navigated pages into audio byte streams.
pub struct CaptureBridge {
    browser: Arc<BrowserManager>,
    timeouts: TimeoutConfig,
    adskip: AdSkipConfig,
}

impl CaptureBridge {
    pub fn new(browser: Arc<BrowserManager>, timeouts: TimeoutConfig, adskip: AdSkipConfig) -> Self {
        Self {
            browser,
            timeouts,
            adskip,
        }
    }

    /// Direct path: navigate, wait for the media element, install the
    /// ad-skip supervisor, start capture immediately.
    pub async fn capture_direct(&self, track: &TrackDescriptor) -> Result<AudioStream> {
        info!(track = %track.label(), "direct capture");
        let page = self.browser.open_page().await?;

        let prepared = async {
            page.navigate(&track.url, Duration::from_secs(self.timeouts.navigation_secs))
                .await?;
            page.wait_for_selector("video", Duration::from_secs(self.timeouts.selector_secs))
                .await?;
            Ok::<_, Error>(adskip::install(
                page.clone(),
                Duration::from_millis(self.adskip.poll_interval_ms),
            ))
        }
        .await;

        match prepared {
            Ok(handle) => self.begin(page, handle).await,
            Err(e) => {
                page.close().await;
                Err(e)
            }
        }
    }

    /// Fast path: the page is already primed (paused at the true content
    /// start, supervisor running); capture starts with near-zero setup.
    pub async fn capture_preloaded(&self, prepared: PreparedPage) -> Result<AudioStream> {
        info!(track = %prepared.track.label(), "capture from preloaded page");
        let PreparedPage { page, adskip, .. } = prepared;
        self.begin(page, adskip).await
    }

    async fn begin(&self, page: Page, adskip: AdSkipHandle) -> Result<AudioStream> {
        match start_capture(&page).await {
            Ok(events) => {
                let (tx, cancel, stream) = AudioStream::channel();
                tokio::spawn(relay(page, adskip, events, tx, cancel));
                Ok(stream)
            }
            Err(e) => {
                adskip.cancel();
                page.close().await;
                Err(e)
            }
        }
    }
}

/// Install the binding (subscribing to its events first, so no message can
/// be missed) and start the in-page recorder.
async fn start_capture(page: &Page) -> Result<mpsc::Receiver<serde_json::Value>> {
    let events = page.add_binding(SINK_BINDING).await?;
    let status = page.evaluate(&start_capture_script()).await?;

    match status.as_str() {
        Some("ok") => Ok(events),
        Some("no-audio-track") => Err(Error::Capture(
            "media element produced no audio track".into(),
        )),
        Some("no-media") => Err(Error::Capture("no media element on page".into())),
        Some(other) => Err(Error::Capture(format!(
            "in-page recorder failed to start: {}",
            other
        ))),
        None => Err(Error::Capture("unexpected capture start result".into())),
    }
}

/// Relay loop: forwards chunks in arrival order and converges every
/// termination trigger onto one cleanup.
async fn relay(
    page: Page,
    adskip: AdSkipHandle,
    mut events: mpsc::Receiver<serde_json::Value>,
    tx: mpsc::Sender<Result<bytes::Bytes>>,
    cancel: CancellationToken,
) {
    let guard = CleanupGuard::default();
    let reason;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                reason = "consumer closed the stream";
                break;
            }
            event = events.recv() => {
                match event {
                    None => {
                        let _ = tx
                            .send(Err(Error::Capture("page connection closed mid-capture".into())))
                            .await;
                        reason = "page connection closed";
                        break;
                    }
                    Some(event) => {
                        if event.get("name").and_then(|v| v.as_str()) != Some(SINK_BINDING) {
                            continue;
                        }
                        let payload = event
                            .get("payload")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        match SinkMessage::parse(payload) {
                            Ok(SinkMessage::Chunk { data }) => match decode_chunk(&data) {
                                Ok(bytes) => {
                                    if tx.send(Ok(bytes)).await.is_err() {
                                        reason = "consumer dropped the stream";
                                        break;
                                    }
                                }
                                Err(e) => {
                                    let _ = tx.send(Err(e)).await;
                                    reason = "chunk decode failed";
                                    break;
                                }
                            },
                            Ok(SinkMessage::End) => {
                                reason = "playback ended";
                                break;
                            }
                            Ok(SinkMessage::Error { message }) => {
                                let _ = tx.send(Err(Error::Capture(message))).await;
                                reason = "in-page capture error";
                                break;
                            }
                            Err(e) => {
                                warn!("malformed sink message ignored: {}", e);
                                continue;
                            }
                        }
                    }
                }
            }
        }
    }

    if guard.begin() {
        cleanup(&page, &adskip, reason).await;
    }
    // tx drops here, ending the stream if it was not already ended.
}

/// The unified cleanup routine: cancel the ad-skip poll, stop the recorder
/// if still active, close the page if still open. Idempotent via the guard
/// at the call site and the page's own close-once semantics.
async fn cleanup(page: &Page, adskip: &AdSkipHandle, reason: &str) {
    debug!(target_id = %page.target_id(), reason, "capture cleanup");
    adskip.cancel();
    if !page.is_closed() {
        let _ = page.evaluate(STOP_CAPTURE_JS).await;
        page.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_guard_admits_exactly_one_trigger() {
        let guard = CleanupGuard::default();
        assert!(guard.begin());
        assert!(!guard.begin());
        assert!(!guard.begin());
    }

    #[test]
    fn capture_script_interpolates_fully() {
        let script = start_capture_script();
        assert!(script.contains(SINK_BINDING));
        assert!(!script.contains("@@"));
    }

    #[test]
    fn capture_script_serializes_chunks_through_one_queue() {
        // Order guarantee: chunk encoding chains on a single promise, and
        // the end message queues behind pending chunks.
        let script = start_capture_script();
        assert!(script.contains("queue = queue.then"));
        assert!(script.contains("queue.then(() => send({ type: 'end' }))"));
    }

    #[test]
    fn capture_script_fails_without_audio_tracks() {
        let script = start_capture_script();
        assert!(script.contains("'no-audio-track'"));
        assert!(script.contains("getAudioTracks()"));
    }
}
