//! Audio extraction from the video platform.
//!
//! Resolution turns queries into Track Descriptors; capture turns a track
//! into a continuous byte stream of encoded audio for the playback engine,
//! preferring a speculatively primed page when one is cached.

pub mod adskip;
pub mod capture;
pub mod preload;
pub mod resolver;
pub mod stream;

use std::sync::Arc;
use tracing::{debug, info};

use tubetap_browser::BrowserManager;
use tubetap_core::{ExtractorConfig, Result, TrackDescriptor};

pub use capture::CaptureBridge;
pub use preload::{PreloadManager, PreparedPage};
pub use resolver::Resolver;
pub use stream::AudioStream;

/// The extractor facade: resolution, preloading, and capture around one
/// shared browser session.
pub struct Extractor {
    browser: Arc<BrowserManager>,
    resolver: Resolver,
    preload: PreloadManager,
    capture: CaptureBridge,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let browser = Arc::new(BrowserManager::new(
            config.browser.clone(),
            config.ad_domains.clone(),
        ));
        let resolver = Resolver::new(browser.clone(), config.timeouts.clone());
        let preload = PreloadManager::new(
            browser.clone(),
            config.preload.clone(),
            config.adskip.clone(),
            config.timeouts.clone(),
        );
        let capture = CaptureBridge::new(
            browser.clone(),
            config.timeouts.clone(),
            config.adskip.clone(),
        );
        Self {
            browser,
            resolver,
            preload,
            capture,
        }
    }

    /// Whether a query belongs to this extractor at all.
    pub fn validate(&self, query: &str) -> bool {
        resolver::validate(query)
    }

    /// Resolve a query (free text or platform URL) into a Track Descriptor.
    pub async fn resolve(
        &self,
        query: &str,
        requested_by: &str,
    ) -> Result<Option<TrackDescriptor>> {
        self.resolver.handle(query, requested_by).await
    }

    /// Speculatively prime one upcoming track.
    pub async fn preload_one(&self, track: &TrackDescriptor) -> Result<()> {
        self.preload.preload_one(track).await
    }

    /// Prime up to the cache bound from an ordered upcoming-tracks list.
    pub async fn preload_batch(&self, tracks: &[TrackDescriptor]) -> usize {
        self.preload.preload_batch(tracks).await
    }

    /// Discard one primed page.
    pub async fn cancel_preload(&self, url: &str) {
        self.preload.cancel(url).await
    }

    /// Open the audio byte stream for a track: the primed page when one is
    /// cached, the direct path otherwise.
    pub async fn open_stream(&self, track: &TrackDescriptor) -> Result<AudioStream> {
        if let Some(prepared) = self.preload.consume(track).await {
            info!(track = %track.label(), "using preloaded page");
            return self.capture.capture_preloaded(prepared).await;
        }
        debug!(track = %track.label(), "no preloaded page, using direct path");
        self.capture.capture_direct(track).await
    }

    /// Tear everything down: primed pages first, then the shared browser.
    /// Idempotent; safe to call without any prior activity.
    pub async fn deactivate(&self) {
        self.preload.cleanup_all().await;
        self.browser.deactivate().await;
    }
}
