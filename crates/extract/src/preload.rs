//! Speculative preparation of upcoming queue items.
//!
//! A primed page has already navigated, played through any leading ads
//! (auto-skipped), and sits paused at the true content start, so capture can
//! begin with near-zero latency when the track is actually needed. The cache
//! is one owned structure: bounded, age-limited, swept on access. No
//! eviction timers are scattered across call sites.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tubetap_browser::{BrowserManager, Page};
use tubetap_core::config::{AdSkipConfig, PreloadConfig, TimeoutConfig};
use tubetap_core::{Error, Result, TrackDescriptor};

use crate::adskip::{self, AdSkipHandle};

const PLAY_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return 'no-media';
    v.play().catch(() => {});
    return 'playing';
})()"#;

/// True content start is confirmed only when no ad marker is present and the
/// element is actually playing decodable media.
const CONTENT_STATE_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return 'no-media';
    const player = document.querySelector('.html5-video-player');
    if (player && (player.classList.contains('ad-showing')
        || player.classList.contains('ad-interrupting'))) return 'ad';
    if (v.currentTime > 0 && v.readyState >= 2) return 'content';
    return 'loading';
})()"#;

const PAUSE_AT_START_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    if (!v) return 'no-media';
    v.pause();
    v.currentTime = 0;
    return 'paused';
})()"#;

type PrepFuture = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// A primed page handed off for immediate capture. Ownership of the page and
/// the running ad-skip poll transfers with it.
pub struct PreparedPage {
    pub page: Page,
    pub adskip: AdSkipHandle,
    pub track: TrackDescriptor,
}

struct CacheEntry {
    page: Page,
    adskip: AdSkipHandle,
    track: TrackDescriptor,
}

/// Outcome of removing a key from the TTL cache.
enum Taken<T> {
    Hit(T),
    Stale(T),
    Miss,
}

/// Bounded cache with a per-entry age limit. Stale entries are detected on
/// access; `sweep` collects them for the caller to clean up.
struct TtlCache<T> {
    entries: HashMap<String, (T, Instant)>,
    max_entries: usize,
    max_age: Duration,
}

impl<T> TtlCache<T> {
    fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            max_age,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains_fresh(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|(_, created)| created.elapsed() <= self.max_age)
    }

    /// Insert, refusing when the capacity bound would be exceeded (the value
    /// comes back to the caller for cleanup).
    fn insert(&mut self, key: String, value: T) -> std::result::Result<(), T> {
        if self.entries.len() >= self.max_entries {
            return Err(value);
        }
        self.entries.insert(key, (value, Instant::now()));
        Ok(())
    }

    fn take(&mut self, key: &str) -> Taken<T> {
        match self.entries.remove(key) {
            Some((value, created)) if created.elapsed() <= self.max_age => Taken::Hit(value),
            Some((value, _)) => Taken::Stale(value),
            None => Taken::Miss,
        }
    }

    fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    /// Remove and return every stale entry.
    fn sweep(&mut self) -> Vec<T> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (_, created))| created.elapsed() > self.max_age)
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(value, _)| value))
            .collect()
    }

    fn drain(&mut self) -> Vec<T> {
        self.entries.drain().map(|(_, (value, _))| value).collect()
    }
}

struct Inner {
    browser: Arc<BrowserManager>,
    preload_cfg: PreloadConfig,
    adskip_cfg: AdSkipConfig,
    timeouts: TimeoutConfig,
    cache: Mutex<TtlCache<CacheEntry>>,
    in_flight: Mutex<HashMap<String, PrepFuture>>,
}

/// Maintains the bounded, age-limited cache of primed pages, keyed by
/// canonical URL.
pub struct PreloadManager {
    inner: Arc<Inner>,
}

enum Action {
    AlreadyCached,
    Declined,
    Await(PrepFuture),
}

impl PreloadManager {
    pub fn new(
        browser: Arc<BrowserManager>,
        preload_cfg: PreloadConfig,
        adskip_cfg: AdSkipConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        let cache = TtlCache::new(
            preload_cfg.max_count,
            Duration::from_secs(preload_cfg.max_age_secs),
        );
        Self {
            inner: Arc::new(Inner {
                browser,
                preload_cfg,
                adskip_cfg,
                timeouts,
                cache: Mutex::new(cache),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Prime one track. Already-cached URLs are a no-op; a URL already being
    /// prepared is awaited rather than prepared twice; a full cache declines
    /// with `ResourceExhausted` (the caller falls back to the direct path
    /// when the track actually plays).
    pub async fn preload_one(&self, track: &TrackDescriptor) -> Result<()> {
        let url = track.url.clone();

        let (stale, action) = {
            // Lock order is always cache before in_flight.
            let mut cache = self.inner.cache.lock().await;
            let stale = cache.sweep();

            if cache.contains_fresh(&url) {
                (stale, Action::AlreadyCached)
            } else {
                let mut in_flight = self.inner.in_flight.lock().await;
                if let Some(fut) = in_flight.get(&url) {
                    (stale, Action::Await(fut.clone()))
                } else if cache.len() + in_flight.len() >= self.inner.preload_cfg.max_count {
                    (stale, Action::Declined)
                } else {
                    let fut = make_prep_future(self.inner.clone(), track.clone());
                    in_flight.insert(url.clone(), fut.clone());
                    (stale, Action::Await(fut))
                }
            }
        };

        for entry in stale {
            info!(url = %entry.track.url, "preload entry aged out, discarding");
            discard(entry).await;
        }

        match action {
            Action::AlreadyCached => {
                debug!(url = %url, "already primed, nothing to do");
                Ok(())
            }
            Action::Declined => {
                warn!(url = %url, "preload cache full, declining");
                Err(Error::ResourceExhausted(self.inner.preload_cfg.max_count))
            }
            Action::Await(fut) => match fut.await {
                Ok(()) => Ok(()),
                Err(shared) => Err(match Arc::try_unwrap(shared) {
                    Ok(err) => err,
                    Err(arc) => Error::Other(arc.to_string()),
                }),
            },
        }
    }

    /// Sequentially prime candidates from an ordered upcoming-tracks list.
    /// One candidate's failure never aborts the batch. Returns how many
    /// candidates are primed (or were already).
    pub async fn preload_batch(&self, tracks: &[TrackDescriptor]) -> usize {
        let mut primed = 0;
        for track in tracks {
            match self.preload_one(track).await {
                Ok(()) => primed += 1,
                Err(Error::ResourceExhausted(max)) => {
                    info!(
                        track = %track.label(),
                        "cache holds {} primed pages, skipping (will use direct capture)",
                        max
                    );
                }
                Err(e) => {
                    warn!(track = %track.label(), "preload failed: {}", e);
                }
            }
        }
        primed
    }

    /// Atomically take the primed page for a track. A miss (absent or aged
    /// out) means the caller should use the direct path. A consumed entry is
    /// never handed to a second caller.
    pub async fn consume(&self, track: &TrackDescriptor) -> Option<PreparedPage> {
        let taken = self.inner.cache.lock().await.take(&track.url);
        match taken {
            Taken::Hit(entry) => {
                debug!(url = %track.url, "preload cache hit");
                Some(PreparedPage {
                    page: entry.page,
                    adskip: entry.adskip,
                    track: entry.track,
                })
            }
            Taken::Stale(entry) => {
                info!(url = %track.url, "preload entry aged out, discarding");
                discard(entry).await;
                None
            }
            Taken::Miss => {
                debug!(url = %track.url, "preload cache miss");
                None
            }
        }
    }

    /// Discard one cached page.
    pub async fn cancel(&self, url: &str) {
        let entry = self.inner.cache.lock().await.remove(url);
        if let Some(entry) = entry {
            info!(url = %url, "preload cancelled");
            discard(entry).await;
        }
    }

    /// Discard every cached page. Runs on extractor deactivation.
    pub async fn cleanup_all(&self) {
        let entries = self.inner.cache.lock().await.drain();
        for entry in entries {
            discard(entry).await;
        }
    }
}

fn make_prep_future(inner: Arc<Inner>, track: TrackDescriptor) -> PrepFuture {
    let url = track.url.clone();
    async move {
        let result = prepare(&inner, track).await.map_err(Arc::new);
        // The preparation removes itself exactly once, whatever the outcome.
        inner.in_flight.lock().await.remove(&url);
        if let Err(e) = &result {
            warn!(url = %url, "preload preparation failed: {}", e);
        }
        result
    }
    .boxed()
    .shared()
}

/// Open, navigate, prime, cache. On failure the page is closed and nothing
/// is cached.
async fn prepare(inner: &Inner, track: TrackDescriptor) -> Result<()> {
    debug!(track = %track.label(), "preparing preload");
    let page = inner.browser.open_page().await?;

    match prime(inner, &page, &track).await {
        Ok(adskip) => {
            let url = track.url.clone();
            let entry = CacheEntry {
                page: page.clone(),
                adskip,
                track,
            };
            let mut cache = inner.cache.lock().await;
            match cache.insert(url.clone(), entry) {
                Ok(()) => {
                    info!(url = %url, "track primed and cached");
                    Ok(())
                }
                Err(entry) => {
                    drop(cache);
                    discard(entry).await;
                    Err(Error::ResourceExhausted(inner.preload_cfg.max_count))
                }
            }
        }
        Err(e) => {
            page.close().await;
            Err(e)
        }
    }
}

/// Navigate, wait for media, install the supervisor, and hold until the true
/// content start is confirmed, then pause at position zero.
async fn prime(inner: &Inner, page: &Page, track: &TrackDescriptor) -> Result<AdSkipHandle> {
    page.navigate(
        &track.url,
        Duration::from_secs(inner.timeouts.navigation_secs),
    )
    .await?;
    page.wait_for_selector("video", Duration::from_secs(inner.timeouts.selector_secs))
        .await?;

    let adskip = adskip::install(
        page.clone(),
        Duration::from_millis(inner.adskip_cfg.poll_interval_ms),
    );

    match wait_for_content_start(inner, page).await {
        Ok(()) => Ok(adskip),
        Err(e) => {
            adskip.cancel();
            Err(e)
        }
    }
}

/// Let leading ad content play out (the supervisor skips what it can) until
/// the element is playing real content, bounded.
async fn wait_for_content_start(inner: &Inner, page: &Page) -> Result<()> {
    page.evaluate(PLAY_JS).await?;

    let poll = Duration::from_millis(inner.adskip_cfg.poll_interval_ms);
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(inner.preload_cfg.prime_timeout_secs);

    loop {
        tokio::time::sleep(poll).await;
        let state = page.evaluate(CONTENT_STATE_JS).await?;
        if state.as_str() == Some("content") {
            page.evaluate(PAUSE_AT_START_JS).await?;
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::NavigationTimeout(format!(
                "content start not confirmed within {}s",
                inner.preload_cfg.prime_timeout_secs
            )));
        }
    }
}

async fn discard(entry: CacheEntry) {
    entry.adskip.cancel();
    entry.page.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubetap_core::config::BrowserConfig;
    use tubetap_core::track::SOURCE_YOUTUBE;
    use tubetap_core::TrackMetadata;

    const FRESH: Duration = Duration::from_secs(300);

    #[test]
    fn cache_enforces_capacity() {
        let mut cache = TtlCache::new(3, FRESH);
        assert!(cache.insert("a".into(), 1).is_ok());
        assert!(cache.insert("b".into(), 2).is_ok());
        assert!(cache.insert("c".into(), 3).is_ok());
        assert_eq!(cache.insert("d".into(), 4), Err(4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn cache_take_is_single_consumer() {
        let mut cache = TtlCache::new(3, FRESH);
        cache.insert("a".into(), 1).unwrap();
        assert!(matches!(cache.take("a"), Taken::Hit(1)));
        assert!(matches!(cache.take("a"), Taken::Miss));
    }

    #[test]
    fn cache_take_reports_stale_entries() {
        let mut cache = TtlCache::new(3, Duration::ZERO);
        cache.insert("a".into(), 1).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(cache.take("a"), Taken::Stale(1)));
        assert!(matches!(cache.take("a"), Taken::Miss));
    }

    #[test]
    fn cache_sweep_collects_only_stale() {
        let mut cache = TtlCache::new(3, Duration::ZERO);
        cache.insert("a".into(), 1).unwrap();
        cache.insert("b".into(), 2).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let mut swept = cache.sweep();
        swept.sort();
        assert_eq!(swept, vec![1, 2]);
        assert_eq!(cache.len(), 0);

        let mut fresh_cache = TtlCache::new(3, FRESH);
        fresh_cache.insert("a".into(), 1).unwrap();
        assert!(fresh_cache.sweep().is_empty());
        assert_eq!(fresh_cache.len(), 1);
    }

    #[test]
    fn cache_frees_capacity_after_take() {
        let mut cache = TtlCache::new(1, FRESH);
        cache.insert("a".into(), 1).unwrap();
        assert!(matches!(cache.take("a"), Taken::Hit(1)));
        assert!(cache.insert("b".into(), 2).is_ok());
    }

    #[test]
    fn cache_contains_fresh_only() {
        let mut cache = TtlCache::new(3, Duration::ZERO);
        cache.insert("a".into(), 1).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(!cache.contains_fresh("a"));
    }

    fn test_manager() -> PreloadManager {
        PreloadManager::new(
            Arc::new(BrowserManager::new(BrowserConfig::default(), vec![])),
            PreloadConfig::default(),
            AdSkipConfig::default(),
            TimeoutConfig::default(),
        )
    }

    fn test_track(url: &str) -> TrackDescriptor {
        TrackDescriptor {
            title: "t".into(),
            url: url.into(),
            duration_secs: 60,
            author: "a".into(),
            thumbnail: None,
            source: SOURCE_YOUTUBE.into(),
            requested_by: "tester".into(),
            metadata: TrackMetadata::default(),
        }
    }

    #[tokio::test]
    async fn consume_on_empty_cache_is_a_miss() {
        let manager = test_manager();
        let track = test_track("https://www.youtube.com/watch?v=missing00000");
        assert!(manager.consume(&track).await.is_none());
    }

    #[tokio::test]
    async fn cancel_of_unknown_url_is_a_noop() {
        let manager = test_manager();
        manager.cancel("https://www.youtube.com/watch?v=missing00000").await;
        manager.cleanup_all().await;
    }
}
