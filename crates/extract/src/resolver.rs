//! Query resolution: free text or a platform URL → a Track Descriptor.
//!
//! Every operation here opens its own ephemeral page and closes it before
//! returning, on the success path and the error path alike.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use tubetap_browser::{BrowserManager, Page};
use tubetap_core::config::TimeoutConfig;
use tubetap_core::track::SOURCE_YOUTUBE;
use tubetap_core::{Error, Result, TrackDescriptor, TrackMetadata};

/// Hosts recognized as the platform's own.
const PLATFORM_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

static LOCAL_AUDIO_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(mp3|wav|flac|ogg|m4a|opus|aac)$").unwrap());

static WINDOWS_DRIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]:[/\\]").unwrap());

static DURATION_MS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2}):([0-5]\d)$").unwrap());

static DURATION_HMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}):([0-5]\d):([0-5]\d)$").unwrap());

static VIDEO_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{6,}$").unwrap());

/// First search result, as extracted in-page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchHit {
    title: Option<String>,
    url: Option<String>,
    duration_text: Option<String>,
    author: Option<String>,
    thumbnail: Option<String>,
}

/// Watch-page metadata, as extracted in-page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaInfo {
    title: Option<String>,
    duration_secs: Option<f64>,
    author: Option<String>,
    thumbnail: Option<String>,
}

const SEARCH_RESULT_SELECTOR: &str = "ytd-video-renderer";

const EXTRACT_FIRST_RESULT_JS: &str = r#"(() => {
    const el = document.querySelector('ytd-video-renderer');
    if (!el) return null;
    const link = el.querySelector('a#video-title');
    const time = el.querySelector('ytd-thumbnail-overlay-time-status-renderer span, span.ytd-thumbnail-overlay-time-status-renderer');
    const channel = el.querySelector('ytd-channel-name a, #channel-name a');
    const thumb = el.querySelector('img');
    return {
        title: link ? link.textContent.trim() : null,
        url: link ? link.href : null,
        durationText: time ? time.textContent.trim() : null,
        author: channel ? channel.textContent.trim() : null,
        thumbnail: thumb && thumb.src ? thumb.src : null,
    };
})()"#;

const MEDIA_READY_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    return !!(v && isFinite(v.duration) && v.duration > 0);
})()"#;

const EXTRACT_MEDIA_INFO_JS: &str = r#"(() => {
    const v = document.querySelector('video');
    const meta = (key) => {
        const el = document.querySelector(`meta[property="${key}"], meta[name="${key}"]`);
        return el && el.content ? el.content : null;
    };
    const owner = document.querySelector('ytd-channel-name a, #owner #channel-name a');
    const byline = document.querySelector('span[itemprop="author"] link[itemprop="name"]');
    return {
        title: meta('og:title') || document.title.replace(/ - YouTube$/, ''),
        durationSecs: v && isFinite(v.duration) ? v.duration : null,
        author: owner ? owner.textContent.trim()
              : byline ? byline.getAttribute('content') : null,
        thumbnail: meta('og:image'),
    };
})()"#;

/// Resolves queries against the platform's search and watch pages.
pub struct Resolver {
    browser: Arc<BrowserManager>,
    timeouts: TimeoutConfig,
}

impl Resolver {
    pub fn new(browser: Arc<BrowserManager>, timeouts: TimeoutConfig) -> Self {
        Self { browser, timeouts }
    }

    /// Resolve a query into a Track Descriptor: direct metadata fetch for a
    /// platform URL, top search hit for free text. Returns `None` when the
    /// top hit is unusable (no link, no parseable duration shape at all).
    pub async fn handle(&self, query: &str, requested_by: &str) -> Result<Option<TrackDescriptor>> {
        if let Some(url) = platform_url(query) {
            let canonical = canonicalize(&url)?;
            let info = self.media_info(&canonical).await?;
            let duration_secs = info.duration_secs.map(|d| d.round() as u64).unwrap_or(0);
            Ok(Some(TrackDescriptor {
                title: info.title.unwrap_or_else(|| canonical.clone()),
                url: canonical,
                duration_secs,
                author: info.author.unwrap_or_default(),
                thumbnail: info.thumbnail,
                source: SOURCE_YOUTUBE.into(),
                requested_by: requested_by.into(),
                metadata: TrackMetadata {
                    expected_duration_secs: Some(duration_secs),
                    extra: serde_json::Value::Null,
                },
            }))
        } else {
            let hit = self.search(query).await?;
            let Some(hit_url) = hit.url else {
                debug!(query, "top search hit had no link, nothing usable");
                return Ok(None);
            };
            let Some(duration_text) = hit.duration_text else {
                debug!(query, "top search hit had no duration (live stream?), nothing usable");
                return Ok(None);
            };
            let parsed = Url::parse(&hit_url)
                .map_err(|e| Error::NotFound(format!("unparseable result link: {}", e)))?;
            let canonical = canonicalize(&parsed)?;
            let duration_secs = parse_duration(&duration_text)?;
            Ok(Some(TrackDescriptor {
                title: hit.title.unwrap_or_else(|| canonical.clone()),
                url: canonical,
                duration_secs,
                author: hit.author.unwrap_or_default(),
                thumbnail: hit.thumbnail,
                source: SOURCE_YOUTUBE.into(),
                requested_by: requested_by.into(),
                metadata: TrackMetadata {
                    expected_duration_secs: Some(duration_secs),
                    extra: serde_json::Value::Null,
                },
            }))
        }
    }

    /// Search the platform and extract the first rendered result.
    async fn search(&self, query: &str) -> Result<SearchHit> {
        let page = self.browser.open_page().await?;
        let result = self.search_on(&page, query).await;
        page.close().await;
        result
    }

    async fn search_on(&self, page: &Page, query: &str) -> Result<SearchHit> {
        let search_url = format!(
            "https://www.youtube.com/results?search_query={}",
            urlencoding::encode(query)
        );
        page.navigate(&search_url, Duration::from_secs(self.timeouts.navigation_secs))
            .await?;
        page.wait_for_selector(
            SEARCH_RESULT_SELECTOR,
            Duration::from_secs(self.timeouts.selector_secs),
        )
        .await?;

        let value = page.evaluate(EXTRACT_FIRST_RESULT_JS).await?;
        if value.is_null() {
            return Err(Error::NotFound(format!("no search results for {:?}", query)));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch live metadata from an item's watch page.
    async fn media_info(&self, canonical_url: &str) -> Result<MediaInfo> {
        let page = self.browser.open_page().await?;
        let result = self.media_info_on(&page, canonical_url).await;
        page.close().await;
        result
    }

    async fn media_info_on(&self, page: &Page, canonical_url: &str) -> Result<MediaInfo> {
        page.navigate(canonical_url, Duration::from_secs(self.timeouts.navigation_secs))
            .await?;
        page.wait_for_selector("video", Duration::from_secs(self.timeouts.selector_secs))
            .await?;

        // The media element renders before its duration is known; wait for
        // the live duration to be readable.
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.timeouts.selector_secs);
        loop {
            if page.evaluate(MEDIA_READY_JS).await?.as_bool() == Some(true) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NotFound(format!(
                    "media element never became ready on {}",
                    canonical_url
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let value = page.evaluate(EXTRACT_MEDIA_INFO_JS).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Reject inputs that belong to a local-file extractor: path-looking strings
/// and anything with a recognized local audio extension. Platform URLs and
/// free text pass.
pub fn validate(query: &str) -> bool {
    let q = query.trim();
    if q.is_empty() {
        return false;
    }
    if q.starts_with('/')
        || q.starts_with("./")
        || q.starts_with("../")
        || q.starts_with('~')
        || q.starts_with("file://")
        || WINDOWS_DRIVE.is_match(q)
    {
        return false;
    }
    if LOCAL_AUDIO_EXT.is_match(q) {
        return false;
    }
    true
}

/// Parse the query as a platform URL, if it is one.
pub fn platform_url(query: &str) -> Option<Url> {
    let url = Url::parse(query.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    PLATFORM_HOSTS
        .contains(&host)
        .then_some(url)
}

/// Extract the video id and rebuild the one canonical form used as the
/// cache/dedup key everywhere.
pub fn canonicalize(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::NotFound("url has no host".into()))?;

    let id = if host == "youtu.be" {
        url.path_segments().and_then(|mut s| s.next()).map(String::from)
    } else if url.path() == "/watch" {
        url.query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
    } else if let Some(rest) = url.path().strip_prefix("/shorts/") {
        rest.split('/').next().map(String::from)
    } else {
        None
    };

    match id {
        Some(id) if VIDEO_ID.is_match(&id) => {
            Ok(format!("https://www.youtube.com/watch?v={}", id))
        }
        _ => Err(Error::NotFound(format!("no video id in {}", url))),
    }
}

/// Convert a rendered duration string (`m:ss` or `h:mm:ss`) into whole
/// seconds. No other shape is valid.
pub fn parse_duration(text: &str) -> Result<u64> {
    let t = text.trim();
    if let Some(caps) = DURATION_MS.captures(t) {
        let minutes: u64 = caps[1].parse().map_err(|_| Error::InvalidDuration(t.into()))?;
        let seconds: u64 = caps[2].parse().map_err(|_| Error::InvalidDuration(t.into()))?;
        return Ok(minutes * 60 + seconds);
    }
    if let Some(caps) = DURATION_HMS.captures(t) {
        let hours: u64 = caps[1].parse().map_err(|_| Error::InvalidDuration(t.into()))?;
        let minutes: u64 = caps[2].parse().map_err(|_| Error::InvalidDuration(t.into()))?;
        let seconds: u64 = caps[3].parse().map_err(|_| Error::InvalidDuration(t.into()))?;
        return Ok(hours * 3600 + minutes * 60 + seconds);
    }
    Err(Error::InvalidDuration(t.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_seconds() {
        assert_eq!(parse_duration("1:23").unwrap(), 83);
        assert_eq!(parse_duration("0:07").unwrap(), 7);
        assert_eq!(parse_duration("59:59").unwrap(), 3599);
    }

    #[test]
    fn parses_hours_minutes_seconds() {
        assert_eq!(parse_duration("1:02:03").unwrap(), 3723);
        assert_eq!(parse_duration("10:00:00").unwrap(), 36000);
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "90", "1:9", "1:60", "1:2:3:4", "abc", "-1:00", "1::23"] {
            assert!(
                matches!(parse_duration(bad), Err(Error::InvalidDuration(_))),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn validate_rejects_local_paths() {
        assert!(!validate("/home/user/song.mp3"));
        assert!(!validate("./song.ogg"));
        assert!(!validate("../music/track.flac"));
        assert!(!validate("~/music/track.wav"));
        assert!(!validate(r"C:\Music\song.mp3"));
        assert!(!validate("file:///tmp/a.opus"));
        assert!(!validate("favourite tune.m4a"));
        assert!(!validate(""));
    }

    #[test]
    fn validate_accepts_queries_and_urls() {
        assert!(validate("never gonna give you up"));
        assert!(validate("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(validate("https://youtu.be/dQw4w9WgXcQ"));
        // Mentioning a format by name is not a file path.
        assert!(validate("best flac rips mix"));
    }

    #[test]
    fn recognizes_platform_urls() {
        assert!(platform_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ").is_some());
        assert!(platform_url("https://youtu.be/dQw4w9WgXcQ").is_some());
        assert!(platform_url("https://music.youtube.com/watch?v=dQw4w9WgXcQ").is_some());
        assert!(platform_url("https://vimeo.com/12345").is_none());
        assert!(platform_url("not a url").is_none());
        assert!(platform_url("ftp://youtube.com/watch?v=x").is_none());
    }

    #[test]
    fn canonicalizes_url_forms() {
        let canonical = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        for form in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s",
            "https://youtu.be/dQw4w9WgXcQ?si=share",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ&list=RD",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            let url = Url::parse(form).unwrap();
            assert_eq!(canonicalize(&url).unwrap(), canonical, "form {:?}", form);
        }
    }

    #[test]
    fn canonicalize_rejects_unrecognized_paths() {
        let url = Url::parse("https://www.youtube.com/feed/subscriptions").unwrap();
        assert!(matches!(canonicalize(&url), Err(Error::NotFound(_))));
    }

    #[test]
    fn search_hit_deserializes_from_page_extraction() {
        let hit: SearchHit = serde_json::from_value(serde_json::json!({
            "title": "Song",
            "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "durationText": "3:32",
            "author": "Artist",
            "thumbnail": null,
        }))
        .unwrap();
        assert_eq!(hit.duration_text.as_deref(), Some("3:32"));
        assert!(hit.thumbnail.is_none());
    }
}
