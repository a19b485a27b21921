use serde::{Deserialize, Serialize};

/// Source tag for tracks resolved from the video platform.
pub const SOURCE_YOUTUBE: &str = "youtube";

/// Metadata record for one playable media item.
///
/// Immutable after creation; exclusively owned by the caller once returned
/// from resolution. The canonical `url` doubles as the preload cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    pub title: String,
    /// Canonical URL uniquely identifying the item.
    pub url: String,
    /// Duration in whole seconds.
    pub duration_secs: u64,
    pub author: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Which extractor produced this descriptor (e.g. "youtube").
    pub source: String,
    /// Opaque requester identity, passed through unchanged.
    pub requested_by: String,
    #[serde(default)]
    pub metadata: TrackMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    /// Duration the content is expected to have. Playback running well past
    /// this is a signal that un-skipped ad content is still playing.
    #[serde(default)]
    pub expected_duration_secs: Option<u64>,
    /// Opaque caller-supplied extras, passed through unchanged.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl TrackDescriptor {
    /// Display label used in logs: `title (author)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.title, self.author)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrackDescriptor {
        TrackDescriptor {
            title: "Some Song".into(),
            url: "https://www.youtube.com/watch?v=abc123DEF45".into(),
            duration_secs: 214,
            author: "Some Artist".into(),
            thumbnail: Some("https://i.ytimg.com/vi/abc123DEF45/hq720.jpg".into()),
            source: SOURCE_YOUTUBE.into(),
            requested_by: "user#1234".into(),
            metadata: TrackMetadata {
                expected_duration_secs: Some(214),
                extra: serde_json::Value::Null,
            },
        }
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["durationSecs"], 214);
        assert_eq!(json["requestedBy"], "user#1234");
        assert_eq!(json["source"], "youtube");
        assert_eq!(json["metadata"]["expectedDurationSecs"], 214);
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let track: TrackDescriptor = serde_json::from_str(
            r#"{
                "title": "t",
                "url": "https://www.youtube.com/watch?v=x",
                "durationSecs": 1,
                "author": "a",
                "source": "youtube",
                "requestedBy": "r"
            }"#,
        )
        .unwrap();
        assert!(track.thumbnail.is_none());
        assert!(track.metadata.expected_duration_secs.is_none());
    }

    #[test]
    fn label_combines_title_and_author() {
        assert_eq!(sample().label(), "Some Song (Some Artist)");
    }
}
