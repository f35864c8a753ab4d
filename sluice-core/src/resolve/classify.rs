//! Playback decision for a resolved source

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::Serialize;
use url::Url;

/// MIME types announcing an HLS playlist.
const HLS_MIME_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// How the browser should consume a resolved source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackKind {
    /// MP4-like resource the player can open directly
    Direct,
    /// Already an HLS manifest
    HlsNative,
    /// Anything else, including raw MPEG-TS live feeds
    NeedsTranscode,
}

impl PlaybackKind {
    /// Value of the `type` field returned by `/resolve`.
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackKind::Direct => "direct",
            PlaybackKind::HlsNative => "hls",
            PlaybackKind::NeedsTranscode => "transcode",
        }
    }
}

impl std::fmt::Display for PlaybackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides how `final_url` should be played from its response headers.
///
/// Unknown or missing content types fall through to `NeedsTranscode`.
pub fn classify(headers: &HeaderMap, final_url: &Url) -> PlaybackKind {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let mime = content_type
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default();

    let is_playlist_path = final_url.path().to_ascii_lowercase().ends_with(".m3u8");
    if HLS_MIME_TYPES.contains(&mime) || is_playlist_path {
        return PlaybackKind::HlsNative;
    }

    if mime.contains("mp4") {
        return PlaybackKind::Direct;
    }

    PlaybackKind::NeedsTranscode
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_reference_decisions() {
        assert_eq!(
            classify(&headers("video/mp4"), &url("http://x/a.mp4")),
            PlaybackKind::Direct
        );
        assert_eq!(
            classify(&headers(""), &url("http://x/a.m3u8")),
            PlaybackKind::HlsNative
        );
        assert_eq!(
            classify(&headers("video/mp2t"), &url("http://x/a.ts")),
            PlaybackKind::NeedsTranscode
        );
    }

    #[test]
    fn test_hls_mime_with_parameters() {
        assert_eq!(
            classify(
                &headers("Application/X-MpegURL; charset=utf-8"),
                &url("http://x/play?id=1")
            ),
            PlaybackKind::HlsNative
        );
    }

    #[test]
    fn test_missing_content_type_needs_transcode() {
        assert_eq!(
            classify(&HeaderMap::new(), &url("http://x/live/123")),
            PlaybackKind::NeedsTranscode
        );
        assert_eq!(
            classify(&headers("application/octet-stream"), &url("http://x/a.mkv")),
            PlaybackKind::NeedsTranscode
        );
    }

    #[test]
    fn test_playlist_suffix_wins_over_mp4_type() {
        assert_eq!(
            classify(&headers("video/mp4"), &url("http://x/master.M3U8")),
            PlaybackKind::HlsNative
        );
    }
}
