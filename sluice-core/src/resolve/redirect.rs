//! Manual redirect following with per-hop header derivation

use reqwest::header::{
    ACCEPT, HeaderMap, HeaderName, HeaderValue, LOCATION, ORIGIN, RANGE, REFERER, USER_AGENT,
};
use url::Url;

use super::classify::{PlaybackKind, classify};
use crate::SluiceError;
use crate::config::ResolverConfig;
use crate::stream::{StreamError, StreamResult};

/// Header set presented to one upstream hop.
///
/// Many IPTV origins reject requests whose Referer does not match the host
/// being contacted, so this is rebuilt for every hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamHeaders {
    pub user_agent: String,
    pub accept: String,
    pub referer: String,
    pub origin: String,
    pub extra: Vec<(String, String)>,
}

impl UpstreamHeaders {
    /// Derives the header set for a request to `url`.
    pub fn for_hop(url: &Url, config: &ResolverConfig) -> Self {
        let origin = url.origin().ascii_serialization();
        Self {
            user_agent: config.user_agent.clone(),
            accept: config.accept.clone(),
            referer: format!("{origin}/"),
            origin,
            extra: config.extra_headers.clone(),
        }
    }

    /// Headers other than User-Agent and Accept, in the order they are sent.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Referer".to_string(), self.referer.clone()),
            ("Origin".to_string(), self.origin.clone()),
        ];
        headers.extend(self.extra.iter().cloned());
        headers
    }

    /// Converts to an HTTP header map, skipping configured headers that are
    /// not valid HTTP.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in [
            (USER_AGENT, &self.user_agent),
            (ACCEPT, &self.accept),
            (REFERER, &self.referer),
            (ORIGIN, &self.origin),
        ] {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.insert(name, value);
            }
        }
        for (name, value) in &self.extra {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!("Skipping invalid upstream header {:?}", name),
            }
        }
        map
    }
}

/// Terminal response of a redirect chain.
///
/// The body has not been read; callers may stream it.
#[derive(Debug)]
pub struct ResolvedSource {
    pub response: reqwest::Response,
    pub final_url: Url,
    pub hops: usize,
}

impl ResolvedSource {
    pub fn status(&self) -> reqwest::StatusCode {
        self.response.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    /// Playback decision for the terminal response.
    pub fn playback_kind(&self) -> PlaybackKind {
        classify(self.response.headers(), &self.final_url)
    }
}

/// Outcome of a single GET, decided once per hop.
enum HopOutcome {
    Terminal(reqwest::Response),
    Redirect(Url),
    Failed(String),
}

/// Follows `Location` redirects by hand up to a configured bound.
#[derive(Debug, Clone)]
pub struct RedirectResolver {
    client: reqwest::Client,
    config: ResolverConfig,
}

impl RedirectResolver {
    /// Creates a resolver whose HTTP client never follows redirects itself.
    ///
    /// # Errors
    /// - `SluiceError::Configuration` - HTTP client could not be built
    pub fn new(config: ResolverConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SluiceError::Configuration {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// GETs `url`, following redirects until a non-redirect response.
    ///
    /// `range` is forwarded verbatim on every hop. Non-2xx terminal responses
    /// are returned, not treated as errors.
    ///
    /// # Errors
    /// - `StreamError::RedirectLoopOrTooDeep` - More than `max_redirects` hops
    /// - `StreamError::SourceUnreachable` - Network failure or unusable `Location`
    pub async fn resolve(&self, url: &Url, range: Option<&str>) -> StreamResult<ResolvedSource> {
        let mut current = url.clone();
        let mut hops = 0usize;

        loop {
            match self.hop(&current, range).await {
                HopOutcome::Terminal(response) => {
                    tracing::debug!(
                        "Resolved {} -> {} ({} hops, status {})",
                        url,
                        current,
                        hops,
                        response.status()
                    );
                    return Ok(ResolvedSource {
                        response,
                        final_url: current,
                        hops,
                    });
                }
                HopOutcome::Redirect(next) => {
                    if hops >= self.config.max_redirects {
                        tracing::warn!("Redirect chain from {} exceeded {} hops", url, hops);
                        return Err(StreamError::RedirectLoopOrTooDeep {
                            url: url.to_string(),
                            hops,
                        });
                    }
                    hops += 1;
                    tracing::debug!("Redirect hop {}: {} -> {}", hops, current, next);
                    current = next;
                }
                HopOutcome::Failed(reason) => {
                    return Err(StreamError::SourceUnreachable {
                        url: current.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    async fn hop(&self, url: &Url, range: Option<&str>) -> HopOutcome {
        let mut headers = UpstreamHeaders::for_hop(url, &self.config).to_header_map();
        if let Some(range) = range
            && let Ok(value) = HeaderValue::from_str(range)
        {
            headers.insert(RANGE, value);
        }

        let request = self.client.get(url.clone()).headers(headers).send();
        let response = match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let reason = if e.is_connect() {
                    format!("failed to connect: {e}")
                } else if e.is_timeout() {
                    format!("request timed out: {e}")
                } else {
                    format!("request failed: {e}")
                };
                return HopOutcome::Failed(reason);
            }
            Err(_) => {
                return HopOutcome::Failed(format!(
                    "no response within {}ms",
                    self.config.request_timeout.as_millis()
                ));
            }
        };

        if !response.status().is_redirection() {
            return HopOutcome::Terminal(response);
        }

        // A 3xx without Location (e.g. 304) ends the chain
        let Some(location) = response.headers().get(LOCATION) else {
            return HopOutcome::Terminal(response);
        };

        let target = location
            .to_str()
            .map_err(|e| e.to_string())
            .and_then(|location| url.join(location.trim()).map_err(|e| e.to_string()));
        match target {
            Ok(next) if matches!(next.scheme(), "http" | "https") => HopOutcome::Redirect(next),
            Ok(next) => HopOutcome::Failed(format!("redirect to unsupported URL {next}")),
            Err(e) => HopOutcome::Failed(format!("invalid redirect location: {e}")),
        }
    }
}
