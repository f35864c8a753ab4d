//! Stable registry keys derived from source URLs

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};
use url::Url;

use super::types::{StreamError, StreamResult};

/// SHA-1 of a normalized source URL.
///
/// Two requests whose URLs differ only in fragment, query order, default
/// port, host case or configured cache-busting parameters map to the same
/// fingerprint and therefore share one transcoding session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamFingerprint([u8; 20]);

impl StreamFingerprint {
    /// Creates a fingerprint from a raw 20-byte digest.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Fingerprints an already normalized URL.
    pub fn of_normalized(url: &Url) -> Self {
        let digest = Sha1::digest(url.as_str().as_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    /// Normalizes `raw` and fingerprints the result.
    ///
    /// # Errors
    /// - `StreamError::InvalidSourceUrl` - Not an absolute http(s) URL
    pub fn from_source(raw: &str, noise_keys: &[String]) -> StreamResult<(Self, Url)> {
        let normalized = normalize_source_url(raw, noise_keys)?;
        Ok((Self::of_normalized(&normalized), normalized))
    }

    /// Parses the 40-character lowercase or uppercase hex form.
    ///
    /// # Errors
    /// - `StreamError::InvalidFingerprint` - Wrong length or non-hex characters
    pub fn from_hex(value: &str) -> StreamResult<Self> {
        let invalid = || StreamError::InvalidFingerprint {
            value: value.chars().take(64).collect(),
        };
        if value.len() != 40 {
            return Err(invalid());
        }
        let bytes = hex::decode(value).map_err(|_| invalid())?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }

    /// Returns reference to underlying 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for StreamFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamFingerprint({self})")
    }
}

impl FromStr for StreamFingerprint {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for StreamFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Normalizes a client-supplied source URL for fingerprinting.
///
/// Scheme and host are lowercased and default ports dropped by the URL
/// parser; the fragment and any query key listed in `noise_keys` are
/// removed and the remaining query pairs are sorted.
///
/// # Errors
/// - `StreamError::InvalidSourceUrl` - Unparseable, relative, hostless or non-http(s)
pub fn normalize_source_url(raw: &str, noise_keys: &[String]) -> StreamResult<Url> {
    let invalid = |reason: &str| StreamError::InvalidSourceUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !noise_keys.iter().any(|noise| noise == key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(url)
}
