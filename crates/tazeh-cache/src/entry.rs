use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use url::Url;

/// Version tag of one deployed build. Entries written under any other tag are stale.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized request identity: `"<METHOD> <absolute URL>"`.
///
/// The URL is re-serialized by the `url` crate (lower-case scheme and host,
/// default port elided). The query is part of the identity, the fragment is not.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.to_ascii_uppercase(), url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The part of an outgoing request that drives classification and keying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    pub method: String,
    pub url: Url,
}

impl ResourceRequest {
    pub fn new(method: impl AsRef<str>, url: Url) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            url,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    /// Parse an absolute URL string into a request.
    pub fn parse(method: impl AsRef<str>, url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Response payload plus the metadata needed to replay it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Only 2xx responses are ever written to a store.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Approximate stored size: body plus header bytes.
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A stored response. Never mutated after insertion; a newer `put` replaces it.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: Response,
    pub stored_at: SystemTime,
    pub generation: Generation,
}

impl CacheEntry {
    pub fn new(key: CacheKey, response: Response, generation: Generation) -> Self {
        Self {
            key,
            response,
            stored_at: SystemTime::now(),
            generation,
        }
    }

    pub fn size(&self) -> usize {
        self.key.as_str().len() + self.response.size()
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            key: self.key.clone(),
            generation: self.generation.clone(),
            stored_at: self.stored_at,
            size: self.size(),
        }
    }
}

/// Metadata view of an entry, as produced by store enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: CacheKey,
    pub generation: Generation,
    pub stored_at: SystemTime,
    pub size: usize,
}
