//! Client for the backing file store.
//!
//! The cache is strictly read-through: on a miss the daemon fetches the
//! object from the configured upstream over plain HTTP and streams it back
//! while offering a copy to the cache.

use anyhow::{Context, Result};
use futures::StreamExt;

use crate::cache::ByteStream;
use crate::config::UpstreamConfig;

/// An object fetched from the backing store.
pub struct FetchedObject {
    /// Declared byte length, when the upstream sent a `Content-Length`.
    /// Without it the object cannot be admitted to the cache.
    pub size: Option<u64>,
    pub stream: ByteStream,
}

/// Handle to the backing file store.
#[derive(Clone)]
pub struct UpstreamStore {
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamStore {
    pub fn new(config: &UpstreamConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn object_url(&self, uid: &str) -> String {
        format!("{}/{}", self.base_url, uid)
    }

    /// Fetch an object by uid.  Returns `Ok(None)` when the upstream does
    /// not know the object; other non-success statuses are errors.
    pub async fn fetch(&self, uid: &str) -> Result<Option<FetchedObject>> {
        let url = self.object_url(uid);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("upstream returned {} for {url}", resp.status());
        }

        let size = resp.content_length();
        let stream: ByteStream =
            Box::pin(resp.bytes_stream().map(|r| r.map_err(std::io::Error::other)));

        Ok(Some(FetchedObject { size, stream }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base_url: &str) -> UpstreamStore {
        UpstreamStore::new(
            &UpstreamConfig {
                base_url: base_url.to_string(),
                connect_timeout_secs: 10,
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn object_url_joins_cleanly() {
        let s = store("http://store.internal/objects");
        assert_eq!(
            s.object_url("abc-123"),
            "http://store.internal/objects/abc-123"
        );
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let s = store("http://store.internal/objects/");
        assert_eq!(
            s.object_url("abc-123"),
            "http://store.internal/objects/abc-123"
        );
    }
}
