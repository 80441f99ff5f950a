use std::time::Duration;

use color_eyre::eyre::Result;
use serde_json::Value;
use tracing::{instrument, warn};
use url::Url;

use crate::config::MetadataConfig;

/// Off-chain metadata document of a collection or item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub body: Option<Value>,
}

impl Metadata {
    fn from_json(body: Value) -> Self {
        let field = |k: &str| body.get(k).and_then(Value::as_str).map(str::to_owned);

        Self {
            name: field("name"),
            description: field("description"),
            image: field("image"),
            body: Some(body),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("metadata fetch failed: {0}")]
pub struct MetadataError(#[from] reqwest::Error);

/// Best-effort metadata resolution
///
/// Anything that a retry would not fix (timeouts, bad status, bad JSON,
/// unusable URLs) degrades to empty metadata. Only connection-level
/// failures are reported.
#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    http: reqwest::Client,
}

impl MetadataFetcher {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        Self::with_timeout(config.timeout())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, uri: &str) -> Result<Metadata, MetadataError> {
        let resp = match self.http.get(uri).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() || e.is_builder() => {
                warn!(error = %e, "no metadata");
                return Ok(Metadata::default());
            }
            Err(e) => return Err(e.into()),
        };

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "no metadata");
            return Ok(Metadata::default());
        }

        match resp.json::<Value>().await {
            Ok(body) if body.is_object() => Ok(Metadata::from_json(body)),
            Ok(_) => {
                warn!("metadata is not a JSON object");
                Ok(Metadata::default())
            }
            Err(e) => {
                warn!(error = %e, "no metadata");
                Ok(Metadata::default())
            }
        }
    }
}

/// Content key of a metadata URI served by `domain`: the path segment right
/// before `meta.json`
pub fn content_ref(uri: &str, domain: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let host = url.host_str()?;
    if host != domain && !host.ends_with(&format!(".{domain}")) {
        return None;
    }

    let segments: Vec<_> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let pos = segments.iter().position(|s| *s == "meta.json")?;
    pos.checked_sub(1)
        .map(|i| segments[i].to_owned())
}
