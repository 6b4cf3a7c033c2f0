//! URL parsing for storage backends.
//!
//! Extracts backend configuration from S3, local filesystem and in-memory URLs.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{LocalConfig, MemoryConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+):(?P<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";

const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

static S3_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [S3_PATH, S3_ENDPOINT_URL, S3_URL]
        .iter()
        .map(|p| Regex::new(p).expect("static S3 pattern"))
        .collect()
});

static LOCAL_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [FILE_URI, FILE_PATH]
        .iter()
        .map(|p| Regex::new(p).expect("static file pattern"))
        .collect()
});

static MEMORY_MATCHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MEMORY_URL).expect("static memory pattern"));

/// Backend configuration parsed from a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(caps) = first_match(&S3_MATCHERS, url) {
            return Ok(Self::parse_s3(&caps));
        }
        if let Some(caps) = MEMORY_MATCHER.captures(url) {
            return Ok(BackendConfig::Memory(MemoryConfig {
                key: non_empty_key(&caps),
            }));
        }
        if let Some(caps) = first_match(&LOCAL_MATCHERS, url) {
            let path = caps.name("path").map_or("", |m| m.as_str());
            if !path.starts_with('/') {
                return InvalidUrlSnafu { url }.fail();
            }
            return Ok(BackendConfig::Local(LocalConfig {
                root: path.trim_end_matches('/').to_string(),
            }));
        }

        InvalidUrlSnafu { url }.fail()
    }

    fn parse_s3(caps: &Captures) -> Self {
        let bucket = caps.name("bucket").map_or("", |m| m.as_str()).to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|endpoint| {
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = caps.name("protocol").map_or("https", |p| p.as_str());
                format!("{protocol}://{}:{port}", endpoint.as_str())
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: non_empty_key(caps),
        })
    }

    /// Key prefix that every path is qualified with, if any.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(config) => config.key.as_ref(),
            BackendConfig::Memory(config) => config.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

fn first_match<'h>(matchers: &[Regex], url: &'h str) -> Option<Captures<'h>> {
    matchers.iter().find_map(|r| r.captures(url))
}

fn non_empty_key(caps: &Captures) -> Option<Path> {
    caps.name("key")
        .map(|m| m.as_str().trim_matches('/'))
        .filter(|k| !k.is_empty())
        .map(Path::from)
}
