// src/driver/github.rs

//! Default driver: repositories hosted on GitHub or any plain HTTP base.
//!
//! Identifiers are either `owner/repo` shorthand, resolved through
//! raw.githubusercontent.com, or a full `http(s)://` base URL. The index
//! is expected at `<base>/repository.json`; package files live below the
//! base as `<base>/<package>/<path>`.

use super::Driver;
use crate::error::{Error, Result};
use crate::storage::RepositoryIndex;
use regex::Regex;
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::debug;

/// Request timeout for index and file fetches.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// File name of the index at a repository's base URL.
const INDEX_FILE: &str = "repository.json";

pub struct GithubDriver {
    client: Client,
    shorthand: Regex,
}

impl GithubDriver {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Io(format!("http client: {e}")))?;
        // owner/repo with an optional @ref suffix
        let shorthand = Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+(@[A-Za-z0-9_./-]+)?$")
            .map_err(|e| Error::Io(format!("shorthand pattern: {e}")))?;
        Ok(Self { client, shorthand })
    }

    /// Raw-content base URL for an identifier.
    fn base_url(&self, identifier: &str) -> String {
        if identifier.starts_with("http://") || identifier.starts_with("https://") {
            return identifier.trim_end_matches('/').to_string();
        }
        let (repo, reference) = match identifier.split_once('@') {
            Some((repo, reference)) => (repo, reference),
            None => (identifier, "HEAD"),
        };
        format!("https://raw.githubusercontent.com/{repo}/{reference}")
    }

    fn get(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Fetch {
                identifier: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::Fetch {
                identifier: url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        let bytes = response.bytes().map_err(|e| Error::Fetch {
            identifier: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

impl Driver for GithubDriver {
    fn name(&self) -> &str {
        "github"
    }

    fn compatible(&self, identifier: &str) -> bool {
        identifier.starts_with("http://")
            || identifier.starts_with("https://")
            || self.shorthand.is_match(identifier)
    }

    fn exists(&self, identifier: &str) -> bool {
        let url = format!("{}/{INDEX_FILE}", self.base_url(identifier));
        match self.client.head(&url).send() {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn fetch_index(&self, identifier: &str) -> Result<RepositoryIndex> {
        let url = format!("{}/{INDEX_FILE}", self.base_url(identifier));
        let bytes = self.get(&url)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::UnreadableIndex {
            identifier: identifier.to_string(),
            message: e.to_string(),
        })
    }

    fn fetch_package_file(
        &self,
        identifier: &str,
        package: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{package}/{}",
            self.base_url(identifier),
            path.trim_start_matches('/')
        );
        self.get(&url)
    }
}
