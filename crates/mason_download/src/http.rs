//! Resumable HTTP fetches. A partial file is kept as `<target>.part` and
//! resumed with a `Range` request when the server honours it; transient
//! failures retry with exponential back-off, and every attempt builds a
//! fresh request (a consumed request is never reused).

use std::time::Duration;

use mason_core::{AbsolutePath, CancelToken};
use mason_resources::{Job, Resource};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_secs(1);

pub const USER_AGENT: &str = concat!("mod-mason/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_client() -> std::result::Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// Progress callback: `(processed, total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

pub struct HttpFetch<'a> {
    pub client: &'a Client,
    pub resource: &'a Resource,
    pub url: String,
    pub headers: Vec<String>,
    pub target: AbsolutePath,
}

impl HttpFetch<'_> {
    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for raw in &self.headers {
            if let Some((key, value)) = raw.split_once(':') {
                if let (Ok(name), Ok(value)) = (
                    key.trim().parse::<HeaderName>(),
                    HeaderValue::from_str(value.trim()),
                ) {
                    map.insert(name, value);
                }
            }
        }
        map
    }

    fn part_path(&self) -> AbsolutePath {
        self.target
            .parent()
            .unwrap_or_else(|| self.target.clone())
            .join(&format!(
                "{}.part",
                self.target.file_name().unwrap_or("download")
            ))
    }

    /// Downloads to the target path, resuming a matching partial file.
    pub async fn run(
        &self,
        job: &Job,
        progress: Option<ProgressFn<'_>>,
        token: &CancelToken,
    ) -> Result<()> {
        if let Some(parent) = self.target.parent() {
            std::fs::create_dir_all(parent.as_std()).map_err(|source| DownloadError::Io {
                path: parent.clone(),
                source,
            })?;
        }

        let mut attempt = 0;
        loop {
            token.check()?;
            attempt += 1;
            match self.attempt(job, progress, token).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(
                        "transient failure fetching {} (attempt {attempt}): {err}; backing off {backoff:?}",
                        self.url
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        job: &Job,
        progress: Option<ProgressFn<'_>>,
        token: &CancelToken,
    ) -> Result<()> {
        let part = self.part_path();
        let resume_from = std::fs::metadata(part.as_std()).map(|meta| meta.len()).unwrap_or(0);

        // A fresh request per attempt.
        let mut request = self
            .client
            .get(&self.url)
            .headers(self.header_map());
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }

        let response = request.send().await?;
        let status = response.status();

        let (mut written, truncate) = match status {
            StatusCode::PARTIAL_CONTENT if resume_from > 0 => {
                debug!("resuming {} at byte {resume_from}", self.url);
                (resume_from, false)
            }
            status if status.is_success() => (0, true),
            status => {
                return Err(DownloadError::Status {
                    status: status.as_u16(),
                    url: self.url.clone(),
                })
            }
        };
        let total = response
            .content_length()
            .map(|len| len + if truncate { 0 } else { resume_from });

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(!truncate)
            .write(true)
            .truncate(truncate)
            .open(part.as_std())
            .await
            .map_err(|source| DownloadError::Io {
                path: part.clone(),
                source,
            })?;

        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            token.check()?;
            file.write_all(&chunk)
                .await
                .map_err(|source| DownloadError::Io {
                    path: part.clone(),
                    source,
                })?;
            written += chunk.len() as u64;
            self.resource
                .report(job, chunk.len() as u64, token)
                .await?;
            if let Some(progress) = progress {
                progress(written, total);
            }
        }
        file.flush().await.map_err(|source| DownloadError::Io {
            path: part.clone(),
            source,
        })?;
        drop(file);

        std::fs::rename(part.as_std(), self.target.as_std()).map_err(|source| {
            DownloadError::Io {
                path: self.target.clone(),
                source,
            }
        })?;
        debug!("fetched {} ({written} bytes)", self.url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds() {
        build_client().unwrap();
    }

    fn test_resource() -> Resource {
        Resource::new(
            "Downloads",
            mason_resources::ResourceSettings {
                max_tasks: 1,
                max_throughput: 0,
            },
            CancelToken::never(),
        )
    }

    #[tokio::test]
    async fn header_lines_parse_into_pairs() {
        let client = build_client().unwrap();
        let resource = test_resource();
        let fetch = HttpFetch {
            client: &client,
            resource: &resource,
            url: "https://example.com/a".into(),
            headers: vec![
                "Referer: https://example.com".into(),
                "broken-line-without-colon".into(),
            ],
            target: AbsolutePath::new(camino::Utf8PathBuf::from("/tmp/a")).unwrap(),
        };
        let map = fetch.header_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("referer").unwrap(), "https://example.com");
    }

    #[tokio::test]
    async fn part_path_sits_next_to_target() {
        let client = build_client().unwrap();
        let resource = test_resource();
        let fetch = HttpFetch {
            client: &client,
            resource: &resource,
            url: "https://example.com/a".into(),
            headers: vec![],
            target: AbsolutePath::new(camino::Utf8PathBuf::from("/downloads/mod.7z")).unwrap(),
        };
        assert_eq!(fetch.part_path().as_str(), "/downloads/mod.7z.part");
    }
}
