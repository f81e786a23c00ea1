//! The download dispatcher: parses source descriptors, performs resumable
//! fetches under the Downloads resource, retries transient failures, and
//! verifies content hashes.

mod chunked;
mod error;
mod http;
mod meta;

pub use chunked::{ChunkedSeekableStream, HttpRangeFetcher, RangeFetcher};
pub use error::{DownloadError, Result};
pub use http::{build_client, HttpFetch, ProgressFn, USER_AGENT};
pub use meta::meta_ini;

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;

use async_trait::async_trait;
use mason_cache::VerificationCache;
use mason_core::{hash_reader, AbsolutePath, CancelToken, Hash};
use mason_modlist::{Archive, ArchiveState, GameType};
use mason_resources::Resource;
use tracing::{debug, info, warn};

/// Resolves authenticated source states to plain URLs. The token stores and
/// remote catalogue live outside the engine; they plug in here.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn resolve(&self, state: &ArchiveState) -> Result<Option<String>>;
}

/// A resolver with no credentials; every authenticated source fails.
pub struct NoResolver;

#[async_trait]
impl LinkResolver for NoResolver {
    async fn resolve(&self, _state: &ArchiveState) -> Result<Option<String>> {
        Ok(None)
    }
}

pub struct Downloader {
    client: reqwest::Client,
    resource: Resource,
    resolver: Box<dyn LinkResolver>,
    game_dirs: HashMap<GameType, AbsolutePath>,
    verification: Option<VerificationCache>,
}

impl Downloader {
    pub fn new(resource: Resource) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            resource,
            resolver: Box::new(NoResolver),
            game_dirs: HashMap::new(),
            verification: None,
        })
    }

    pub fn with_resolver(mut self, resolver: Box<dyn LinkResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Remembers verified fetches so an archive confirmed good is not
    /// re-fetched within the cache's TTL window.
    pub fn with_verification_cache(mut self, cache: VerificationCache) -> Self {
        self.verification = Some(cache);
        self
    }

    pub fn with_game_dir(mut self, game: GameType, dir: AbsolutePath) -> Self {
        self.game_dirs.insert(game, dir);
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Recognises a source state from a URI.
    pub fn parse(uri: &str) -> Option<ArchiveState> {
        if let Some(rest) = uri.strip_prefix("nxm://") {
            // nxm://<game>/mods/<mod>/files/<file>
            let mut parts = rest.split('/');
            let game_name = parts.next()?.to_string();
            if parts.next()? != "mods" {
                return None;
            }
            let mod_id = parts.next()?.parse().ok()?;
            if parts.next()? != "files" {
                return None;
            }
            let file_id = parts.next()?.parse().ok()?;
            return Some(ArchiveState::Nexus {
                game_name,
                mod_id,
                file_id,
            });
        }
        if uri.starts_with("https://") || uri.starts_with("http://") {
            if uri.contains("mega.nz/") {
                return Some(ArchiveState::Mega {
                    url: uri.to_string(),
                });
            }
            return Some(ArchiveState::Http {
                url: uri.to_string(),
                headers: vec![],
            });
        }
        None
    }

    /// Downloads `archive` to `target` and verifies its hash. On a mismatch
    /// the file is deleted and fetched once more; a second mismatch is
    /// fatal. A target verified within the TTL window is trusted without a
    /// refetch.
    pub async fn download(
        &self,
        archive: &Archive,
        target: &AbsolutePath,
        progress: Option<ProgressFn<'_>>,
        token: &CancelToken,
    ) -> Result<()> {
        let key = archive.state.primary_key_string();

        if target.exists() && self.recall_verification(&key).await == Some(archive.hash) {
            debug!("{} verified recently, skipping refetch", archive.name);
            return Ok(());
        }

        self.fetch(archive, target, progress, token).await?;

        match self.verify(archive, target).await? {
            true => {
                self.record_verification(&key, archive.hash).await;
                Ok(())
            }
            false => {
                warn!(
                    "{} failed hash verification, deleting and refetching once",
                    archive.name
                );
                let _ = std::fs::remove_file(target.as_std());
                self.fetch(archive, target, progress, token).await?;
                if self.verify(archive, target).await? {
                    self.record_verification(&key, archive.hash).await;
                    Ok(())
                } else {
                    let actual = self.hash_of(target).await?;
                    Err(DownloadError::HashMismatch {
                        path: target.clone(),
                        expected: archive.hash,
                        actual,
                    })
                }
            }
        }
    }

    /// The hash this source last verified to, if the entry is still fresh.
    async fn recall_verification(&self, key: &str) -> Option<Hash> {
        let cache = self.verification.as_ref()?;
        match cache.get(key).await {
            Ok(Some(payload)) => Hash::from_base64(&payload).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!("verification cache read failed for {key}: {err}");
                None
            }
        }
    }

    /// A failed cache write never fails the download itself.
    async fn record_verification(&self, key: &str, hash: Hash) {
        let Some(cache) = &self.verification else {
            return;
        };
        if let Err(err) = cache.put(key, &hash.to_base64()).await {
            warn!("verification cache write failed for {key}: {err}");
        }
    }

    async fn fetch(
        &self,
        archive: &Archive,
        target: &AbsolutePath,
        progress: Option<ProgressFn<'_>>,
        token: &CancelToken,
    ) -> Result<()> {
        let primary_key = archive.state.primary_key_string();
        let job = self
            .resource
            .begin(format!("download {}", archive.name), archive.size, token)
            .await?;

        let outcome = match &archive.state {
            ArchiveState::Manual { .. } => Err(DownloadError::ManualRequired {
                primary_key: primary_key.clone(),
            }),
            ArchiveState::Http { url, headers } => {
                self.fetch_url(url.clone(), headers.clone(), target, &job, progress, token)
                    .await
            }
            ArchiveState::Cdn { url } => {
                self.fetch_url(url.clone(), vec![], target, &job, progress, token)
                    .await
            }
            ArchiveState::GameFile {
                game, game_file, ..
            } => self.copy_game_file(*game, game_file, target, &job, token).await,
            state @ (ArchiveState::Nexus { .. } | ArchiveState::Mega { .. }) => {
                match self.resolver.resolve(state).await? {
                    Some(url) => {
                        self.fetch_url(url, vec![], target, &job, progress, token)
                            .await
                    }
                    None => Err(DownloadError::NoResolver {
                        primary_key: primary_key.clone(),
                    }),
                }
            }
        };
        self.resource.finish(job);

        // A hard 404 means the source is gone, not that auth is needed.
        match outcome {
            Err(DownloadError::Status { status: 404, .. }) => {
                Err(DownloadError::MissingArchive { primary_key })
            }
            other => other,
        }
    }

    async fn fetch_url(
        &self,
        url: String,
        headers: Vec<String>,
        target: &AbsolutePath,
        job: &mason_resources::Job,
        progress: Option<ProgressFn<'_>>,
        token: &CancelToken,
    ) -> Result<()> {
        let fetch = HttpFetch {
            client: &self.client,
            resource: &self.resource,
            url,
            headers,
            target: target.clone(),
        };
        fetch.run(job, progress, token).await
    }

    async fn copy_game_file(
        &self,
        game: GameType,
        game_file: &mason_core::RelativePath,
        target: &AbsolutePath,
        job: &mason_resources::Job,
        token: &CancelToken,
    ) -> Result<()> {
        let game_dir = self
            .game_dirs
            .get(&game)
            .cloned()
            .or_else(|| game.locate())
            .ok_or_else(|| DownloadError::GameFileMissing(game.display_name().to_string()))?;
        let source = game_dir.join_rel(game_file);
        if !source.exists() {
            return Err(DownloadError::GameFileMissing(source.to_string()));
        }

        token.check()?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent.as_std()).map_err(|source| DownloadError::Io {
                path: parent.clone(),
                source,
            })?;
        }
        let copied = std::fs::copy(source.as_std(), target.as_std()).map_err(|source| {
            DownloadError::Io {
                path: target.clone(),
                source,
            }
        })?;
        self.resource.report_no_wait(job, copied);
        info!("copied game file {game_file} ({copied} bytes)");
        Ok(())
    }

    async fn verify(&self, archive: &Archive, target: &AbsolutePath) -> Result<bool> {
        Ok(self.hash_of(target).await? == archive.hash)
    }

    async fn hash_of(&self, path: &AbsolutePath) -> Result<Hash> {
        let owned = path.clone();
        tokio::task::spawn_blocking(move || {
            let file = File::open(owned.as_std())?;
            hash_reader(BufReader::new(file))
        })
        .await
        .expect("hashing task panicked")
        .map_err(|source| DownloadError::Io {
            path: path.clone(),
            source,
        })
    }

    /// Seekable remote stream for peeking into a bundle without a full
    /// download. Only URL-backed states support this.
    pub fn chunked_seekable_stream(
        &self,
        archive: &Archive,
    ) -> Result<ChunkedSeekableStream<HttpRangeFetcher>> {
        let url = match &archive.state {
            ArchiveState::Http { url, .. } | ArchiveState::Cdn { url } => url.clone(),
            state => {
                return Err(DownloadError::NoResolver {
                    primary_key: state.primary_key_string(),
                })
            }
        };
        let fetcher = HttpRangeFetcher::new(
            self.client.clone(),
            url,
            archive.size,
            tokio::runtime::Handle::current(),
        );
        Ok(ChunkedSeekableStream::new(fetcher))
    }
}
