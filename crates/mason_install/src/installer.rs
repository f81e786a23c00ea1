//! The 15-phase installer. Phase order is strict; each phase is a barrier,
//! cancellation is honoured between phases, and once a phase completes it is
//! never re-entered.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use mason_archives::{state_for_path, ContainerBuilder, ContainerReader};
use mason_cache::DataStores;
use mason_core::{
    hash_bytes, AbsolutePath, CancelToken, FileSource, Hash, RelativePath, TempManager,
};
use mason_download::{meta_ini, Downloader};
use mason_extract::{write_atomic, ExtractionSettings, Extractor, NativeTool};
use mason_modlist::{Archive, ArchiveState, Directive, Modlist, ModlistBundle};
use mason_vfs::{downloadable_files, Vfs};
use tracing::{debug, info, warn};

use crate::config::InstallerConfiguration;
use crate::error::{InstallError, Result};
use crate::octodiff::apply_delta;
use crate::resources::{EngineResources, EngineSettings};

/// Staging root for container members, relative to the install directory.
const CONTAINER_STAGING: &str = "TEMP_BSA_FILES";
const PORTABLE_MARKER: &str = "portable.txt";
const MOD_MANAGER_INI: &str = "ModOrganizer.ini";

/// Preference files that receive screen-size tweaks during finalise.
const DISPLAY_INIS: [&str; 4] = [
    "skyrimprefs.ini",
    "fallout4prefs.ini",
    "falloutprefs.ini",
    "oblivion.ini",
];

#[derive(Debug, Clone)]
pub struct ManualDownload {
    pub name: String,
    pub url: String,
    pub prompt: Option<String>,
    pub primary_key: String,
}

#[derive(Debug)]
pub enum InstallOutcome {
    Completed,
    Cancelled,
    DownloadFailed {
        manual: Vec<ManualDownload>,
        missing: Vec<String>,
    },
    GameMissing,
    GameInvalid,
}

pub struct Installer {
    config: InstallerConfiguration,
    modlist: Modlist,
    bundle: Mutex<ModlistBundle<BufReader<File>>>,
    resources: EngineResources,
    stores: DataStores,
    downloader: Downloader,
    vfs: Vfs,
    token: CancelToken,
    game_dir: Option<AbsolutePath>,
    directives: Vec<Directive>,
    hashed: Mutex<HashMap<Hash, AbsolutePath>>,
}

impl Installer {
    pub async fn new(
        config: InstallerConfiguration,
        tools: ExtractionSettings,
        invoker: Arc<dyn NativeTool>,
        settings: EngineSettings,
        token: CancelToken,
    ) -> Result<Self> {
        let bundle = ModlistBundle::open(&config.bundle_path)?;
        let modlist = bundle.modlist().clone();

        let resources = EngineResources::new(&settings, token.clone());
        let data_dir = config.install_dir.join(".mason");
        let stores = DataStores::open(&data_dir, resources.file_hashing.clone()).await?;

        let temp = Arc::new(
            TempManager::new(data_dir.join("temp")).map_err(InstallError::io(&data_dir))?,
        );
        // Sweep residue a crashed predecessor left behind.
        let swept = temp.cleanup_stale().map_err(InstallError::io(temp.root()))?;
        if swept > 0 {
            info!("removed {swept} stale temporary directories");
        }

        let extractor = Arc::new(Extractor::new(
            tools,
            Arc::clone(&temp),
            resources.file_extractor.clone(),
        ));
        let downloader = Downloader::new(resources.downloads.clone())?
            .with_verification_cache(stores.verification_cache.clone());
        let vfs = Vfs::new(
            stores.vfs_cache.clone(),
            stores.hash_cache.clone(),
            Arc::clone(&extractor),
            invoker,
            resources.vfs.clone(),
            temp,
        );

        let directives = modlist.directives.clone();
        Ok(Self {
            config,
            modlist,
            bundle: Mutex::new(bundle),
            resources,
            stores,
            downloader,
            vfs,
            token,
            game_dir: None,
            directives,
            hashed: Mutex::new(HashMap::new()),
        })
    }

    pub fn resources(&self) -> &EngineResources {
        &self.resources
    }

    /// Runs the install to completion or the first terminal condition.
    pub async fn run(&mut self) -> Result<InstallOutcome> {
        macro_rules! barrier {
            () => {
                if self.token.is_cancelled() {
                    info!("cancelled at phase boundary");
                    return Ok(InstallOutcome::Cancelled);
                }
            };
        }

        info!(
            "installing '{}' {} ({} archives, {} directives)",
            self.modlist.name,
            self.modlist.version,
            self.modlist.archives.len(),
            self.modlist.directives.len()
        );

        // 1. Configure.
        if let Some(outcome) = self.configure()? {
            return Ok(outcome);
        }
        barrier!();

        // 2. Optimise modlist.
        self.optimize()?;
        barrier!();

        // 3. Hash archives already present.
        self.hash_archives().await?;
        barrier!();

        // 4. Download missing archives.
        let manual = self.download_archives().await?;
        barrier!();

        // 5. Manual-download gate.
        if !manual.is_empty() {
            info!("{} archives require manual download", manual.len());
            return Ok(InstallOutcome::DownloadFailed {
                manual,
                missing: Vec::new(),
            });
        }

        // 6. Rehash + corruption recovery.
        if let Some(outcome) = self.rehash_and_recover().await? {
            return Ok(outcome);
        }
        barrier!();

        // 7. Extract modlist bundle (blob inventory check; blobs stay lazy).
        self.check_bundle_blobs()?;
        barrier!();

        // 8. Prime VFS.
        self.prime_vfs().await?;
        barrier!();

        // 9. Build folder structure.
        self.build_folder_structure()?;
        barrier!();

        // 10. Install archives.
        self.install_archives().await?;
        barrier!();

        // 11. Install inline files.
        self.install_inline_files().await?;
        barrier!();

        // 12. Write meta files.
        self.write_meta_files().await?;
        barrier!();

        // 13. Build container archives.
        self.build_containers().await?;
        barrier!();

        // 14. Generate merge patches.
        self.generate_merged_patches().await?;
        barrier!();

        // 15. Finalise.
        self.finalize()?;

        info!("install of '{}' complete", self.modlist.name);
        Ok(InstallOutcome::Completed)
    }

    // ── Phase 1 ─────────────────────────────────────────────────────

    fn configure(&mut self) -> Result<Option<InstallOutcome>> {
        for dir in [&self.config.install_dir, &self.config.downloads_dir] {
            std::fs::create_dir_all(dir.as_std()).map_err(InstallError::io(dir))?;
            // Both directories must be writable; probe now rather than fail
            // mid-install.
            let probe = dir.join(".mason-write-probe");
            std::fs::write(probe.as_std(), b"probe").map_err(InstallError::io(dir))?;
            std::fs::remove_file(probe.as_std()).map_err(InstallError::io(dir))?;
        }

        let game_dir = match self.config.game_dir.clone() {
            Some(dir) => dir,
            None => match self.modlist.game_type.locate() {
                Some(dir) => dir,
                None => return Ok(Some(InstallOutcome::GameMissing)),
            },
        };
        if !game_dir.is_dir() {
            return Ok(Some(InstallOutcome::GameMissing));
        }
        if !game_dir
            .join(self.modlist.game_type.main_executable())
            .exists()
        {
            return Ok(Some(InstallOutcome::GameInvalid));
        }
        info!("game folder: {game_dir}");
        self.game_dir = Some(game_dir);
        Ok(None)
    }

    // ── Phase 2 ─────────────────────────────────────────────────────

    fn optimize(&mut self) -> Result<()> {
        let before = self.directives.len();
        let mut seen: HashMap<RelativePath, Hash> = HashMap::new();
        let mut kept = Vec::with_capacity(before);
        for directive in self.directives.drain(..) {
            match seen.get(directive.to()) {
                Some(hash) if *hash == directive.hash() => {
                    debug!("dropping redundant directive for {}", directive.to());
                }
                Some(_) => {
                    return Err(InstallError::ConflictingDirectives(directive.to().clone()))
                }
                None => {
                    seen.insert(directive.to().clone(), directive.hash());
                    kept.push(directive);
                }
            }
        }
        if kept.len() != before {
            info!("optimised {} directives down to {}", before, kept.len());
        }
        self.directives = kept;
        Ok(())
    }

    // ── Phase 3 ─────────────────────────────────────────────────────

    async fn hash_archives(&self) -> Result<()> {
        let files = downloadable_files(&self.config.downloads_dir)
            .map_err(InstallError::io(&self.config.downloads_dir))?;
        info!("hashing {} files already in downloads", files.len());

        let hashes: Vec<(Hash, AbsolutePath)> = stream::iter(files)
            .map(|path| {
                let cache = self.stores.hash_cache.clone();
                let token = self.token.clone();
                async move {
                    let hash = cache.compute_or_cache(&path, &token).await?;
                    Ok::<_, InstallError>((hash, path))
                }
            })
            .buffer_unordered(16)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_>>()?;

        let mut hashed = self.hashed.lock().expect("hashed archives lock");
        for (hash, path) in hashes {
            hashed.insert(hash, path);
        }
        Ok(())
    }

    // ── Phase 4 ─────────────────────────────────────────────────────

    async fn download_archives(&self) -> Result<Vec<ManualDownload>> {
        let needed: Vec<&Archive> = {
            let hashed = self.hashed.lock().expect("hashed archives lock");
            self.modlist
                .archives
                .iter()
                .filter(|archive| !hashed.contains_key(&archive.hash))
                .collect()
        };
        if needed.is_empty() {
            return Ok(Vec::new());
        }
        info!("{} archives need downloading", needed.len());

        let mut manual = Vec::new();
        let mut automatic = Vec::new();
        for archive in needed {
            match &archive.state {
                ArchiveState::Manual { url, prompt } => {
                    // Route through the intervention queue so the slot
                    // accounting reflects a waiting user action.
                    let job = self
                        .resources
                        .user_intervention
                        .begin(format!("manual download {}", archive.name), 0, &self.token)
                        .await?;
                    warn!("manual download required: {} ({url})", archive.name);
                    manual.push(ManualDownload {
                        name: archive.name.clone(),
                        url: url.clone(),
                        prompt: prompt.clone(),
                        primary_key: archive.state.primary_key_string(),
                    });
                    self.resources.user_intervention.finish(job);
                }
                _ => automatic.push(archive),
            }
        }

        let results: Vec<(String, Option<AbsolutePath>, Hash)> = stream::iter(automatic)
            .map(|archive| {
                let target = self.config.downloads_dir.join(&archive.name);
                let token = self.token.clone();
                async move {
                    match self.downloader.download(archive, &target, None, &token).await {
                        Ok(()) => (archive.name.clone(), Some(target), archive.hash),
                        Err(err) => {
                            warn!("download of {} failed: {err}", archive.name);
                            (archive.name.clone(), None, archive.hash)
                        }
                    }
                }
            })
            .buffer_unordered(8)
            .collect()
            .await;

        let mut hashed = self.hashed.lock().expect("hashed archives lock");
        for (_, target, hash) in results {
            if let Some(target) = target {
                hashed.insert(hash, target);
            }
        }
        Ok(manual)
    }

    // ── Phase 6 ─────────────────────────────────────────────────────

    async fn rehash_and_recover(&self) -> Result<Option<InstallOutcome>> {
        self.hash_archives().await?;

        let missing: Vec<&Archive> = {
            let hashed = self.hashed.lock().expect("hashed archives lock");
            self.modlist
                .archives
                .iter()
                .filter(|archive| {
                    !archive.state.is_manual() && !hashed.contains_key(&archive.hash)
                })
                .collect()
        };
        if missing.is_empty() {
            return Ok(None);
        }

        // Still-missing archives whose on-disk file exists under the
        // expected name are presumed corrupt: delete and fetch once more.
        warn!("{} archives missing after download, recovering", missing.len());
        for archive in &missing {
            let candidate = self.config.downloads_dir.join(&archive.name);
            if candidate.exists() {
                warn!("deleting presumed-corrupt {}", candidate);
                std::fs::remove_file(candidate.as_std())
                    .map_err(InstallError::io(&candidate))?;
            }
        }

        for archive in &missing {
            let target = self.config.downloads_dir.join(&archive.name);
            if let Err(err) = self
                .downloader
                .download(archive, &target, None, &self.token)
                .await
            {
                warn!("re-download of {} failed: {err}", archive.name);
            }
        }

        self.hash_archives().await?;
        let still_missing: Vec<String> = {
            let hashed = self.hashed.lock().expect("hashed archives lock");
            self.modlist
                .archives
                .iter()
                .filter(|archive| {
                    !archive.state.is_manual() && !hashed.contains_key(&archive.hash)
                })
                .map(|archive| archive.state.primary_key_string())
                .collect()
        };
        if still_missing.is_empty() {
            Ok(None)
        } else {
            Ok(Some(InstallOutcome::DownloadFailed {
                manual: Vec::new(),
                missing: still_missing,
            }))
        }
    }

    // ── Phase 7 ─────────────────────────────────────────────────────

    fn check_bundle_blobs(&self) -> Result<()> {
        let mut wanted: Vec<&str> = Vec::new();
        for directive in &self.directives {
            match directive {
                Directive::InlineFile { source_data_id, .. }
                | Directive::RemappedInlineFile { source_data_id, .. } => {
                    wanted.push(source_data_id)
                }
                Directive::MergedPatch { patch_id, .. }
                | Directive::PatchedFromArchive { patch_id, .. } => wanted.push(patch_id),
                _ => {}
            }
        }
        let mut bundle = self.bundle.lock().expect("bundle lock");
        for id in wanted {
            // Reading proves the entry exists and inflates cleanly; the
            // bytes are dropped here and reloaded on demand later.
            bundle.read_blob(id).map(drop)?;
        }
        Ok(())
    }

    // ── Phase 8 ─────────────────────────────────────────────────────

    async fn prime_vfs(&self) -> Result<()> {
        let mut referenced: HashSet<Hash> = HashSet::new();
        for directive in &self.directives {
            if let Directive::FromArchive {
                archive_hash_path, ..
            }
            | Directive::PatchedFromArchive {
                archive_hash_path, ..
            } = directive
            {
                referenced.insert(archive_hash_path.archive_hash);
            }
        }

        let paths: Vec<(Hash, AbsolutePath)> = {
            let hashed = self.hashed.lock().expect("hashed archives lock");
            referenced
                .iter()
                .filter_map(|hash| hashed.get(hash).map(|path| (*hash, path.clone())))
                .collect()
        };
        info!("priming VFS from {} archives", paths.len());

        let results: Vec<Result<Hash>> = stream::iter(paths)
            .map(|(_, path)| {
                let token = self.token.clone();
                async move { Ok(self.vfs.add_archive(&path, &token).await?) }
            })
            .buffer_unordered(8)
            .collect()
            .await;
        for result in results {
            result?;
        }

        // Every directive reference must now be represented.
        for directive in &self.directives {
            if let Directive::FromArchive {
                archive_hash_path, ..
            }
            | Directive::PatchedFromArchive {
                archive_hash_path, ..
            } = directive
            {
                if !self
                    .vfs
                    .contains(archive_hash_path.archive_hash, &archive_hash_path.parts)
                {
                    return Err(InstallError::UnindexedSource {
                        archive: archive_hash_path.archive_hash,
                        path: archive_hash_path.parts.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // ── Phase 9 ─────────────────────────────────────────────────────

    fn build_folder_structure(&self) -> Result<()> {
        let mut dirs: HashSet<AbsolutePath> = HashSet::new();
        for directive in &self.directives {
            if let Some(parent) = self.config.install_dir.join_rel(directive.to()).parent() {
                dirs.insert(parent);
            }
        }
        for dir in dirs {
            std::fs::create_dir_all(dir.as_std()).map_err(InstallError::io(&dir))?;
        }
        Ok(())
    }

    // ── Phase 10 ────────────────────────────────────────────────────

    async fn install_archives(&self) -> Result<()> {
        let mut by_archive: HashMap<Hash, Vec<&Directive>> = HashMap::new();
        for directive in &self.directives {
            if let Directive::FromArchive {
                archive_hash_path, ..
            }
            | Directive::PatchedFromArchive {
                archive_hash_path, ..
            } = directive
            {
                by_archive
                    .entry(archive_hash_path.archive_hash)
                    .or_default()
                    .push(directive);
            }
        }
        if by_archive.is_empty() {
            return Ok(());
        }
        info!(
            "installing {} archive-sourced files from {} archives",
            by_archive.values().map(Vec::len).sum::<usize>(),
            by_archive.len()
        );

        let groups: Vec<(Hash, Vec<&Directive>)> = by_archive.into_iter().collect();
        let results: Vec<Result<()>> = stream::iter(groups)
            .map(|(archive_hash, group)| async move {
                self.install_archive_group(archive_hash, group).await
            })
            .buffer_unordered(4)
            .collect()
            .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn install_archive_group(
        &self,
        archive_hash: Hash,
        group: Vec<&Directive>,
    ) -> Result<()> {
        let archive_path = {
            let hashed = self.hashed.lock().expect("hashed archives lock");
            hashed
                .get(&archive_hash)
                .cloned()
                .ok_or(InstallError::UnindexedSource {
                    archive: archive_hash,
                    path: Vec::new(),
                })?
        };

        let mut requests: Vec<Vec<RelativePath>> = Vec::new();
        for directive in &group {
            if let Directive::FromArchive {
                archive_hash_path, ..
            }
            | Directive::PatchedFromArchive {
                archive_hash_path, ..
            } = directive
            {
                if !requests.contains(&archive_hash_path.parts) {
                    requests.push(archive_hash_path.parts.clone());
                }
            }
        }

        let extracted = self
            .vfs
            .gather_bytes(&archive_path, &requests, &self.token)
            .await?;

        for directive in group {
            self.token.check()?;
            let job = self
                .resources
                .installer
                .begin(
                    format!("install {}", directive.to()),
                    directive.size(),
                    &self.token,
                )
                .await?;
            let outcome = self.materialise_from_archive(directive, &extracted);
            self.resources.finish_installer_job(job, directive.size());
            outcome?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn materialise_from_archive(
        &self,
        directive: &Directive,
        extracted: &HashMap<Vec<RelativePath>, Vec<u8>>,
    ) -> Result<()> {
        let (to, expected, bytes) = match directive {
            Directive::FromArchive {
                to,
                hash,
                archive_hash_path,
                ..
            } => {
                let bytes = extracted
                    .get(&archive_hash_path.parts)
                    .ok_or(InstallError::UnindexedSource {
                        archive: archive_hash_path.archive_hash,
                        path: archive_hash_path.parts.clone(),
                    })?
                    .clone();
                (to, *hash, bytes)
            }
            Directive::PatchedFromArchive {
                to,
                hash,
                archive_hash_path,
                from_hash,
                patch_id,
                ..
            } => {
                // A previous run may have paid for this patch already.
                if let Some(cached) = self.stores.patch_cache.get(*hash)? {
                    if hash_bytes(&cached) == *hash {
                        return self.write_verified(to, *hash, &cached);
                    }
                }

                let source = extracted
                    .get(&archive_hash_path.parts)
                    .ok_or(InstallError::UnindexedSource {
                        archive: archive_hash_path.archive_hash,
                        path: archive_hash_path.parts.clone(),
                    })?;
                let actual_source = hash_bytes(source);
                if actual_source != *from_hash {
                    warn!(
                        "{}: patch basis hashes {actual_source}, directive expected {from_hash}",
                        directive.to()
                    );
                }
                let delta = self
                    .bundle
                    .lock()
                    .expect("bundle lock")
                    .read_blob(patch_id)?;
                let mut patched = Vec::with_capacity(directive.size() as usize);
                apply_delta(source, &mut delta.as_slice(), &mut patched)?;
                self.stores.patch_cache.put(*hash, &patched)?;
                (to, *hash, patched)
            }
            _ => unreachable!("phase 10 only sees archive-sourced directives"),
        };

        self.write_verified(to, expected, &bytes)
    }

    /// Writes through a scratch file, enforcing the directive hash unless
    /// the target is on the known-modified allow-list.
    fn write_verified(&self, to: &RelativePath, expected: Hash, bytes: &[u8]) -> Result<()> {
        let actual = hash_bytes(bytes);
        if actual != expected && !self.is_allowed_modified(to) {
            return Err(InstallError::HashMismatch {
                to: to.clone(),
                expected,
                actual,
            });
        }
        let target = self.config.install_dir.join_rel(to);
        write_atomic(&target, bytes).map_err(InstallError::io(&target))?;
        debug!("wrote {to} ({} bytes)", bytes.len());
        Ok(())
    }

    fn is_allowed_modified(&self, to: &RelativePath) -> bool {
        if to.file_name().eq_ignore_ascii_case(MOD_MANAGER_INI) {
            return true;
        }
        if self.config.allow_modified.iter().any(|allowed| allowed == to) {
            return true;
        }
        // Remapped inline files change by construction.
        self.directives.iter().any(|directive| {
            matches!(directive, Directive::RemappedInlineFile { .. }) && directive.to() == to
        })
    }

    // ── Phase 11 ────────────────────────────────────────────────────

    async fn install_inline_files(&self) -> Result<()> {
        let inline: Vec<&Directive> = self
            .directives
            .iter()
            .filter(|d| matches!(d, Directive::InlineFile { .. }))
            .collect();
        if inline.is_empty() {
            return Ok(());
        }
        info!("writing {} inline files", inline.len());

        for directive in inline {
            self.token.check()?;
            if let Directive::InlineFile {
                to,
                hash,
                source_data_id,
                ..
            } = directive
            {
                let bytes = self
                    .bundle
                    .lock()
                    .expect("bundle lock")
                    .read_blob(source_data_id)?;
                self.write_verified(to, *hash, &bytes)?;
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    // ── Phase 12 ────────────────────────────────────────────────────

    async fn write_meta_files(&self) -> Result<()> {
        let mut by_size: HashMap<u64, Vec<&Archive>> = HashMap::new();
        for archive in &self.modlist.archives {
            by_size.entry(archive.size).or_default().push(archive);
        }

        let files = downloadable_files(&self.config.downloads_dir)
            .map_err(InstallError::io(&self.config.downloads_dir))?;
        for path in files {
            self.token.check()?;
            let size = std::fs::metadata(path.as_std())
                .map_err(InstallError::io(&path))?
                .len();

            // Size narrows first; only then pay for a hash.
            let matched = match by_size.get(&size) {
                Some(candidates) => {
                    let hash = self
                        .stores
                        .hash_cache
                        .compute_or_cache(&path, &self.token)
                        .await?;
                    candidates.iter().find(|archive| archive.hash == hash)
                }
                None => None,
            };

            let meta_path = self
                .config
                .downloads_dir
                .join(&format!("{}.meta", path.file_name().unwrap_or("file")));
            match matched {
                Some(archive) => {
                    let mut contents = String::from("[General]\ninstalled=true\n");
                    for line in meta_ini(archive) {
                        contents.push_str(&line);
                        contents.push('\n');
                    }
                    std::fs::write(meta_path.as_std(), contents)
                        .map_err(InstallError::io(&meta_path))?;
                }
                None => {
                    // A user-maintained meta without the removed key is kept.
                    if meta_path.exists() {
                        let existing = std::fs::read_to_string(meta_path.as_std())
                            .map_err(InstallError::io(&meta_path))?;
                        if !existing.contains("removed=") {
                            continue;
                        }
                    }
                    std::fs::write(meta_path.as_std(), "[General]\nremoved=true\n")
                        .map_err(InstallError::io(&meta_path))?;
                }
            }
        }
        Ok(())
    }

    // ── Phase 13 ────────────────────────────────────────────────────

    async fn build_containers(&self) -> Result<()> {
        let creates: Vec<&Directive> = self
            .directives
            .iter()
            .filter(|d| matches!(d, Directive::CreateBSA { .. }))
            .collect();
        if creates.is_empty() {
            return Ok(());
        }
        info!("building {} container archives", creates.len());

        for directive in &creates {
            self.token.check()?;
            let Directive::CreateBSA {
                to,
                temp_id,
                state,
                file_states,
                ..
            } = directive
            else {
                continue;
            };

            let staged = self
                .config
                .install_dir
                .join(CONTAINER_STAGING)
                .join(temp_id);
            let job = self
                .resources
                .installer
                .begin(format!("build container {to}"), directive.size(), &self.token)
                .await?;
            let outcome = self.build_one_container(to, &staged, state, file_states);
            self.resources.finish_installer_job(job, directive.size());
            outcome?;
        }

        // The staging tree has served its purpose.
        let staging_root = self.config.install_dir.join(CONTAINER_STAGING);
        if staging_root.exists() {
            std::fs::remove_dir_all(staging_root.as_std())
                .map_err(InstallError::io(&staging_root))?;
        }
        Ok(())
    }

    fn build_one_container(
        &self,
        to: &RelativePath,
        staged: &AbsolutePath,
        state: &mason_archives::ContainerState,
        file_states: &[mason_archives::FileState],
    ) -> Result<()> {
        let mut ordered: Vec<&mason_archives::FileState> = file_states.iter().collect();
        ordered.sort_by_key(|file_state| file_state.index());

        let mut builder = ContainerBuilder::new(state)?;
        for file_state in &ordered {
            let source = staged.join_rel(file_state.path());
            let file = File::open(source.as_std()).map_err(InstallError::io(&source))?;
            builder.add_file(file_state, BufReader::new(file))?;
        }

        let target = self.config.install_dir.join_rel(to);
        let scratch = target
            .parent()
            .unwrap_or_else(|| self.config.install_dir.clone())
            .join(&format!(".{}.scratch", to.file_name()));
        {
            let mut out = std::io::BufWriter::new(
                File::create(scratch.as_std()).map_err(InstallError::io(&scratch))?,
            );
            builder.write_to(&mut out)?;
        }
        std::fs::rename(scratch.as_std(), target.as_std())
            .map_err(InstallError::io(&target))?;

        // Readback: every lossless member must hash exactly as its staged
        // source; lossy texture entries are exempt.
        let source = FileSource::new(target.clone()).map_err(InstallError::io(&target))?;
        let mut reader = ContainerReader::open(&source)?;
        let entries = reader.entries();
        for (index, entry) in entries.iter().enumerate() {
            let Some(file_state) = state_for_path(file_states, &entry.path) else {
                return Err(InstallError::ContainerReadback {
                    container: to.clone(),
                    entry: entry.path.clone(),
                });
            };
            if file_state.is_lossy() {
                continue;
            }
            let staged_file = staged.join_rel(file_state.path());
            let staged_bytes =
                std::fs::read(staged_file.as_std()).map_err(InstallError::io(&staged_file))?;
            let readback = reader.read_entry(index)?;
            if hash_bytes(&readback) != hash_bytes(&staged_bytes) {
                return Err(InstallError::ContainerReadback {
                    container: to.clone(),
                    entry: entry.path.clone(),
                });
            }
        }
        info!("built container {to} ({} members)", file_states.len());
        Ok(())
    }

    // ── Phase 14 ────────────────────────────────────────────────────

    async fn generate_merged_patches(&self) -> Result<()> {
        let merges: Vec<&Directive> = self
            .directives
            .iter()
            .filter(|d| matches!(d, Directive::MergedPatch { .. }))
            .collect();
        if merges.is_empty() {
            return Ok(());
        }
        info!("generating {} merged patches", merges.len());

        for directive in merges {
            self.token.check()?;
            let Directive::MergedPatch {
                to,
                hash,
                sources,
                patch_id,
                ..
            } = directive
            else {
                continue;
            };

            // Concatenate sources in declared order.
            let mut basis = Vec::new();
            for source in sources {
                let path = self.config.install_dir.join_rel(&source.relative_path);
                let bytes = std::fs::read(path.as_std()).map_err(InstallError::io(&path))?;
                let actual = hash_bytes(&bytes);
                if actual != source.hash {
                    return Err(InstallError::HashMismatch {
                        to: source.relative_path.clone(),
                        expected: source.hash,
                        actual,
                    });
                }
                basis.extend_from_slice(&bytes);
            }

            let delta = self
                .bundle
                .lock()
                .expect("bundle lock")
                .read_blob(patch_id)?;
            let mut patched = Vec::with_capacity(directive.size() as usize);
            apply_delta(&basis, &mut delta.as_slice(), &mut patched)?;
            self.write_verified(to, *hash, &patched)?;
        }
        Ok(())
    }

    // ── Phase 15 ────────────────────────────────────────────────────

    fn finalize(&self) -> Result<()> {
        // Portable marker: the mod manager must treat this tree as
        // self-contained.
        let marker = self.config.install_dir.join(PORTABLE_MARKER);
        std::fs::write(marker.as_std(), b"").map_err(InstallError::io(&marker))?;

        // Remapped inline files, with path templates substituted.
        for directive in &self.directives {
            if let Directive::RemappedInlineFile {
                to, source_data_id, ..
            } = directive
            {
                let bytes = self
                    .bundle
                    .lock()
                    .expect("bundle lock")
                    .read_blob(source_data_id)?;
                let text = String::from_utf8_lossy(&bytes);
                let substituted = self.substitute_paths(&text);
                let target = self.config.install_dir.join_rel(to);
                write_atomic(&target, substituted.as_bytes())
                    .map_err(InstallError::io(&target))?;
            }
        }

        // Remap the mod manager's download directory.
        let manager_ini = self.config.install_dir.join(MOD_MANAGER_INI);
        if manager_ini.exists() {
            let contents = std::fs::read_to_string(manager_ini.as_std())
                .map_err(InstallError::io(&manager_ini))?;
            let rewritten = rewrite_ini_key(
                &contents,
                "download_directory",
                self.config.downloads_dir.as_str(),
            );
            std::fs::write(manager_ini.as_std(), rewritten)
                .map_err(InstallError::io(&manager_ini))?;
        }

        // Screen-size tweaks in the known display inis.
        self.apply_display_tweaks()?;
        Ok(())
    }

    fn substitute_paths(&self, text: &str) -> String {
        let game = self
            .game_dir
            .as_ref()
            .map(|dir| dir.as_str())
            .unwrap_or_default();
        text.replace("{GAME_PATH}", game)
            .replace("{INSTALL_PATH}", self.config.install_dir.as_str())
            .replace("{DOWNLOADS_PATH}", self.config.downloads_dir.as_str())
    }

    fn apply_display_tweaks(&self) -> Result<()> {
        for entry in walkdir::WalkDir::new(self.config.install_dir.as_std()) {
            let entry = entry.map_err(std::io::Error::other).map_err(InstallError::io(
                &self.config.install_dir,
            ))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            if !DISPLAY_INIS.contains(&name.as_str()) {
                continue;
            }
            let Ok(path) = AbsolutePath::from_std(entry.path().to_path_buf()) else {
                continue;
            };
            let contents =
                std::fs::read_to_string(path.as_std()).map_err(InstallError::io(&path))?;
            let mut rewritten =
                rewrite_ini_key(&contents, "iSize W", &self.config.system.screen_width.to_string());
            rewritten = rewrite_ini_key(
                &rewritten,
                "iSize H",
                &self.config.system.screen_height.to_string(),
            );
            std::fs::write(path.as_std(), rewritten).map_err(InstallError::io(&path))?;
            debug!("applied screen-size tweaks to {path}");
        }
        Ok(())
    }

    /// Re-hashes every directive target against its expected hash. Targets
    /// the engine rebuilds or remaps are skipped, as is the allow-list.
    pub async fn verify_installed(&self) -> Result<Vec<RelativePath>> {
        let mut mismatched = Vec::new();
        for directive in &self.directives {
            self.token.check()?;
            if matches!(
                directive,
                Directive::CreateBSA { .. } | Directive::RemappedInlineFile { .. }
            ) || self.is_allowed_modified(directive.to())
                // Container staging inputs are consumed by phase 13.
                || directive.to().starts_with_dir(CONTAINER_STAGING)
            {
                continue;
            }
            let target = self.config.install_dir.join_rel(directive.to());
            let actual = match std::fs::read(target.as_std()) {
                Ok(bytes) => hash_bytes(&bytes),
                Err(_) => Hash::NULL,
            };
            if actual != directive.hash() {
                mismatched.push(directive.to().clone());
            }
        }
        Ok(mismatched)
    }
}

impl EngineResources {
    fn finish_installer_job(&self, job: mason_resources::Job, size: u64) {
        self.installer.report_no_wait(&job, size);
        self.installer.finish(job);
    }
}

/// Rewrites (or appends) a `key=value` line, preserving everything else.
fn rewrite_ini_key(contents: &str, key: &str, value: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    let mut found = false;
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed
            .to_ascii_lowercase()
            .starts_with(&key.to_ascii_lowercase())
            && trimmed[key.len()..].trim_start().starts_with('=')
        {
            out.push_str(&format!("{key}={value}"));
            found = true;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if !found {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_ini_key_replaces_in_place() {
        let ini = "[General]\ngameName=skyrimse\ndownload_directory=C:/old\nother=1\n";
        let out = rewrite_ini_key(ini, "download_directory", "/new/downloads");
        assert!(out.contains("download_directory=/new/downloads"));
        assert!(out.contains("gameName=skyrimse"));
        assert!(out.contains("other=1"));
        assert!(!out.contains("C:/old"));
    }

    #[test]
    fn rewrite_ini_key_appends_when_absent() {
        let out = rewrite_ini_key("[Display]\n", "iSize W", "2560");
        assert!(out.ends_with("iSize W=2560\n"));
    }

    #[test]
    fn rewrite_ini_key_is_case_insensitive_on_match() {
        let out = rewrite_ini_key("isize w = 800\n", "iSize W", "1920");
        assert_eq!(out, "iSize W=1920\n");
    }
}
