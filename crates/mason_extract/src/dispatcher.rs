//! The extraction dispatcher: recognises the source format, picks the
//! matching extractor, and yields `(relative path, extracted file)` pairs to
//! a caller-supplied mapper.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mason_archives::{BtarReader, ContainerReader};
use mason_core::{
    signature, AbsolutePath, CancelToken, FileSignature, FileSource, RelativePath, StreamSource,
    TempDir, TempManager,
};
use mason_resources::Resource;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ExtractError, Result};
use crate::extracted::ExtractedFile;
use crate::external::{ToolExtraction, ToolKind, DEFAULT_CASE_VARIANT_ROOTS};
use crate::native::NativeTool;
use crate::normalize::repair_backslash_names;
use crate::omod::extract_omod;

/// Paths to the two native binaries plus the configurable case-variant
/// roots. The default root list covers the six directories the tools are
/// known to disagree on; other roots are not case-expanded.
pub struct ExtractionSettings {
    pub archive_tool: AbsolutePath,
    /// A second backend with different filename-encoding behaviour, used
    /// once when a filtered extraction comes back short.
    pub fallback_archive_tool: Option<AbsolutePath>,
    pub payload_tool: AbsolutePath,
    pub case_variant_roots: Vec<String>,
}

impl ExtractionSettings {
    pub fn new(archive_tool: AbsolutePath, payload_tool: AbsolutePath) -> Self {
        Self {
            archive_tool,
            fallback_archive_tool: None,
            payload_tool,
            case_variant_roots: DEFAULT_CASE_VARIANT_ROOTS
                .iter()
                .map(|root| root.to_string())
                .collect(),
        }
    }

    pub fn with_fallback_tool(mut self, tool: AbsolutePath) -> Self {
        self.fallback_archive_tool = Some(tool);
        self
    }

    pub fn with_case_variant_roots(mut self, roots: Vec<String>) -> Self {
        self.case_variant_roots = roots;
        self
    }
}

pub struct Extractor {
    settings: ExtractionSettings,
    temp: Arc<TempManager>,
    resource: Resource,
}

/// What the dispatcher decided to do with a source.
enum Plan {
    Tool(ToolKind),
    Omod,
    Btar,
    Container,
}

impl Extractor {
    pub fn new(settings: ExtractionSettings, temp: Arc<TempManager>, resource: Resource) -> Self {
        Self {
            settings,
            temp,
            resource,
        }
    }

    /// Extracts `source`, calling `map` for every entry that passes
    /// `should_extract`, and returns the mapping of entry paths to mapper
    /// results.
    ///
    /// When `only_files` is supplied the realised entry set must match it
    /// exactly; a shortfall triggers one fallback attempt with the alternate
    /// native backend before the mismatch becomes fatal.
    #[allow(clippy::too_many_arguments)]
    pub async fn gathering_extract<T>(
        &self,
        invoker: &dyn NativeTool,
        source: &FileSource,
        should_extract: &(dyn Fn(&RelativePath) -> bool + Send + Sync),
        map: &mut (dyn FnMut(&RelativePath, ExtractedFile) -> Result<T> + Send),
        only_files: Option<&HashSet<RelativePath>>,
        progress: Option<&(dyn Fn(u8) + Send + Sync)>,
        token: &CancelToken,
    ) -> Result<HashMap<RelativePath, T>> {
        let job = self
            .resource
            .begin(format!("extract {}", source.name()), source.size(), token)
            .await?;

        let result = self
            .dispatch(invoker, source, should_extract, map, only_files, progress, &job, token)
            .await;

        self.resource.finish(job);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch<T>(
        &self,
        invoker: &dyn NativeTool,
        source: &FileSource,
        should_extract: &(dyn Fn(&RelativePath) -> bool + Send + Sync),
        map: &mut (dyn FnMut(&RelativePath, ExtractedFile) -> Result<T> + Send),
        only_files: Option<&HashSet<RelativePath>>,
        progress: Option<&(dyn Fn(u8) + Send + Sync)>,
        job: &mason_resources::Job,
        token: &CancelToken,
    ) -> Result<HashMap<RelativePath, T>> {
        let plan = self.plan_for(source)?;

        match plan {
            Plan::Btar => {
                let reader = BtarReader::open(source)?;
                let buffer = reader.shared_buffer();
                let mut results = HashMap::new();
                for entry in reader.entries() {
                    token.check()?;
                    if !passes(&entry.name, should_extract, only_files) {
                        continue;
                    }
                    let handle = ExtractedFile::Slice {
                        name: entry.name.clone(),
                        buffer: Arc::clone(&buffer),
                        range: entry.range(),
                    };
                    self.resource.report_no_wait(job, entry.len());
                    results.insert(entry.name.clone(), map(&entry.name, handle)?);
                    tokio::task::yield_now().await;
                }
                self.check_counts(source, only_files, results)
            }
            Plan::Container => {
                let mut reader = ContainerReader::open(source)?;
                let entries = reader.entries();
                let mut results = HashMap::new();
                for (index, entry) in entries.iter().enumerate() {
                    token.check()?;
                    if !passes(&entry.path, should_extract, only_files) {
                        continue;
                    }
                    let bytes = reader.read_entry(index)?;
                    self.resource.report_no_wait(job, bytes.len() as u64);
                    let handle = ExtractedFile::Memory {
                        name: entry.path.clone(),
                        bytes,
                    };
                    results.insert(entry.path.clone(), map(&entry.path, handle)?);
                    tokio::task::yield_now().await;
                }
                self.check_counts(source, only_files, results)
            }
            Plan::Omod => {
                let staging = self.temp.scoped("omod")?;
                let extracted = extract_omod(source.open()?, staging.path())?;
                let entries: Vec<(RelativePath, AbsolutePath)> = extracted
                    .into_iter()
                    .map(|rel| {
                        let abs = staging.path().join_rel(&rel);
                        (rel, abs)
                    })
                    .collect();
                self.map_disk_entries(entries, &staging, should_extract, map, only_files, source, token)
            }
            Plan::Tool(kind) => {
                let staging = self.temp.scoped("extract")?;
                let binary = match kind {
                    ToolKind::Archive => self.settings.archive_tool.clone(),
                    ToolKind::InstallerPayload => self.settings.payload_tool.clone(),
                };
                self.run_tool(invoker, source, &binary, kind, &staging, only_files, progress, job, token)
                    .await?;
                let mut entries = enumerate_tree(staging.path())?;

                if let Some(only) = only_files {
                    let found: HashSet<&RelativePath> =
                        entries.iter().map(|(rel, _)| rel).collect();
                    let shortfall = only.iter().any(|want| !found.contains(want));
                    if shortfall {
                        if let (Some(fallback), ToolKind::Archive) =
                            (self.settings.fallback_archive_tool.clone(), kind)
                        {
                            warn!(
                                "{}: filtered extraction came back short, retrying with fallback backend",
                                source.name()
                            );
                            clean_tree(staging.path())?;
                            self.run_tool(
                                invoker, source, &fallback, kind, &staging, only_files,
                                progress, job, token,
                            )
                            .await?;
                            entries = enumerate_tree(staging.path())?;
                        }
                    }
                }

                self.map_disk_entries(entries, &staging, should_extract, map, only_files, source, token)
            }
        }
    }

    /// Format → extractor choice. The extension decides before the magic
    /// for the embedded installer package and the legacy container.
    fn plan_for(&self, source: &FileSource) -> Result<Plan> {
        let extension = source
            .path()
            .extension()
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if extension == "omod" {
            return Ok(Plan::Omod);
        }

        let mut stream = source.open()?;
        let detected = signature::detect(&mut stream)?;
        drop(stream);

        match detected {
            Some(FileSignature::Zip)
            | Some(FileSignature::SevenZip)
            | Some(FileSignature::RarOld)
            | Some(FileSignature::RarNew) => Ok(Plan::Tool(ToolKind::Archive)),
            Some(FileSignature::Exe) => Ok(Plan::Tool(ToolKind::InstallerPayload)),
            Some(FileSignature::Btar) => Ok(Plan::Btar),
            Some(FileSignature::Bsa) | Some(FileSignature::Ba2) => Ok(Plan::Container),
            Some(FileSignature::Tes3) if extension == "bsa" => Ok(Plan::Container),
            Some(FileSignature::Tes3) => Err(ExtractError::InvalidFormat(format!(
                "{}: legacy container magic without .bsa extension",
                source.name()
            ))),
            None => Err(ExtractError::InvalidFormat(source.name().to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tool(
        &self,
        invoker: &dyn NativeTool,
        source: &FileSource,
        binary: &AbsolutePath,
        kind: ToolKind,
        staging: &TempDir,
        only_files: Option<&HashSet<RelativePath>>,
        progress: Option<&(dyn Fn(u8) + Send + Sync)>,
        job: &mason_resources::Job,
        token: &CancelToken,
    ) -> Result<()> {
        let extraction = ToolExtraction {
            invoker,
            binary: binary.clone(),
            kind,
            source: source.path().clone(),
            source_size: source.size(),
            destination: staging.path().clone(),
            case_roots: &self.settings.case_variant_roots,
        };
        extraction
            .run(
                only_files,
                |percent, delta| {
                    self.resource.report_no_wait(job, delta);
                    if let Some(progress) = progress {
                        progress(percent);
                    }
                },
                token,
            )
            .await?;

        repair_backslash_names(staging.path())?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn map_disk_entries<T>(
        &self,
        entries: Vec<(RelativePath, AbsolutePath)>,
        _staging: &TempDir,
        should_extract: &(dyn Fn(&RelativePath) -> bool + Send + Sync),
        map: &mut (dyn FnMut(&RelativePath, ExtractedFile) -> Result<T> + Send),
        only_files: Option<&HashSet<RelativePath>>,
        source: &FileSource,
        token: &CancelToken,
    ) -> Result<HashMap<RelativePath, T>> {
        let mut results = HashMap::new();
        for (rel, abs) in entries {
            token.check()?;
            if !passes(&rel, should_extract, only_files) {
                continue;
            }
            let last_modified = std::fs::metadata(abs.as_std())
                .and_then(|meta| meta.modified())
                .ok();
            let handle = ExtractedFile::Disk {
                name: rel.clone(),
                path: abs,
                last_modified,
            };
            results.insert(rel.clone(), map(&rel, handle)?);
        }
        self.check_counts(source, only_files, results)
    }

    fn check_counts<T>(
        &self,
        source: &FileSource,
        only_files: Option<&HashSet<RelativePath>>,
        results: HashMap<RelativePath, T>,
    ) -> Result<HashMap<RelativePath, T>> {
        let Some(only) = only_files else {
            debug!("{}: extracted {} entries", source.name(), results.len());
            return Ok(results);
        };
        if results.len() == only.len() {
            info!(
                "{}: extracted all {} requested entries",
                source.name(),
                only.len()
            );
            return Ok(results);
        }
        let missing: Vec<RelativePath> = only
            .iter()
            .filter(|want| !results.contains_key(*want))
            .cloned()
            .collect();
        Err(ExtractError::SanityCheck {
            archive: source.path().clone(),
            expected: only.len(),
            actual: results.len(),
            missing,
        })
    }
}

fn passes(
    path: &RelativePath,
    should_extract: &(dyn Fn(&RelativePath) -> bool + Send + Sync),
    only_files: Option<&HashSet<RelativePath>>,
) -> bool {
    if let Some(only) = only_files {
        if !only.contains(path) {
            return false;
        }
    }
    should_extract(path)
}

/// Lists every file under `root` as `(relative, absolute)` pairs.
fn enumerate_tree(root: &AbsolutePath) -> Result<Vec<(RelativePath, AbsolutePath)>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root.as_std()).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root.as_std())
            .map_err(|_| std::io::Error::other("walked outside the staging root"))?;
        let parts: Vec<&str> = rel
            .components()
            .map(|component| component.as_os_str().to_str().unwrap_or_default())
            .collect();
        let rel = RelativePath::from_parts(&parts);
        let abs = AbsolutePath::from_std(entry.path().to_path_buf())
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        out.push((rel, abs));
    }
    Ok(out)
}

fn clean_tree(root: &AbsolutePath) -> Result<()> {
    for entry in std::fs::read_dir(root.as_std())? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
