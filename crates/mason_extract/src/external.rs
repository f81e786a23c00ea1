//! Invocation of the external archive and installer-payload tools: pattern
//! files with case variants, stdout progress scanning, and the exit-code
//! retry policy.

use std::collections::HashSet;
use std::time::Duration;

use mason_core::{AbsolutePath, CancelToken, RelativePath};
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::error::{ExtractError, Result};
use crate::native::{NativeTool, ToolRequest};

/// Directory roots whose case the native tools are known to disagree on.
pub const DEFAULT_CASE_VARIANT_ROOTS: [&str; 6] = [
    "textures",
    "meshes",
    "sounds",
    "music",
    "scripts",
    "interface",
];

const RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Which external binary to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Archive,
    InstallerPayload,
}

/// All the per-path spellings the native tool might need: both separators,
/// optional leading separators, and case variants for the well-known roots.
pub fn pattern_variants(path: &RelativePath, case_roots: &[String]) -> Vec<String> {
    let forward = path.as_str().to_string();
    let mut bases = vec![forward.clone()];

    if let Some(first) = path.components().next() {
        for root in case_roots {
            if first.eq_ignore_ascii_case(root) {
                let rest = &forward[first.len()..];
                bases.push(format!("{}{rest}", root.to_ascii_lowercase()));
                bases.push(format!("{}{rest}", title_case(root)));
            }
        }
    }

    let mut variants = Vec::new();
    let mut seen = HashSet::new();
    for base in bases {
        let backward = base.replace('/', "\\");
        for candidate in [
            base.clone(),
            backward.clone(),
            format!("/{base}"),
            format!("\\{backward}"),
        ] {
            if seen.insert(candidate.clone()) {
                variants.push(candidate);
            }
        }
    }
    variants
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Writes the quoted pattern file the archive tool consumes.
fn write_pattern_file(
    dir: &AbsolutePath,
    only_files: &HashSet<RelativePath>,
    case_roots: &[String],
) -> Result<AbsolutePath> {
    let mut contents = String::new();
    for path in only_files {
        for variant in pattern_variants(path, case_roots) {
            contents.push('"');
            contents.push_str(&variant);
            contents.push_str("\"\n");
        }
    }
    let file = dir.join("patterns.txt");
    std::fs::write(file.as_std(), contents)?;
    Ok(file)
}

pub struct ToolExtraction<'a> {
    pub invoker: &'a dyn NativeTool,
    pub binary: AbsolutePath,
    pub kind: ToolKind,
    pub source: AbsolutePath,
    pub source_size: u64,
    pub destination: AbsolutePath,
    pub case_roots: &'a [String],
}

impl ToolExtraction<'_> {
    /// Runs the tool with retries. Non-zero exits clean the destination,
    /// back off one second, and try again; the third failure is fatal and
    /// carries the code.
    pub async fn run(
        &self,
        only_files: Option<&HashSet<RelativePath>>,
        mut on_progress: impl FnMut(u8, u64) + Send,
        token: &CancelToken,
    ) -> Result<()> {
        let pattern_file = match only_files {
            Some(set) if self.kind == ToolKind::Archive => Some(write_pattern_file(
                &self.destination,
                set,
                self.case_roots,
            )?),
            _ => None,
        };

        let mut attempt = 0;
        loop {
            token.check()?;
            attempt += 1;

            let mut args = match self.kind {
                ToolKind::Archive => vec![
                    "x".to_string(),
                    "-r-".to_string(),
                    "-y".to_string(),
                    "-bsp1".to_string(),
                    format!("-o{}", self.invoker.translate(&self.destination)),
                    self.invoker.translate(&self.source),
                ],
                ToolKind::InstallerPayload => vec![
                    "--extract".to_string(),
                    "--silent".to_string(),
                    format!("--output-dir={}", self.invoker.translate(&self.destination)),
                    self.invoker.translate(&self.source),
                ],
            };
            if let Some(pattern) = &pattern_file {
                args.push(format!("@{}", self.invoker.translate(pattern)));
            }
            if self.kind == ToolKind::Archive {
                args.push("-mmt=off".to_string());
            }

            let total = self.source_size;
            let mut last_position = 0u64;
            let mut on_line = |line: &str| {
                if let Some(percent) = parse_percent(line) {
                    let position = total * u64::from(percent) / 100;
                    let delta = position.saturating_sub(last_position);
                    last_position = position;
                    on_progress(percent, delta);
                }
            };

            let code = self
                .invoker
                .run(
                    ToolRequest {
                        binary: self.binary.clone(),
                        args,
                        working_dir: None,
                        env: vec![],
                    },
                    &mut on_line,
                    token,
                )
                .await?;

            if code == 0 {
                if let Some(pattern) = &pattern_file {
                    let _ = std::fs::remove_file(pattern.as_std());
                }
                return Ok(());
            }

            if attempt <= RETRIES {
                warn!(
                    "native tool exited with {code} on {}, retrying ({attempt}/{RETRIES})",
                    self.source
                );
                clean_destination(&self.destination, pattern_file.as_ref())?;
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }

            return Err(ExtractError::ToolFailed {
                code,
                meaning: ExtractError::code_meaning(code),
                archive: self.source.clone(),
                diagnostics: self.diagnostics(code),
            });
        }
    }

    /// Corruption-or-space failures get sizing context in the message.
    fn diagnostics(&self, code: i32) -> String {
        if code != 255 {
            return String::new();
        }
        let free = free_space_for(&self.destination);
        format!(
            "; archive size {} bytes, destination free space {} bytes",
            self.source_size,
            free.map(|b| b.to_string()).unwrap_or_else(|| "unknown".into())
        )
    }
}

fn clean_destination(destination: &AbsolutePath, keep: Option<&AbsolutePath>) -> Result<()> {
    for entry in std::fs::read_dir(destination.as_std())? {
        let entry = entry?;
        if let Some(keep) = keep {
            if entry.path() == keep.as_std() {
                continue;
            }
        }
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    debug!("cleaned extraction destination {destination}");
    Ok(())
}

fn free_space_for(path: &AbsolutePath) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.as_std().starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Accepts the tool's `NNN%…` progress lines, tolerating leading spaces and
/// trailing text.
pub fn parse_percent(line: &str) -> Option<u8> {
    let trimmed = line.trim_start();
    let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if !trimmed[digits.len()..].starts_with('%') {
        return None;
    }
    digits.parse::<u8>().ok().filter(|p| *p <= 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    #[test]
    fn percent_lines_parse() {
        assert_eq!(parse_percent(" 42% 12345 - file.dds"), Some(42));
        assert_eq!(parse_percent("100%"), Some(100));
        assert_eq!(parse_percent("7z listing"), None);
        assert_eq!(parse_percent("140%"), None);
        assert_eq!(parse_percent(""), None);
    }

    #[test]
    fn variants_cover_separators_and_leading_slashes() {
        let roots: Vec<String> = DEFAULT_CASE_VARIANT_ROOTS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let variants = pattern_variants(&rel("docs/readme.txt"), &roots);
        assert!(variants.contains(&"docs/readme.txt".to_string()));
        assert!(variants.contains(&"docs\\readme.txt".to_string()));
        assert!(variants.contains(&"/docs/readme.txt".to_string()));
        assert!(variants.contains(&"\\docs\\readme.txt".to_string()));
    }

    #[test]
    fn well_known_roots_get_case_variants() {
        let roots: Vec<String> = DEFAULT_CASE_VARIANT_ROOTS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let variants = pattern_variants(&rel("Textures/armor/a.dds"), &roots);
        assert!(variants.contains(&"textures/armor/a.dds".to_string()));
        assert!(variants.contains(&"Textures/armor/a.dds".to_string()));
        assert!(variants.contains(&"textures\\armor\\a.dds".to_string()));

        // Unknown roots only get separator variants.
        let plain = pattern_variants(&rel("docs/readme.txt"), &roots);
        assert_eq!(plain.len(), 4);
    }

    #[test]
    fn pattern_file_quotes_every_variant() {
        let dir = tempfile::tempdir().unwrap();
        let dest = AbsolutePath::from_std(dir.path().to_path_buf()).unwrap();
        let roots: Vec<String> = DEFAULT_CASE_VARIANT_ROOTS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut only = HashSet::new();
        only.insert(rel("meshes/chair.nif"));

        let file = write_pattern_file(&dest, &only, &roots).unwrap();
        let contents = std::fs::read_to_string(file.as_std()).unwrap();
        for line in contents.lines() {
            assert!(line.starts_with('"') && line.ends_with('"'), "line: {line}");
        }
        assert!(contents.contains("\"meshes/chair.nif\""));
        assert!(contents.contains("\"Meshes\\chair.nif\""));
    }
}
