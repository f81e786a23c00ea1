//! Post-extraction repair: some native tools, on hosts where `\` is not a
//! separator, emit single files whose basename contains embedded `\`. Those
//! names are rewritten into real directory structure before entries are
//! enumerated for the mapper.

use mason_core::AbsolutePath;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;

/// Splits every basename containing `\` into nested directories. Returns
/// the number of files repaired.
pub fn repair_backslash_names(root: &AbsolutePath) -> Result<usize> {
    let mut repaired = 0;
    // Collect first; renaming while walking confuses the iterator.
    let mut victims = Vec::new();
    for entry in WalkDir::new(root.as_std()) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.contains('\\') {
            victims.push(entry.path().to_path_buf());
        }
    }

    for victim in victims {
        let name = victim
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parts: Vec<&str> = name.split('\\').filter(|part| !part.is_empty()).collect();
        if parts.len() < 2 {
            continue;
        }

        let parent = victim.parent().unwrap_or(root.as_std());
        let mut target = parent.to_path_buf();
        for part in &parts[..parts.len() - 1] {
            target.push(part);
        }
        std::fs::create_dir_all(&target)?;
        target.push(parts[parts.len() - 1]);

        debug!("repairing '{name}' into nested path");
        std::fs::rename(&victim, &target)?;
        repaired += 1;
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_backslash_basenames() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsolutePath::from_std(dir.path().to_path_buf()).unwrap();

        std::fs::write(dir.path().join(r"meshes\armor\boots.nif"), b"nif").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join(r"a\b.txt"), b"txt").unwrap();
        std::fs::write(dir.path().join("plain.txt"), b"ok").unwrap();

        let repaired = repair_backslash_names(&root).unwrap();
        assert_eq!(repaired, 2);

        assert_eq!(
            std::fs::read(dir.path().join("meshes/armor/boots.nif")).unwrap(),
            b"nif"
        );
        assert_eq!(
            std::fs::read(dir.path().join("sub/a/b.txt")).unwrap(),
            b"txt"
        );
        assert!(dir.path().join("plain.txt").exists());
        assert!(!dir.path().join(r"meshes\armor\boots.nif").exists());
    }

    #[test]
    fn skips_names_with_only_empty_segments() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsolutePath::from_std(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join(r"trailing\"), b"x").unwrap_or(());
        // Nothing to repair in an empty or odd tree.
        assert!(repair_backslash_names(&root).is_ok());
    }
}
