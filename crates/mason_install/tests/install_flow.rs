//! End-to-end installs against in-process container archives: no network,
//! no external tools.

use std::io::Write;
use std::sync::Arc;

use mason_archives::{BsaBuilder, ContainerReader, ContainerState, FileState};
use mason_core::{hash_bytes, AbsolutePath, CancelToken, FileSource, Hash, RelativePath};
use mason_extract::{ExtractionSettings, HostTool};
use mason_install::{
    EngineSettings, InstallOutcome, Installer, InstallerConfiguration, SystemParameters,
};
use mason_modlist::{
    Archive, ArchiveHashPath, ArchiveState, Directive, GameType, Modlist, PatchSource,
};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn rel(path: &str) -> RelativePath {
    RelativePath::new(path).unwrap()
}

fn abs(path: std::path::PathBuf) -> AbsolutePath {
    AbsolutePath::from_std(path).unwrap()
}

fn build_bsa(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = BsaBuilder::new(105, 0, 0x1).unwrap();
    for (path, bytes) in entries {
        builder.add_file(&rel(path), *bytes, false).unwrap();
    }
    let mut cursor = std::io::Cursor::new(Vec::new());
    builder.write_to(&mut cursor).unwrap();
    cursor.into_inner()
}

/// Minimal delta builder matching the engine's applier.
fn build_delta(commands: &[(Option<(u64, u64)>, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"OCTODELTA");
    out.push(0x01);
    out.push(4);
    out.extend_from_slice(b"XXH3");
    out.extend_from_slice(&8i32.to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(b">>>");
    for (copy, data) in commands {
        if let Some((offset, length)) = copy {
            out.push(0x60);
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&length.to_le_bytes());
        }
        if !data.is_empty() {
            out.push(0x80);
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(data);
        }
    }
    out
}

struct Fixture {
    root: tempfile::TempDir,
    install: AbsolutePath,
    downloads: AbsolutePath,
    game: AbsolutePath,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let install = abs(root.path().join("install"));
    let downloads = abs(root.path().join("downloads"));
    let game = abs(root.path().join("game"));
    std::fs::create_dir_all(downloads.as_std()).unwrap();
    std::fs::create_dir_all(game.as_std()).unwrap();
    std::fs::write(
        game.join(GameType::SkyrimSpecialEdition.main_executable())
            .as_std(),
        b"exe",
    )
    .unwrap();
    Fixture {
        root,
        install,
        downloads,
        game,
    }
}

fn write_bundle(
    fixture: &Fixture,
    modlist: &Modlist,
    blobs: &[(&str, &[u8])],
) -> AbsolutePath {
    let path = fixture.root.path().join("list.modlist");
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    zip.start_file("modlist", options).unwrap();
    zip.write_all(serde_json::to_string(modlist).unwrap().as_bytes())
        .unwrap();
    for (id, bytes) in blobs {
        zip.start_file(*id, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
    abs(path)
}

async fn installer_for(
    fixture: &Fixture,
    bundle: AbsolutePath,
    allow_modified: Vec<RelativePath>,
    token: CancelToken,
) -> Installer {
    let mut config =
        InstallerConfiguration::new(bundle, fixture.install.clone(), fixture.downloads.clone())
            .with_game_dir(fixture.game.clone())
            .with_system(SystemParameters {
                screen_width: 2560,
                screen_height: 1440,
                video_memory_bytes: 8 << 30,
            });
    config.allow_modified = allow_modified;

    let tools = ExtractionSettings::new(
        abs(std::path::PathBuf::from("/usr/bin/7z")),
        abs(std::path::PathBuf::from("/usr/bin/innoextract")),
    );
    Installer::new(
        config,
        tools,
        Arc::new(HostTool),
        EngineSettings::default(),
        token,
    )
    .await
    .unwrap()
}

fn base_modlist() -> Modlist {
    Modlist {
        name: "Flow Test".into(),
        author: "tests".into(),
        description: String::new(),
        version: "1.0.0".into(),
        game_type: GameType::SkyrimSpecialEdition,
        archives: Vec::new(),
        directives: Vec::new(),
    }
}

#[tokio::test]
async fn full_install_flow() {
    let fx = fixture();

    // One source archive carrying a texture and a staged container member.
    let wood = b"wood bytes".as_slice();
    let chair = b"chair nif bytes".as_slice();
    let bsa = build_bsa(&[("textures/wood.dds", wood), ("meshes/chair.nif", chair)]);
    let bsa_hash = hash_bytes(&bsa);
    std::fs::write(fx.downloads.join("textures_pack.bsa").as_std(), &bsa).unwrap();
    // A leftover file no archive matches.
    std::fs::write(fx.downloads.join("orphan.bin").as_std(), b"orphan").unwrap();

    let inline_blob = b"+ModA\n+ModB\n".as_slice();
    let prefs_blob = b"[Display]\niSize W=1280\niSize H=720\n".as_slice();
    let manager_blob =
        b"[Settings]\ndownload_directory=C:/placeholder\nbase_directory={INSTALL_PATH}\n"
            .as_slice();

    let merged_basis = wood.to_vec();
    let merged_out = b"merged plugin bytes".as_slice();
    let merge_delta = build_delta(&[
        (Some((0, merged_basis.len() as u64)), b""),
        (None, merged_out),
    ]);
    let merged_expect: Vec<u8> = {
        let mut v = merged_basis.clone();
        v.extend_from_slice(merged_out);
        v
    };

    // Data-only delta producing a fresh payload from the wood texture.
    let wood_patch_delta = build_delta(&[(None, b"patched wood output")]);

    let mut modlist = base_modlist();
    modlist.archives = vec![Archive {
        name: "textures_pack.bsa".into(),
        hash: bsa_hash,
        size: bsa.len() as u64,
        state: ArchiveState::Http {
            url: "https://example.com/textures_pack.bsa".into(),
            headers: vec![],
        },
    }];
    modlist.directives = vec![
        Directive::FromArchive {
            to: rel("mods/wood/wood.dds"),
            hash: hash_bytes(wood),
            size: wood.len() as u64,
            archive_hash_path: ArchiveHashPath::new(bsa_hash, vec![rel("textures/wood.dds")]),
        },
        Directive::FromArchive {
            to: rel("TEMP_BSA_FILES/bsa1/meshes/chair.nif"),
            hash: hash_bytes(chair),
            size: chair.len() as u64,
            archive_hash_path: ArchiveHashPath::new(bsa_hash, vec![rel("meshes/chair.nif")]),
        },
        // A redundant duplicate that phase 2 collapses.
        Directive::FromArchive {
            to: rel("mods/wood/wood.dds"),
            hash: hash_bytes(wood),
            size: wood.len() as u64,
            archive_hash_path: ArchiveHashPath::new(bsa_hash, vec![rel("textures/wood.dds")]),
        },
        Directive::PatchedFromArchive {
            to: rel("mods/wood/wood_hd.dds"),
            hash: hash_bytes(b"patched wood output"),
            size: 19,
            archive_hash_path: ArchiveHashPath::new(bsa_hash, vec![rel("textures/wood.dds")]),
            from_hash: hash_bytes(wood),
            patch_id: "blob-wood-patch".into(),
        },
        Directive::InlineFile {
            to: rel("profiles/Default/modlist.txt"),
            hash: hash_bytes(inline_blob),
            size: inline_blob.len() as u64,
            source_data_id: "blob-modlist".into(),
        },
        Directive::InlineFile {
            to: rel("profiles/Default/skyrimprefs.ini"),
            hash: hash_bytes(prefs_blob),
            size: prefs_blob.len() as u64,
            source_data_id: "blob-prefs".into(),
        },
        Directive::RemappedInlineFile {
            to: rel("ModOrganizer.ini"),
            hash: hash_bytes(manager_blob),
            size: manager_blob.len() as u64,
            source_data_id: "blob-manager".into(),
        },
        Directive::CreateBSA {
            to: rel("mods/out/pack.bsa"),
            hash: Hash::NULL,
            size: 0,
            temp_id: "bsa1".into(),
            state: ContainerState::Bsa {
                version: 105,
                archive_flags: 0,
                file_flags: 0x1,
            },
            file_states: vec![FileState::BsaFile {
                path: rel("meshes/chair.nif"),
                index: 0,
                flip_compression: false,
            }],
        },
        Directive::MergedPatch {
            to: rel("patches/merged.esp"),
            hash: hash_bytes(&merged_expect),
            size: merged_expect.len() as u64,
            sources: vec![PatchSource {
                hash: hash_bytes(wood),
                relative_path: rel("mods/wood/wood.dds"),
            }],
            patch_id: "blob-merge".into(),
        },
    ];

    let bundle = write_bundle(
        &fx,
        &modlist,
        &[
            ("blob-modlist", inline_blob),
            ("blob-prefs", prefs_blob),
            ("blob-manager", manager_blob),
            ("blob-merge", &merge_delta),
            ("blob-wood-patch", &wood_patch_delta),
        ],
    );

    let token = CancelToken::never();
    let mut installer = installer_for(
        &fx,
        bundle,
        vec![rel("profiles/Default/skyrimprefs.ini")],
        token,
    )
    .await;
    let outcome = installer.run().await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Completed), "{outcome:?}");

    // Hash fidelity for plain outputs.
    assert_eq!(
        std::fs::read(fx.install.join_rel(&rel("mods/wood/wood.dds")).as_std()).unwrap(),
        wood
    );
    assert_eq!(
        std::fs::read(
            fx.install
                .join_rel(&rel("profiles/Default/modlist.txt"))
                .as_std()
        )
        .unwrap(),
        inline_blob
    );
    assert_eq!(
        std::fs::read(fx.install.join_rel(&rel("patches/merged.esp")).as_std()).unwrap(),
        merged_expect
    );
    assert_eq!(
        std::fs::read(fx.install.join_rel(&rel("mods/wood/wood_hd.dds")).as_std()).unwrap(),
        b"patched wood output"
    );

    // The rebuilt container reads back with the staged member, and the
    // staging tree is gone.
    let container_path = fx.install.join_rel(&rel("mods/out/pack.bsa"));
    let source = FileSource::new(container_path).unwrap();
    let mut reader = ContainerReader::open(&source).unwrap();
    assert_eq!(reader.entries().len(), 1);
    assert_eq!(reader.read_entry(0).unwrap(), chair);
    assert!(!fx.install.join("TEMP_BSA_FILES").exists());

    // Finalise artefacts: the portable marker, the remapped manager ini,
    // and the display tweaks.
    assert!(fx.install.join("portable.txt").exists());
    let manager = std::fs::read_to_string(fx.install.join("ModOrganizer.ini").as_std()).unwrap();
    assert!(manager.contains(&format!("download_directory={}", fx.downloads)));
    assert!(manager.contains(&format!("base_directory={}", fx.install)));
    let prefs = std::fs::read_to_string(
        fx.install
            .join_rel(&rel("profiles/Default/skyrimprefs.ini"))
            .as_std(),
    )
    .unwrap();
    assert!(prefs.contains("iSize W=2560"));
    assert!(prefs.contains("iSize H=1440"));

    // Meta-file contract.
    let meta = std::fs::read_to_string(
        fx.downloads.join("textures_pack.bsa.meta").as_std(),
    )
    .unwrap();
    assert!(meta.starts_with("[General]\ninstalled=true\n"));
    assert!(meta.contains("directURL=https://example.com/textures_pack.bsa"));
    let orphan_meta =
        std::fs::read_to_string(fx.downloads.join("orphan.bin.meta").as_std()).unwrap();
    assert!(orphan_meta.contains("removed=true"));

    // The verify pass agrees.
    assert!(installer.verify_installed().await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_only_modlist_stops_at_the_gate() {
    let fx = fixture();
    let mut modlist = base_modlist();
    for index in 0..3 {
        modlist.archives.push(Archive {
            name: format!("manual-{index}.7z"),
            hash: hash_bytes(format!("manual {index}").as_bytes()),
            size: 100,
            state: ArchiveState::Manual {
                url: format!("https://example.com/manual/{index}"),
                prompt: Some("grab it by hand".into()),
            },
        });
    }
    let bundle = write_bundle(&fx, &modlist, &[]);

    let mut installer = installer_for(&fx, bundle, vec![], CancelToken::never()).await;
    match installer.run().await.unwrap() {
        InstallOutcome::DownloadFailed { manual, missing } => {
            assert_eq!(manual.len(), 3);
            assert!(missing.is_empty());
            assert!(manual[0].primary_key.starts_with("manual|"));
        }
        other => panic!("expected the manual gate, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_archive_without_source_fails() {
    let fx = fixture();

    // The downloads dir has a file with the right name but wrong bytes,
    // and the source cannot provide a replacement.
    std::fs::write(fx.downloads.join("data.bin").as_std(), b"corrupted!").unwrap();
    let mut modlist = base_modlist();
    modlist.archives = vec![Archive {
        name: "data.bin".into(),
        hash: hash_bytes(b"the real contents"),
        size: 17,
        state: ArchiveState::GameFile {
            game: GameType::SkyrimSpecialEdition,
            game_file: rel("Data/DoesNotExist.esm"),
            game_version: None,
        },
    }];
    let bundle = write_bundle(&fx, &modlist, &[]);

    let mut installer = installer_for(&fx, bundle, vec![], CancelToken::never()).await;
    match installer.run().await.unwrap() {
        InstallOutcome::DownloadFailed { manual, missing } => {
            assert!(manual.is_empty());
            assert_eq!(missing.len(), 1);
            assert!(missing[0].starts_with("gamefile|"));
        }
        other => panic!("expected a download failure, got {other:?}"),
    }
    // The presumed-corrupt file was deleted during recovery.
    assert!(!fx.downloads.join("data.bin").exists());
}

#[tokio::test]
async fn cancellation_returns_cancelled_and_writes_nothing() {
    let fx = fixture();
    let inline = b"contents".as_slice();
    let mut modlist = base_modlist();
    modlist.directives = vec![Directive::InlineFile {
        to: rel("mods/file.txt"),
        hash: hash_bytes(inline),
        size: inline.len() as u64,
        source_data_id: "blob-1".into(),
    }];
    let bundle = write_bundle(&fx, &modlist, &[("blob-1", inline)]);

    let (handle, token) = CancelToken::new();
    let mut installer = installer_for(&fx, bundle, vec![], token).await;
    handle.cancel();
    let outcome = installer.run().await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Cancelled));
    assert!(!fx.install.join_rel(&rel("mods/file.txt")).exists());
}

#[tokio::test]
async fn conflicting_directives_are_rejected() {
    let fx = fixture();
    let mut modlist = base_modlist();
    modlist.directives = vec![
        Directive::InlineFile {
            to: rel("mods/file.txt"),
            hash: hash_bytes(b"one"),
            size: 3,
            source_data_id: "blob-1".into(),
        },
        Directive::InlineFile {
            to: rel("Mods/File.txt"),
            hash: hash_bytes(b"two"),
            size: 3,
            source_data_id: "blob-2".into(),
        },
    ];
    let bundle = write_bundle(&fx, &modlist, &[("blob-1", b"one"), ("blob-2", b"two")]);

    let mut installer = installer_for(&fx, bundle, vec![], CancelToken::never()).await;
    let err = installer.run().await.unwrap_err();
    assert!(err.to_string().contains("different hashes"), "{err}");
}
