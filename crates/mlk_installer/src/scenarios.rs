//! Compile a setup, then install it somewhere else and compare.

use crate::{FailureKind, InstallReport, Installer, InstallerSettings, LocalMirrorDownloader};
use camino::Utf8PathBuf;
use mlk_compiler::{CompileReport, Compiler, CompilerSettings, MergeSpec};
use mlk_core::{CancellationToken, Hash, RelativePath};
use mlk_patch::BinaryPatchCache;
use mlk_recipe::{DirectiveKind, RecipePackage, TEMP_BSA_DIR};
use mlk_vfs::{ByteSource, Context, FileHashCache, ImageAnalyzer, ImageState, VfsCache, VfsSettings};
use std::io::{Cursor, Write};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let time = DateTime::from_date_and_time(2021, 6, 7, 8, 9, 10).unwrap();
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(time);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// A source setup with its archive pool, and an empty place to install to.
struct Lab {
    dir: tempfile::TempDir,
    source: Utf8PathBuf,
    pool: Utf8PathBuf,
    restore: Utf8PathBuf,
    downloads: Utf8PathBuf,
    package: Utf8PathBuf,
}

impl Lab {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let lab = Self {
            source: root.join("source"),
            pool: root.join("pool"),
            restore: root.join("restore"),
            downloads: root.join("downloads"),
            package: root.join("list.mlk"),
            dir,
        };
        std::fs::create_dir_all(&lab.source).unwrap();
        std::fs::create_dir_all(&lab.pool).unwrap();
        lab
    }

    fn root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().to_path_buf()).unwrap()
    }

    fn archive(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.pool.join(name), bytes).unwrap();
        let state = serde_json::json!({"$type": "LocalMirror", "fileName": name});
        std::fs::write(
            self.pool.join(format!("{}.meta", name)),
            serde_json::to_vec(&state).unwrap(),
        )
        .unwrap();
    }

    fn installed(&self, path: &str, bytes: &[u8]) {
        let full = self.source.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, bytes).unwrap();
    }

    fn restored(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.restore.join(path)).unwrap_or_else(|e| panic!("{} missing: {}", path, e))
    }

    fn vfs(&self, name: &str, analyzer: Option<Arc<dyn ImageAnalyzer>>) -> Arc<Context> {
        let cache = Arc::new(VfsCache::open(self.root().join("cache").join(name)).unwrap());
        let mut vfs = Context::new(
            cache,
            Arc::new(FileHashCache::in_memory()),
            VfsSettings {
                workers: 2,
                ..VfsSettings::default()
            },
        )
        .unwrap();
        if let Some(analyzer) = analyzer {
            vfs = vfs.with_image_analyzer(analyzer);
        }
        Arc::new(vfs)
    }

    fn patches(&self, name: &str) -> Arc<BinaryPatchCache> {
        Arc::new(BinaryPatchCache::open(self.root().join("cache").join(name)).unwrap())
    }

    fn compile_with(
        &self,
        tweak: impl FnOnce(&mut CompilerSettings),
        analyzer: Option<Arc<dyn ImageAnalyzer>>,
    ) -> CompileReport {
        let mut settings = CompilerSettings {
            source_dir: self.source.clone(),
            downloads_dir: self.pool.clone(),
            output: self.package.clone(),
            game: "skyrimse".to_string(),
            name: "Scenario".to_string(),
            max_inline_size: 64,
            workers: 2,
            ..CompilerSettings::default()
        };
        tweak(&mut settings);
        let report = Compiler::new(settings, self.vfs("compile", analyzer), self.patches("compile_patches"))
            .compile(&CancellationToken::new())
            .unwrap();
        assert!(report.success, "compile failed: {:?}", report.no_matches);
        report
    }

    fn compile(&self) -> CompileReport {
        self.compile_with(|_| {}, None)
    }

    fn installer(&self, analyzer: Option<Arc<dyn ImageAnalyzer>>) -> Installer {
        let mut settings = InstallerSettings::new(&self.package, &self.restore, &self.downloads);
        settings.workers = 2;
        Installer::new(settings, self.vfs("install", analyzer), self.patches("install_patches"))
            .with_downloader(Arc::new(LocalMirrorDownloader::new([self.pool.clone()])))
    }

    fn install(&self) -> InstallReport {
        self.installer(None).install(&CancellationToken::new()).unwrap()
    }
}

#[test]
fn test_round_trip_direct_nested_inline_and_patched() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let lab = Lab::new();
    let plugin = noise(1, 4096);
    let texture = noise(2, 2048);
    let original = noise(3, 32 * 1024);
    let mut edited = original.clone();
    edited[10_000..10_008].copy_from_slice(b"override");
    let inner = make_zip(&[("textures/rock.dds", &texture)]);
    lab.archive(
        "RockMod-1-0.zip",
        &make_zip(&[
            ("Data/rock.esp", &plugin),
            ("extras/inner.zip", &inner),
            ("plugin_v1.esp", &original),
        ]),
    );

    lab.installed("mods/RockMod/rock.esp", &plugin);
    lab.installed("mods/RockMod/textures/rock.dds", &texture);
    lab.installed("mods/RockMod/plugin_v1.esp", &edited);
    lab.installed("mods/RockMod/notes.md", b"my notes");
    lab.compile();

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(report.written, 4);
    assert_eq!(report.downloaded, vec!["RockMod-1-0.zip".to_string()]);
    assert!(lab.downloads.join("RockMod-1-0.zip").is_file());

    assert_eq!(lab.restored("mods/RockMod/rock.esp"), plugin);
    assert_eq!(lab.restored("mods/RockMod/textures/rock.dds"), texture);
    assert_eq!(lab.restored("mods/RockMod/plugin_v1.esp"), edited);
    assert_eq!(lab.restored("mods/RockMod/notes.md"), b"my notes");
}

#[test]
fn test_texture_found_in_archive_is_copied() {
    let lab = Lab::new();
    let texture = noise(20, 3000);
    let archive = make_zip(&[("texture.dds", &texture)]);
    lab.archive("A.zip", &archive);
    lab.installed("textures/t1.dds", &texture);
    lab.compile();

    let package = RecipePackage::open(&lab.package).unwrap();
    let directive = &package.recipe().directives[0];
    assert_eq!(directive.to.as_str(), "textures/t1.dds");
    assert_eq!(directive.hash, Hash::of(&texture));
    match &directive.kind {
        DirectiveKind::FromArchive { archive_hash_path } => {
            assert_eq!(archive_hash_path.hash, Hash::of(&archive));
            assert_eq!(archive_hash_path.parts.len(), 1);
            assert_eq!(archive_hash_path.parts[0].as_str(), "texture.dds");
        }
        other => panic!("unexpected {:?}", other),
    }
    drop(package);

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(Hash::of(&lab.restored("textures/t1.dds")), Hash::of(&texture));
}

#[test]
fn test_edited_plugin_is_patched_from_older_version() {
    let lab = Lab::new();
    let v1 = noise(21, 48 * 1024);
    let mut installed = v1.clone();
    installed[20_000..20_010].copy_from_slice(b"new record");
    installed.extend_from_slice(b"appended tail");
    lab.archive("B.zip", &make_zip(&[("plugin_v1.esp", &v1)]));
    lab.installed("mods/B/plugin.esp", &installed);
    lab.compile();

    let package = RecipePackage::open(&lab.package).unwrap();
    let directive = &package.recipe().directives[0];
    let DirectiveKind::PatchedFromArchive {
        archive_hash_path,
        from_hash,
        patch_id,
    } = &directive.kind
    else {
        panic!("unexpected {:?}", directive.kind);
    };
    assert_eq!(archive_hash_path.parts[0].as_str(), "plugin_v1.esp");
    assert_eq!(*from_hash, Hash::of(&v1));

    let delta = package.data(patch_id).unwrap();
    let rebuilt = lab.patches("verify").apply_patch(&v1, &delta).unwrap();
    assert_eq!(Hash::of(&rebuilt), Hash::of(&installed));
    drop(package);

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(lab.restored("mods/B/plugin.esp"), installed);
}

#[test]
fn test_merged_plugin_is_rebuilt_after_its_sources() {
    let lab = Lab::new();
    let a = noise(4, 8 * 1024);
    let b = noise(5, 8 * 1024);
    lab.archive("Parts.zip", &make_zip(&[("a.esp", &a), ("b.esp", &b)]));
    lab.installed("mods/Parts/a.esp", &a);
    lab.installed("mods/Parts/b.esp", &b);
    let mut merged = [a.clone(), b.clone()].concat();
    merged[200] ^= 0x5a;
    lab.installed("mods/Merged/merged.esp", &merged);

    lab.compile_with(
        |s| {
            s.merges.push(MergeSpec {
                to: RelativePath::new("mods/Merged/merged.esp").unwrap(),
                sources: vec![
                    RelativePath::new("mods/Parts/a.esp").unwrap(),
                    RelativePath::new("mods/Parts/b.esp").unwrap(),
                ],
            })
        },
        None,
    );

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(lab.restored("mods/Merged/merged.esp"), merged);
}

#[test]
fn test_corrupt_download_fails_only_its_directives() {
    let lab = Lab::new();
    let good = noise(6, 1024);
    let bad = noise(7, 1024);
    lab.archive("Good.zip", &make_zip(&[("good.esp", &good)]));
    lab.archive("Bad.zip", &make_zip(&[("bad.esp", &bad)]));
    lab.installed("mods/Good/good.esp", &good);
    lab.installed("mods/Bad/bad.esp", &bad);
    lab.compile();

    // The mirror now serves different bytes under the same name.
    std::fs::write(lab.pool.join("Bad.zip"), make_zip(&[("bad.esp", &noise(8, 1024))])).unwrap();

    let report = lab.install();
    assert!(!report.success);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].to.as_str(), "mods/Bad/bad.esp");
    assert_eq!(report.failures[0].kind, FailureKind::MissingArchive);
    assert!(report.failures[0].reason.contains("Bad.zip"));

    assert_eq!(lab.restored("mods/Good/good.esp"), good);
    assert!(!lab.restore.join("mods/Bad/bad.esp").exists());
    assert!(!lab.downloads.join("Bad.zip").exists());
}

#[test]
fn test_deconstructed_container_is_rebuilt_identically() {
    let lab = Lab::new();
    let mesh = noise(9, 3000);
    let texture = noise(10, 5000);
    let packed = make_zip(&[("meshes/a.nif", &mesh), ("textures/b.dds", &texture)]);
    lab.archive("Meshes.zip", &make_zip(&[("meshes/a.nif", &mesh)]));
    lab.archive("Textures.zip", &make_zip(&[("textures/b.dds", &texture)]));
    lab.installed("mods/Packed/packed.zip", &packed);

    let compiled = lab.compile();
    assert_eq!(compiled.by_type.get("CreateBSA"), Some(&1));

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(report.written, 1);
    assert_eq!(lab.restored("mods/Packed/packed.zip"), packed);
    assert!(!lab.restore.join(TEMP_BSA_DIR).exists());
}

#[test]
fn test_existing_outputs_are_skipped() {
    let lab = Lab::new();
    let a = noise(11, 2048);
    let b = noise(12, 2048);
    lab.archive("Two.zip", &make_zip(&[("a.esp", &a), ("b.esp", &b)]));
    lab.installed("mods/Two/a.esp", &a);
    lab.installed("mods/Two/b.esp", &b);
    lab.compile();

    let first = lab.install();
    assert!(first.success);
    assert_eq!((first.written, first.skipped), (2, 0));

    std::fs::write(lab.restore.join("mods/Two/b.esp"), b"tampered").unwrap();
    let second = lab.install();
    assert!(second.success, "{:?}", second.failures);
    assert_eq!((second.written, second.skipped), (1, 1));
    assert!(second.downloaded.is_empty());
    assert_eq!(lab.restored("mods/Two/b.esp"), b);
}

#[test]
fn test_reinstall_removes_files_not_in_the_list() {
    let lab = Lab::new();
    let a = noise(30, 2048);
    lab.archive("Keep.zip", &make_zip(&[("a.esp", &a)]));
    lab.installed("mods/Keep/a.esp", &a);
    lab.compile();
    assert!(lab.install().success);

    let extra = |path: &str| {
        let full = lab.restore.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, b"left over").unwrap();
    };
    extra("mods/Old/stale.esp");
    extra("mods/Keep/readme.txt");
    extra("profiles/Default/saves/quick.ess");
    extra("mods/[NoDelete] Notes/todo.txt");

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    let removed: Vec<&str> = report.removed.iter().map(|p| p.as_str()).collect();
    assert_eq!(removed, vec!["mods/Keep/readme.txt", "mods/Old/stale.esp"]);
    assert_eq!(report.skipped, 1);
    assert!(!lab.restore.join("mods/Old").exists());
    assert!(lab.restore.join("profiles/Default/saves/quick.ess").is_file());
    assert!(lab.restore.join("mods/[NoDelete] Notes/todo.txt").is_file());
    assert_eq!(lab.restored("mods/Keep/a.esp"), a);
    assert!(lab.downloads.join("Keep.zip").is_file());

    extra("mods/Old/stale.esp");
    let mut settings = InstallerSettings::new(&lab.package, &lab.restore, &lab.downloads);
    settings.remove_stale = false;
    let report = Installer::new(settings, lab.vfs("install", None), lab.patches("install_patches"))
        .install(&CancellationToken::new())
        .unwrap();
    assert!(report.success, "{:?}", report.failures);
    assert!(report.removed.is_empty());
    assert!(lab.restore.join("mods/Old/stale.esp").is_file());
}

#[test]
fn test_install_downloads_can_be_compiled_again() {
    let lab = Lab::new();
    let plugin = noise(31, 4096);
    let v1 = noise(32, 32 * 1024);
    let mut edited = v1.clone();
    edited[5_000..5_010].copy_from_slice(b"new record");
    lab.archive("Base-1-0.zip", &make_zip(&[("base.esp", &plugin), ("plugin_v1.esp", &v1)]));
    lab.installed("mods/Base/base.esp", &plugin);
    lab.installed("mods/Base/plugin_v1.esp", &edited);
    lab.compile();
    let original = RecipePackage::open(&lab.package).unwrap().recipe().clone();

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    let meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(lab.downloads.join("Base-1-0.zip.meta")).unwrap()).unwrap();
    assert_eq!(meta, original.archives[0].state);

    let again = lab.root().join("again.mlk");
    let restore = lab.restore.clone();
    let downloads = lab.downloads.clone();
    let recompiled = lab.compile_with(
        |s| {
            s.source_dir = restore;
            s.downloads_dir = downloads;
            s.output = again.clone();
        },
        None,
    );
    assert!(recompiled.pool_failures.is_empty());

    let package = RecipePackage::open(&again).unwrap();
    let recipe = package.recipe();
    assert_eq!(recipe.archives, original.archives);
    assert_eq!(recipe.directives.len(), original.directives.len());
    for directive in &original.directives {
        let twin = recipe.directives.iter().find(|d| d.to == directive.to).unwrap();
        assert_eq!((twin.hash, twin.type_name()), (directive.hash, directive.type_name()));
    }
}

#[test]
fn test_remapped_config_points_at_new_install() {
    let lab = Lab::new();
    let ini = format!("[Paths]\nOverwrite={}/overwrite\n", lab.source);
    lab.installed("ModOrganizer.ini", ini.as_bytes());
    lab.compile();

    let report = lab.install();
    assert!(report.success, "{:?}", report.failures);
    let restored = String::from_utf8(lab.restored("ModOrganizer.ini")).unwrap();
    assert_eq!(restored, format!("[Paths]\nOverwrite={}/overwrite\n", lab.restore));
}

/// Reads `IMG ` + width + height + 2 pad bytes + 4 fingerprint bytes + 16 bytes
/// of pixels per unit of width.
struct HeaderAnalyzer;

impl ImageAnalyzer for HeaderAnalyzer {
    fn analyze(&self, source: &ByteSource) -> mlk_vfs::Result<Option<ImageState>> {
        let bytes = source.read_all()?;
        if bytes.len() < 12 || &bytes[..4] != b"IMG " {
            return Ok(None);
        }
        Ok(Some(ImageState {
            width: bytes[4] as u32,
            height: bytes[5] as u32,
            mip_levels: 1,
            format: "raw".to_string(),
            perceptual_hash: bytes[8..12].to_vec(),
        }))
    }

    fn similarity(&self, a: &ImageState, b: &ImageState) -> f32 {
        let same = a
            .perceptual_hash
            .iter()
            .zip(&b.perceptual_hash)
            .filter(|(x, y)| x == y)
            .count();
        same as f32 / a.perceptual_hash.len().max(1) as f32
    }

    fn transform(&self, source: &ByteSource, target: &ImageState, out: &mut dyn Write) -> mlk_vfs::Result<()> {
        let bytes = source.read_all()?;
        let pixels = target.width as usize * 16;
        out.write_all(b"IMG ")?;
        out.write_all(&[target.width as u8, target.height as u8, 0, 0])?;
        out.write_all(&target.perceptual_hash)?;
        out.write_all(&bytes[12..12 + pixels])?;
        Ok(())
    }
}

fn image(size: u8, fingerprint: [u8; 4], seed: u64) -> Vec<u8> {
    let mut bytes = b"IMG ".to_vec();
    bytes.extend_from_slice(&[size, size, 0, 0]);
    bytes.extend_from_slice(&fingerprint);
    bytes.extend(noise(seed, size as usize * 16));
    bytes
}

#[test]
fn test_texture_is_transformed_to_recorded_size() {
    let lab = Lab::new();
    lab.archive("Rocks.zip", &make_zip(&[("textures/rock.dds", &image(64, [1, 2, 3, 4], 13))]));
    lab.installed("mods/Rocks/textures/rock.dds", &image(32, [1, 2, 3, 4], 14));
    lab.compile_with(|_| {}, Some(Arc::new(HeaderAnalyzer)));

    let package = RecipePackage::open(&lab.package).unwrap();
    assert!(matches!(
        package.recipe().directives[0].kind,
        DirectiveKind::TransformedTexture { .. }
    ));
    drop(package);

    let without = lab.installer(None).install(&CancellationToken::new()).unwrap();
    assert!(!without.success);
    assert!(without.failures[0].reason.contains("image analyzer"));

    let report = lab
        .installer(Some(Arc::new(HeaderAnalyzer)))
        .install(&CancellationToken::new())
        .unwrap();
    assert!(report.success, "{:?}", report.failures);
    let rebuilt = lab.restored("mods/Rocks/textures/rock.dds");
    assert_eq!(rebuilt.len(), 12 + 32 * 16);
    assert_eq!(&rebuilt[4..6], &[32, 32]);
}

#[test]
fn test_cancelled_install() {
    let lab = Lab::new();
    let a = noise(15, 512);
    lab.archive("A.zip", &make_zip(&[("a.esp", &a)]));
    lab.installed("mods/A/a.esp", &a);
    lab.compile();

    let token = CancellationToken::new();
    token.cancel();
    let err = lab.installer(None).install(&token).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!lab.restore.join("mods/A/a.esp").exists());
}
