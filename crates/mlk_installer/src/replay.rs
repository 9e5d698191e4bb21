//! Replaying one directive.
//!
//! Each directive walks `Pending -> Resolving -> Reconstructing -> Verifying`
//! and ends `Written` or `Failed`. Output is staged in a temporary file next to
//! its destination and only moved into place once verified, so a failed or
//! cancelled directive never leaves a partial file behind.

use crate::error::{Error, Result};
use crate::settings::InstallerSettings;
use camino::{Utf8Path, Utf8PathBuf};
use mlk_core::fs::stage_in;
use mlk_core::{copy_hashed, hash_reader, CancellationToken, ContentHasher, Hash};
use mlk_patch::BinaryPatchCache;
use mlk_recipe::{Directive, DirectiveKind, RecipePackage, RemapRoots, SourcePatch, TEMP_BSA_DIR};
use mlk_vfs::{ByteSource, ContainerCodec, ContainerState, Context, MemberState};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Where a directive is in its replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DirectiveState {
    Pending,
    /// Locating source bytes: VFS lookups, package data, staged members.
    Resolving,
    /// Copying, patching, transforming or assembling.
    Reconstructing,
    /// Checking the staged output against the recorded hash or size.
    Verifying,
    Written,
    Failed,
}

/// Shared state of one install run.
pub(crate) struct ReplayContext<'a> {
    pub settings: &'a InstallerSettings,
    pub package: &'a RecipePackage,
    pub vfs: &'a Context,
    pub patches: &'a BinaryPatchCache,
    pub codecs: &'a [Arc<dyn ContainerCodec>],
    pub remap: RemapRoots,
    pub token: &'a CancellationToken,
}

impl ReplayContext<'_> {
    fn destination(&self, directive: &Directive) -> Utf8PathBuf {
        directive.to.to_path(&self.settings.install_dir)
    }
}

/// Replay `directive` and move its output into place.
pub(crate) fn replay(directive: &Directive, ctx: &ReplayContext<'_>) -> Result<()> {
    let mut replay = Replay {
        directive,
        state: DirectiveState::Pending,
    };
    let result = replay.run(ctx);
    replay.enter(if result.is_ok() {
        DirectiveState::Written
    } else {
        DirectiveState::Failed
    });
    result
}

struct Replay<'d> {
    directive: &'d Directive,
    state: DirectiveState,
}

/// A reconstructed file waiting for verification.
struct Staged {
    file: NamedTempFile,
    hash: Hash,
    size: u64,
}

impl Replay<'_> {
    fn enter(&mut self, next: DirectiveState) {
        tracing::trace!("{}: {:?} -> {:?}", self.directive.to, self.state, next);
        self.state = next;
    }

    fn run(&mut self, ctx: &ReplayContext<'_>) -> Result<()> {
        ctx.token.check()?;
        let dest = ctx.destination(self.directive);
        let staged = self.reconstruct(&dest, ctx)?;

        self.enter(DirectiveState::Verifying);
        self.verify(&staged)?;
        ctx.token.check()?;

        staged
            .file
            .persist(dest.as_std_path())
            .map_err(|e| Error::IoFault {
                path: dest.clone(),
                source: e.error,
            })?;
        tracing::debug!("Wrote {} ({})", self.directive.to, self.directive.type_name());
        Ok(())
    }

    fn reconstruct(&mut self, dest: &Utf8Path, ctx: &ReplayContext<'_>) -> Result<Staged> {
        let directive = self.directive;
        match &directive.kind {
            DirectiveKind::FromArchive { archive_hash_path } => {
                self.enter(DirectiveState::Resolving);
                let source = ctx.vfs.resolve_source(archive_hash_path, ctx.token)?;
                self.enter(DirectiveState::Reconstructing);
                let reader = source.open()?;
                stage_with(dest, |out| {
                    copy_hashed(reader, out, ctx.token, None, directive.size)?;
                    Ok(())
                })
            }
            DirectiveKind::PatchedFromArchive {
                archive_hash_path,
                from_hash,
                patch_id,
            } => {
                self.enter(DirectiveState::Resolving);
                let source = ctx.vfs.resolve_bytes(archive_hash_path, ctx.token)?;
                expect_hash(*from_hash, &source)?;
                let delta = ctx.package.data(patch_id)?;
                self.enter(DirectiveState::Reconstructing);
                let bytes = ctx.patches.apply_patch(&source, &delta)?;
                stage_bytes(dest, &bytes)
            }
            DirectiveKind::TransformedTexture {
                archive_hash_path,
                image_state,
            } => {
                let analyzer = ctx.vfs.image_analyzer().ok_or(Error::NoImageAnalyzer)?;
                self.enter(DirectiveState::Resolving);
                let source = ctx.vfs.resolve_source(archive_hash_path, ctx.token)?;
                self.enter(DirectiveState::Reconstructing);
                stage_with(dest, |out| Ok(analyzer.transform(&source, image_state, out)?))
            }
            DirectiveKind::InlineFile { source_data_id } => {
                self.enter(DirectiveState::Resolving);
                let bytes = ctx.package.data(source_data_id)?;
                self.enter(DirectiveState::Reconstructing);
                stage_bytes(dest, &bytes)
            }
            DirectiveKind::RemappedInlineFile { source_data_id } => {
                self.enter(DirectiveState::Resolving);
                let bytes = ctx.package.data(source_data_id)?;
                self.enter(DirectiveState::Reconstructing);
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
                stage_bytes(dest, ctx.remap.expand(&text).as_bytes())
            }
            DirectiveKind::MergedPatch { sources, patch_id } => {
                self.enter(DirectiveState::Resolving);
                let joined = read_merge_sources(sources, ctx)?;
                let delta = ctx.package.data(patch_id)?;
                self.enter(DirectiveState::Reconstructing);
                let bytes = ctx.patches.apply_patch(&joined, &delta)?;
                stage_bytes(dest, &bytes)
            }
            DirectiveKind::CreateBsa {
                temp_id,
                state,
                file_states,
            } => {
                self.enter(DirectiveState::Resolving);
                let codec = ctx
                    .codecs
                    .iter()
                    .find(|c| c.format() == state.format)
                    .ok_or_else(|| Error::NoCodec(state.format.clone()))?;
                let members = staged_members(temp_id, file_states, ctx)?;
                self.enter(DirectiveState::Reconstructing);
                build_container(dest, codec.as_ref(), state, &members, ctx.token)
            }
            DirectiveKind::NoMatch { .. }
            | DirectiveKind::IgnoredDirectly { .. }
            | DirectiveKind::Unknown { .. } => Err(Error::Recipe(mlk_recipe::Error::InvalidRecipe(
                format!("{} directives cannot be installed", directive.type_name()),
            ))),
        }
    }

    fn verify(&self, staged: &Staged) -> Result<()> {
        let directive = self.directive;
        if directive.is_deterministic() {
            if staged.hash != directive.hash {
                return Err(Error::HashMismatch {
                    expected: directive.hash,
                    actual: staged.hash,
                });
            }
        } else if matches!(directive.kind, DirectiveKind::TransformedTexture { .. })
            && staged.size != directive.size
        {
            return Err(Error::SizeMismatch {
                expected: directive.size,
                actual: staged.size,
            });
        }
        Ok(())
    }
}

fn expect_hash(expected: Hash, bytes: &[u8]) -> Result<()> {
    let actual = Hash::of(bytes);
    if actual != expected {
        return Err(Error::HashMismatch { expected, actual });
    }
    Ok(())
}

fn read_merge_sources(sources: &[SourcePatch], ctx: &ReplayContext<'_>) -> Result<Vec<u8>> {
    let mut joined = Vec::new();
    for source in sources {
        ctx.token.check()?;
        let path = source.relative_path.to_path(&ctx.settings.install_dir);
        let bytes = match std::fs::read(path.as_std_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::MissingDependency(source.relative_path.to_string()));
            }
            Err(e) => return Err(Error::IoFault { path, source: e }),
        };
        expect_hash(source.hash, &bytes)?;
        joined.extend_from_slice(&bytes);
    }
    Ok(joined)
}

fn staged_members(
    temp_id: &str,
    file_states: &[MemberState],
    ctx: &ReplayContext<'_>,
) -> Result<Vec<(MemberState, ByteSource)>> {
    let staging = ctx.settings.install_dir.join(TEMP_BSA_DIR).join(temp_id);
    file_states
        .iter()
        .map(|member| {
            let path = member.path.to_path(&staging);
            if !path.is_file() {
                return Err(Error::MissingDependency(format!(
                    "{}/{}/{}",
                    TEMP_BSA_DIR, temp_id, member.path
                )));
            }
            Ok((member.clone(), ByteSource::file(path)))
        })
        .collect()
}

fn build_container(
    dest: &Utf8Path,
    codec: &dyn ContainerCodec,
    state: &ContainerState,
    members: &[(MemberState, ByteSource)],
    token: &CancellationToken,
) -> Result<Staged> {
    let mut file = stage_in(dest)?;
    codec.build(state, members, file.as_file_mut())?;
    let out = file.as_file_mut();
    out.flush()?;
    let size = out.seek(SeekFrom::End(0))?;
    out.seek(SeekFrom::Start(0))?;
    let hash = hash_reader(BufReader::new(&*out), token, None)?;
    Ok(Staged { file, hash, size })
}

fn stage_bytes(dest: &Utf8Path, bytes: &[u8]) -> Result<Staged> {
    stage_with(dest, |out| Ok(out.write_all(bytes)?))
}

/// Run `write` against a hashing writer over a temp file next to `dest`.
fn stage_with<F>(dest: &Utf8Path, write: F) -> Result<Staged>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let file = stage_in(dest)?;
    let mut out = HashingWriter {
        inner: BufWriter::new(file),
        hasher: ContentHasher::new(),
        written: 0,
    };
    write(&mut out)?;
    out.flush()?;
    let file = out.inner.into_inner().map_err(|e| e.into_error())?;
    Ok(Staged {
        file,
        hash: out.hasher.finish(),
        size: out.written,
    })
}

struct HashingWriter<W> {
    inner: W,
    hasher: ContentHasher,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlk_core::RelativePath;
    use mlk_recipe::{inline_data_id, PackageBuilder, Recipe};
    use mlk_vfs::{FileHashCache, VfsCache, VfsSettings};

    struct Setup {
        _dir: tempfile::TempDir,
        settings: InstallerSettings,
        package: RecipePackage,
        vfs: Context,
        patches: BinaryPatchCache,
    }

    fn setup(directives: Vec<Directive>, data: Vec<(String, Vec<u8>)>) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut recipe = Recipe::new("Replay", "skyrimse");
        recipe.directives = directives;
        let mut builder = PackageBuilder::new(recipe);
        for (id, bytes) in data {
            builder.add_data(id, bytes);
        }
        builder.write(&root.join("list.mlk")).unwrap();

        let vfs = Context::new(
            Arc::new(VfsCache::open(root.join("cache/vfs")).unwrap()),
            Arc::new(FileHashCache::in_memory()),
            VfsSettings::default(),
        )
        .unwrap();
        Setup {
            settings: InstallerSettings::new(root.join("list.mlk"), root.join("install"), root.join("downloads")),
            package: RecipePackage::open(root.join("list.mlk")).unwrap(),
            vfs,
            patches: BinaryPatchCache::open(root.join("cache/patches")).unwrap(),
            _dir: dir,
        }
    }

    impl Setup {
        fn ctx<'a>(&'a self, token: &'a CancellationToken) -> ReplayContext<'a> {
            ReplayContext {
                settings: &self.settings,
                package: &self.package,
                vfs: &self.vfs,
                patches: &self.patches,
                codecs: &[],
                remap: RemapRoots::new(None, Some(self.settings.install_dir.as_path()), None),
                token,
            }
        }
    }

    fn inline(to: &str, bytes: &[u8]) -> (Directive, (String, Vec<u8>)) {
        let hash = Hash::of(bytes);
        let id = inline_data_id(hash);
        (
            Directive::new(
                RelativePath::new(to).unwrap(),
                hash,
                bytes.len() as u64,
                DirectiveKind::InlineFile {
                    source_data_id: id.clone(),
                },
            ),
            (id, bytes.to_vec()),
        )
    }

    #[test]
    fn test_inline_is_written() {
        let (directive, data) = inline("mods/a/readme.txt", b"hello");
        let s = setup(vec![directive.clone()], vec![data]);
        let token = CancellationToken::new();

        replay(&directive, &s.ctx(&token)).unwrap();
        let written = std::fs::read(s.settings.install_dir.join("mods/a/readme.txt")).unwrap();
        assert_eq!(written, b"hello");
    }

    #[test]
    fn test_hash_mismatch_leaves_no_file() {
        let (mut directive, data) = inline("mods/a/readme.txt", b"hello");
        directive.hash = Hash(1);
        let s = setup(vec![], vec![data]);
        let token = CancellationToken::new();

        let err = replay(&directive, &s.ctx(&token)).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        let dir = s.settings.install_dir.join("mods/a");
        assert_eq!(std::fs::read_dir(dir.as_std_path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remapped_config_is_expanded() {
        let text = b"path={--||MO2_PATH_MAGIC_FORWARD||--}/mods";
        let id = inline_data_id(Hash::of(text));
        let directive = Directive::new(
            RelativePath::new("profiles/Default/settings.ini").unwrap(),
            Hash(42),
            0,
            DirectiveKind::RemappedInlineFile {
                source_data_id: id.clone(),
            },
        );
        let s = setup(vec![directive.clone()], vec![(id, text.to_vec())]);
        let token = CancellationToken::new();

        replay(&directive, &s.ctx(&token)).unwrap();
        let written =
            std::fs::read_to_string(s.settings.install_dir.join("profiles/Default/settings.ini")).unwrap();
        assert_eq!(written, format!("path={}/mods", s.settings.install_dir));
    }

    #[test]
    fn test_merge_with_missing_source() {
        let directive = Directive::new(
            RelativePath::new("merged.esp").unwrap(),
            Hash(1),
            1,
            DirectiveKind::MergedPatch {
                sources: vec![SourcePatch {
                    relative_path: RelativePath::new("a.esp").unwrap(),
                    hash: Hash(2),
                }],
                patch_id: "patch-0000000000000002-0000000000000001".to_string(),
            },
        );
        let s = setup(vec![], vec![]);
        let token = CancellationToken::new();

        let err = replay(&directive, &s.ctx(&token)).unwrap_err();
        assert!(matches!(err, Error::MissingDependency(ref p) if p == "a.esp"));
    }

    #[test]
    fn test_container_without_codec() {
        let directive = Directive::new(
            RelativePath::new("Data/pack.bsa").unwrap(),
            Hash(1),
            1,
            DirectiveKind::CreateBsa {
                temp_id: "0000000000000001".to_string(),
                state: ContainerState {
                    format: "bsa".to_string(),
                    options: serde_json::Value::Null,
                },
                file_states: Vec::new(),
            },
        );
        let s = setup(vec![], vec![]);
        let token = CancellationToken::new();

        let err = replay(&directive, &s.ctx(&token)).unwrap_err();
        assert!(matches!(err, Error::NoCodec(ref f) if f == "bsa"));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (directive, data) = inline("a.txt", b"a");
        let s = setup(vec![directive.clone()], vec![data]);
        let token = CancellationToken::new();
        token.cancel();

        assert!(replay(&directive, &s.ctx(&token)).unwrap_err().is_cancelled());
        assert!(!s.settings.install_dir.join("a.txt").exists());
    }
}
