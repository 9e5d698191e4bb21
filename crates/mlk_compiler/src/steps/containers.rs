use crate::error::Result;
use crate::step::{CompilationStep, CompileContext, ContainerSupport, Resolution, SourceFile};
use crate::steps::member_stack;
use mlk_core::{hash_reader, Hash, RelativePath};
use mlk_recipe::{Directive, DirectiveKind, TEMP_BSA_DIR};
use mlk_vfs::{ByteSource, MemberState, SpillWriter, SNIFF_LEN};
use std::io::{BufReader, Seek, SeekFrom};

/// Takes apart an installed container (a game archive the user built or
/// repacked) and describes each member on its own.
///
/// Members are staged under `TEMP_BSA_FILES/<temp_id>/` and the container is
/// rebuilt from them at install time. This only applies when the codec can
/// rebuild the file byte for byte and every member resolves through the member
/// stack; otherwise the file falls through to later steps.
pub struct DeconstructContainers;

struct Member {
    state: MemberState,
    bytes: ByteSource,
    hash: Hash,
    size: u64,
}

impl CompilationStep for DeconstructContainers {
    fn name(&self) -> &'static str {
        "DeconstructContainers"
    }

    fn run(&self, file: &SourceFile, ctx: &CompileContext<'_>) -> Result<Option<Resolution>> {
        let header = file.bytes.header(SNIFF_LEN)?;
        let name = file.path.file_name();
        let Some(support) = ctx.containers.iter().find(|c| c.codec.can_read(&header, name)) else {
            return Ok(None);
        };

        let (state, members) = match support.codec.read_state(&file.bytes) {
            Ok(found) => found,
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => {
                tracing::debug!("{} looks like {} but cannot be read: {}", file.path, support.codec.format(), e);
                return Ok(None);
            }
        };
        let Some(extracted) = extract_members(file, support, &members, ctx)? else {
            return Ok(None);
        };
        if !rebuilds_identically(file, support, &state, &extracted, ctx)? {
            tracing::debug!("{} does not rebuild identically; leaving it whole", file.path);
            return Ok(None);
        }

        let temp_id = Hash::of(file.path.as_str().as_bytes()).to_string();
        let staging = RelativePath::new(format!("{}/{}", TEMP_BSA_DIR, temp_id))?;
        let stack = member_stack();

        let mut staged: Vec<Directive> = Vec::with_capacity(extracted.len());
        let mut data = Vec::new();
        for member in extracted {
            let member_file = SourceFile {
                path: staging.join(&member.state.path),
                hash: member.hash,
                size: member.size,
                bytes: member.bytes,
            };
            let mut resolved = None;
            for step in &stack {
                if let Some(resolution) = step.run(&member_file, ctx)? {
                    resolved = Some(resolution);
                    break;
                }
            }
            let Some(resolution) = resolved else {
                tracing::debug!(
                    "{}: member {} has no source; leaving container whole",
                    file.path,
                    member.state.path
                );
                return Ok(None);
            };
            staged.extend(resolution.staged);
            staged.push(resolution.directive);
            data.extend(resolution.data);
        }

        tracing::debug!("{} deconstructed into {} members", file.path, staged.len());
        Ok(Some(Resolution {
            directive: file.directive(DirectiveKind::CreateBsa {
                temp_id,
                state,
                file_states: members,
            }),
            data,
            staged,
        }))
    }
}

fn extract_members(
    file: &SourceFile,
    support: &ContainerSupport,
    members: &[MemberState],
    ctx: &CompileContext<'_>,
) -> Result<Option<Vec<Member>>> {
    let entries = support.reader.list_entries(&file.bytes)?;
    let threshold = ctx.vfs.settings().spill_threshold;
    let mut extracted = Vec::with_capacity(members.len());
    for state in members {
        let Some(entry) = entries.iter().find(|e| e.path == state.path) else {
            tracing::debug!("{}: member {} is not in the entry table", file.path, state.path);
            return Ok(None);
        };
        let mut sink = SpillWriter::new(entry.size, threshold, ctx.token)?;
        let size = support.reader.extract_entry(&file.bytes, entry, &mut sink)?;
        let (bytes, hash) = sink.finish()?;
        extracted.push(Member {
            state: state.clone(),
            bytes,
            hash,
            size,
        });
    }
    Ok(Some(extracted))
}

fn rebuilds_identically(
    file: &SourceFile,
    support: &ContainerSupport,
    state: &mlk_vfs::ContainerState,
    members: &[Member],
    ctx: &CompileContext<'_>,
) -> Result<bool> {
    let inputs: Vec<(MemberState, ByteSource)> = members
        .iter()
        .map(|m| (m.state.clone(), m.bytes.clone()))
        .collect();
    let mut rebuilt = tempfile::tempfile()?;
    if let Err(e) = support.codec.build(state, &inputs, &mut rebuilt) {
        tracing::debug!("Rebuilding {} failed: {}", file.path, e);
        return Ok(false);
    }
    rebuilt.seek(SeekFrom::Start(0))?;
    Ok(hash_reader(BufReader::new(rebuilt), ctx.token, None)? == file.hash)
}
