// Layer materialisation: expands a layer descriptor into a tar archive that
// can be extracted at the container root.
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use globset::Glob;
use sandrun_common::layer::{Layer, PrefixOptions};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One file selected by a glob layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub source: PathBuf,
    /// Absolute path inside the container
    pub destination: PathBuf,
}

/// Build the tar archive for a layer. Blocking; run it off the async runtime.
pub fn build_archive(layer: &Layer, project_dir: &Path) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());

    match layer {
        Layer::Glob { pattern, prefix_options } => {
            builder.follow_symlinks(prefix_options.follow_symlinks);
            let entries = expand_glob(pattern, prefix_options, project_dir)?;
            debug!(pattern = %pattern, files = entries.len(), "Expanded glob layer");
            for entry in entries {
                let name = archive_name(&entry.destination)?;
                builder
                    .append_path_with_name(&entry.source, &name)
                    .with_context(|| format!("Failed to archive {}", entry.source.display()))?;
            }
        }
        Layer::Stubs { stubs } => {
            for stub in stubs {
                append_stub(&mut builder, stub)?;
            }
        }
    }

    let data = builder.into_inner().context("Failed to finish layer archive")?;
    Ok(Bytes::from(data))
}

/// Expand `pattern` against the files under `project_dir`, in sorted order
pub fn expand_glob(
    pattern: &str,
    options: &PrefixOptions,
    project_dir: &Path,
) -> Result<Vec<LayerEntry>> {
    let matcher = Glob::new(pattern)
        .with_context(|| format!("Invalid glob pattern: {}", pattern))?
        .compile_matcher();

    let root = if options.canonicalize {
        fs::canonicalize(project_dir)
            .with_context(|| format!("Failed to canonicalize {}", project_dir.display()))?
    } else {
        project_dir.to_path_buf()
    };

    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let walker = WalkDir::new(project_dir)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name();

    for dirent in walker {
        let dirent = dirent.with_context(|| format!("Failed to walk {}", project_dir.display()))?;
        let file_type = dirent.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        let source = if options.canonicalize {
            match fs::canonicalize(dirent.path()) {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %dirent.path().display(), error = %e, "Skipping unresolvable path");
                    continue;
                }
            }
        } else {
            dirent.path().to_path_buf()
        };

        let relative = source.strip_prefix(&root).unwrap_or(&source);
        let Some(relative) = relative.to_str() else {
            warn!(path = %source.display(), "Skipping non UTF-8 path");
            continue;
        };

        // A link and its target canonicalize to the same source
        if matcher.is_match(relative) && seen.insert(source.clone()) {
            entries.push(LayerEntry {
                destination: options.remap(relative),
                source,
            });
        }
    }

    Ok(entries)
}

fn append_stub<W: std::io::Write>(builder: &mut tar::Builder<W>, stub: &str) -> Result<()> {
    let is_dir = stub.ends_with('/');
    let name = archive_name(Path::new(stub))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mtime(0);
    if is_dir {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(if name == Path::new("tmp") { 0o1777 } else { 0o755 });
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o666);
    }
    header.set_cksum();

    builder
        .append_data(&mut header, &name, std::io::empty())
        .with_context(|| format!("Failed to archive stub {}", stub))
}

/// Archive members are relative to the container root
fn archive_name(destination: &Path) -> Result<PathBuf> {
    let name: PathBuf = destination
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if name.as_os_str().is_empty() {
        bail!("Layer path resolves to the container root: {}", destination.display());
    }
    if destination.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("Layer path escapes the container root: {}", destination.display());
    }
    Ok(name)
}
