// Tar streams exchanged with the sandbox.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use super::FileEntry;

const DIRECTORY_MODE: u32 = 0o755;

/// Build a tar holding `files`, with a directory entry for every parent.
pub fn build_files(files: &[FileEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut dirs = BTreeSet::new();

    for file in files {
        let name = file.name.trim_start_matches('/');
        let mut parent = Path::new(name).parent();
        let mut chain = Vec::new();
        while let Some(dir) = parent.filter(|p| !p.as_os_str().is_empty()) {
            chain.push(dir.to_path_buf());
            parent = dir.parent();
        }
        for dir in chain.into_iter().rev() {
            if dirs.insert(dir.clone()) {
                append_dir(&mut builder, &dir)?;
            }
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(file.mode);
        header.set_size(file.body.len() as u64);
        header.set_mtime(0);
        builder
            .append_data(&mut header, name, file.body.as_bytes())
            .with_context(|| format!("Failed to add '{}' to archive", name))?;
    }

    builder.into_inner().context("Failed to finish archive")
}

/// Build a tar of everything under `src`, relative to `src`.
pub fn build_directory(src: &Path, use_gitignore: bool) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for rel in walk_source(src, use_gitignore)? {
        let full = src.join(&rel);
        builder
            .append_path_with_name(&full, &rel)
            .with_context(|| format!("Failed to add '{}' to archive", full.display()))?;
    }

    builder.into_inner().context("Failed to finish archive")
}

/// The contents of the first regular file in `tar`, or empty if it has none.
pub fn read_first_file(tar: &[u8]) -> Result<String> {
    let mut archive = tar::Archive::new(tar);
    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .context("Failed to read archive entry")?;
        return Ok(content);
    }
    Ok(String::new())
}

/// Paths under `src`, relative to it, parents before children. With
/// `use_gitignore` the root `.gitignore` prunes matching files and directories.
pub fn walk_source(src: &Path, use_gitignore: bool) -> Result<Vec<PathBuf>> {
    let ignore = if use_gitignore {
        GitIgnore::load(src)
    } else {
        GitIgnore::default()
    };

    let mut paths = Vec::new();
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            !ignore.is_ignored(rel, entry.file_type().is_dir())
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("'{}' escaped '{}'", entry.path().display(), src.display()))?;
        paths.push(rel.to_path_buf());
    }
    Ok(paths)
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, dir: &Path) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(DIRECTORY_MODE);
    header.set_size(0);
    header.set_mtime(0);
    builder
        .append_data(&mut header, dir, std::io::empty())
        .with_context(|| format!("Failed to add directory '{}' to archive", dir.display()))
}

/// The subset of `.gitignore` syntax used to trim a workspace copy: globs,
/// anchored patterns and directory-only patterns. Negations are skipped.
#[derive(Debug, Default)]
struct GitIgnore {
    rules: Vec<IgnoreRule>,
}

#[derive(Debug)]
struct IgnoreRule {
    pattern: Pattern,
    anchored: bool,
    dir_only: bool,
}

impl GitIgnore {
    fn load(root: &Path) -> Self {
        match std::fs::read_to_string(root.join(".gitignore")) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    fn parse(content: &str) -> Self {
        let rules = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| {
                let dir_only = line.ends_with('/');
                let line = line.trim_end_matches('/');
                let anchored = line.contains('/');
                match Pattern::new(line.trim_start_matches('/')) {
                    Ok(pattern) => Some(IgnoreRule {
                        pattern,
                        anchored,
                        dir_only,
                    }),
                    Err(e) => {
                        tracing::debug!("Skipping .gitignore pattern '{}': {}", line, e);
                        None
                    }
                }
            })
            .collect();
        Self { rules }
    }

    fn is_ignored(&self, rel: &Path, is_dir: bool) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.rules.iter().any(|rule| {
            if rule.dir_only && !is_dir {
                return false;
            }
            if rule.anchored {
                rule.pattern.matches_with(&rel_str, options)
            } else {
                rule.pattern.matches_with(&file_name, options)
            }
        })
    }
}
