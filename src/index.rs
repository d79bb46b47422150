//! `META-INF/INDEX.LIST` generation.
//!
//! The index maps package directories (and root-level files) to the archive
//! that contains them, so a class loader can skip archives that cannot hold
//! a requested resource. The primary block covers the archive being built;
//! optional extra blocks cover other archives named on the class path.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{error, info};
use zip::ZipArchive;

use crate::error::{ArchiverError, Result};
use crate::jar::{INDEX_PATH, MANIFEST_PATH, META_INF_DIR};

/// Everything the index builder needs about the archive under construction.
pub struct IndexInputs<'a> {
    /// File name of the archive being built, as written into the index.
    pub archive_name: &'a str,
    /// Directory entries recorded during the write pass, with trailing '/'.
    pub directories: &'a BTreeSet<String>,
    /// Root-level file entries (no '/' in the path).
    pub root_entries: &'a [String],
    /// Every file entry path written to the archive.
    pub entry_names: &'a [String],
    /// `Class-Path` value from the manifest, when present.
    pub classpath: Option<&'a str>,
    /// Additional archives to index alongside this one.
    pub index_jars: &'a [PathBuf],
}

/// Renders a complete `INDEX.LIST` body.
pub fn build_index(inputs: &IndexInputs<'_>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let push_line = |out: &mut Vec<u8>, line: &str| {
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    };

    push_line(&mut out, "JarIndex-Version: 1.0");
    out.push(b'\n');
    push_line(&mut out, inputs.archive_name);

    // META-INF appears only when the archive holds META-INF content other
    // than the manifest and the index itself.
    let meta_inf_visible = inputs.entry_names.iter().any(|name| {
        name.starts_with(META_INF_DIR)
            && !name.eq_ignore_ascii_case(MANIFEST_PATH)
            && !name.eq_ignore_ascii_case(INDEX_PATH)
    });

    let mut dirs: BTreeSet<String> = BTreeSet::new();
    for dir in inputs.directories {
        if !meta_inf_visible && dir.eq_ignore_ascii_case(META_INF_DIR) {
            continue;
        }
        dirs.insert(reduce_dir(dir));
    }
    dirs.remove("");
    for dir in &dirs {
        push_line(&mut out, dir);
    }
    let mut roots: Vec<&str> = inputs.root_entries.iter().map(String::as_str).collect();
    roots.sort_unstable();
    for name in roots {
        push_line(&mut out, name);
    }
    out.push(b'\n');

    let classpath: Option<Vec<&str>> = inputs
        .classpath
        .map(|cp| cp.split_whitespace().collect());
    for jar in inputs.index_jars {
        let Some(name) = find_jar_name(jar, classpath.as_deref()) else {
            continue;
        };
        let mut jar_dirs = BTreeSet::new();
        let mut jar_files = BTreeSet::new();
        grab_files_and_dirs(jar, &mut jar_dirs, &mut jar_files)?;
        if jar_dirs.is_empty() && jar_files.is_empty() {
            continue;
        }
        push_line(&mut out, &name);
        for dir in &jar_dirs {
            push_line(&mut out, dir);
        }
        for file in &jar_files {
            push_line(&mut out, file);
        }
        out.push(b'\n');
    }

    Ok(out)
}

/// Reduces a directory entry to its index form: strip a leading `./` or `/`
/// and the trailing slash, then drop the last path segment.
fn reduce_dir(dir: &str) -> String {
    let mut dir = dir;
    if let Some(rest) = dir.strip_prefix("./") {
        dir = rest;
    }
    dir = dir.strip_prefix('/').unwrap_or(dir);
    dir = dir.strip_suffix('/').unwrap_or(dir);
    match dir.rfind('/') {
        Some(pos) => dir[..pos].to_string(),
        None => dir.to_string(),
    }
}

/// Picks the name an indexed archive goes by. Without a class path this is
/// the bare file name; with one, each token is tried as a suffix of the
/// archive's path, stripping leading token segments until it fits. The
/// token whose matched remainder is longest wins and is returned whole.
fn find_jar_name(jar: &Path, classpath: Option<&[&str]>) -> Option<String> {
    let Some(classpath) = classpath else {
        return jar
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    };
    let jar_text = jar.to_string_lossy().replace('\\', "/");
    let mut best: Option<(usize, &str)> = None;
    for &token in classpath {
        let mut suffix = token.trim_start_matches("./");
        loop {
            if jar_text.ends_with(suffix) {
                if best.map(|(len, _)| suffix.len() > len).unwrap_or(true) {
                    best = Some((suffix.len(), token));
                }
                break;
            }
            match suffix.find('/') {
                Some(pos) => suffix = &suffix[pos + 1..],
                None => break,
            }
        }
    }
    best.map(|(_, token)| token.to_string())
}

/// Collects the index-visible directories and root files of one archive.
/// A missing or unreadable-as-file archive is skipped, not fatal.
fn grab_files_and_dirs(
    jar: &Path,
    dirs: &mut BTreeSet<String>,
    files: &mut BTreeSet<String>,
) -> Result<()> {
    if !jar.exists() {
        error!(path = %jar.display(), "indexed archive does not exist, skipping");
        return Ok(());
    }
    if jar.is_dir() {
        info!(path = %jar.display(), "indexed archive is a directory, skipping");
        return Ok(());
    }
    let file = File::open(jar).map_err(|e| ArchiverError::io(e, jar))?;
    let mut archive = ZipArchive::new(file)?;
    // Directory names are collected raw first, whether they come from
    // explicit directory entries or from nested-file parents, so a single
    // reduction applies to the combined set.
    let mut raw_dirs: BTreeSet<String> = BTreeSet::new();
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let name = entry.name();
        if name.eq_ignore_ascii_case(META_INF_DIR)
            || name.eq_ignore_ascii_case(MANIFEST_PATH)
            || name.eq_ignore_ascii_case(INDEX_PATH)
        {
            continue;
        }
        if entry.is_dir() {
            raw_dirs.insert(name.to_string());
        } else {
            match name.rfind('/') {
                Some(pos) => {
                    raw_dirs.insert(name[..pos].to_string());
                }
                None => {
                    files.insert(name.to_string());
                }
            }
        }
    }
    for dir in raw_dirs {
        let reduced = reduce_dir(&dir);
        if !reduced.is_empty() {
            dirs.insert(reduced);
        }
    }
    Ok(())
}
