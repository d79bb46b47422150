//! Resource collections: the inputs an archive is built from.
//!
//! A collection enumerates virtual entries (forward-slash paths, directories
//! with a trailing slash) without reading file bodies. Collections must be
//! re-enumerable, since JAR builds may walk them once to harvest manifests
//! before the write pass.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{ArchiverError, Result};
use crate::mode::is_symlink_mode;
use crate::writer;

/// What kind of thing an entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    File { size: u64 },
    Directory,
    Symlink { target: String },
}

/// Where an entry's bytes live.
#[derive(Debug, Clone)]
pub enum ResourceSource {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// An entry inside an existing archive.
    Archive { archive: PathBuf, index: usize },
    /// Bytes already in memory.
    Bytes(Arc<Vec<u8>>),
    /// No content (directories, symlinks).
    None,
}

/// One enumerated entry.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    /// Virtual archive path, '/'-separated; directories end with '/'.
    pub path: String,
    pub kind: ResourceKind,
    /// Seconds since the Unix epoch.
    pub last_modified: i64,
    /// Mode discovered from the source, when the source records one.
    pub mode: Option<u32>,
    pub source: ResourceSource,
}

/// A re-enumerable set of resources destined for the archive.
pub trait ResourceCollection: Send {
    fn entries(&self) -> Result<Vec<ResourceEntry>>;
}

/// Recursive walk of a filesystem directory.
pub struct DirFileSet {
    base: PathBuf,
    prefix: String,
    follow_symlinks: bool,
}

impl DirFileSet {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        DirFileSet {
            base: base.into(),
            prefix: String::new(),
            follow_symlinks: false,
        }
    }

    /// Prefix prepended to every entry path. Normalized to end with '/'.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.prefix = prefix;
        self
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    fn virtual_path(&self, relative: &Path, is_dir: bool) -> String {
        let mut path = String::from(&self.prefix);
        let mut first = true;
        for component in relative.components() {
            if !first {
                path.push('/');
            }
            path.push_str(&component.as_os_str().to_string_lossy());
            first = false;
        }
        if is_dir && !path.ends_with('/') {
            path.push('/');
        }
        path
    }
}

fn mtime_secs(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn discovered_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn discovered_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

impl ResourceCollection for DirFileSet {
    fn entries(&self) -> Result<Vec<ResourceEntry>> {
        let mut out = Vec::new();
        let walk = WalkDir::new(&self.base)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name();
        for item in walk {
            let item = item.map_err(|e| {
                let path = e.path().map(PathBuf::from).unwrap_or_else(|| self.base.clone());
                match e.into_io_error() {
                    Some(io) => ArchiverError::io(io, path),
                    None => ArchiverError::Config(format!(
                        "filesystem loop detected under '{}'",
                        path.display()
                    )),
                }
            })?;
            let relative = item
                .path()
                .strip_prefix(&self.base)
                .unwrap_or_else(|_| item.path());
            if relative.as_os_str().is_empty() {
                continue;
            }
            let file_type = item.file_type();
            if file_type.is_symlink() && !self.follow_symlinks {
                let target = fs::read_link(item.path())
                    .map_err(|e| ArchiverError::io(e, item.path()))?;
                let metadata = item
                    .path()
                    .symlink_metadata()
                    .map_err(|e| ArchiverError::io(e, item.path()))?;
                out.push(ResourceEntry {
                    path: self.virtual_path(relative, false),
                    kind: ResourceKind::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    },
                    last_modified: mtime_secs(&metadata),
                    mode: None,
                    source: ResourceSource::None,
                });
                continue;
            }
            let metadata = item
                .metadata()
                .map_err(|e| match e.into_io_error() {
                    Some(io) => ArchiverError::io(io, item.path()),
                    None => ArchiverError::Config(format!(
                        "cannot stat '{}'",
                        item.path().display()
                    )),
                })?;
            if file_type.is_dir() {
                out.push(ResourceEntry {
                    path: self.virtual_path(relative, true),
                    kind: ResourceKind::Directory,
                    last_modified: mtime_secs(&metadata),
                    mode: discovered_mode(&metadata),
                    source: ResourceSource::None,
                });
            } else {
                out.push(ResourceEntry {
                    path: self.virtual_path(relative, false),
                    kind: ResourceKind::File {
                        size: metadata.len(),
                    },
                    last_modified: mtime_secs(&metadata),
                    mode: discovered_mode(&metadata),
                    source: ResourceSource::Path(item.path().to_path_buf()),
                });
            }
        }
        Ok(out)
    }
}

/// All entries of an existing archive, used for update mode and for
/// merging other archives in wholesale.
pub struct ArchiveFileSet {
    archive: PathBuf,
    prefix: String,
}

impl ArchiveFileSet {
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        ArchiveFileSet {
            archive: archive.into(),
            prefix: String::new(),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.prefix = prefix;
        self
    }
}

impl ResourceCollection for ArchiveFileSet {
    fn entries(&self) -> Result<Vec<ResourceEntry>> {
        let file =
            File::open(&self.archive).map_err(|e| ArchiverError::io(e, &self.archive))?;
        let mut archive = ZipArchive::new(file)?;
        let mut out = Vec::with_capacity(archive.len());
        let mut symlink_slots: BTreeMap<usize, usize> = BTreeMap::new();

        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            let mtime = writer::unix_time(entry.last_modified());
            let mode = entry.unix_mode();
            let path = format!("{}{}", self.prefix, entry.name());
            if entry.is_dir() {
                out.push(ResourceEntry {
                    path,
                    kind: ResourceKind::Directory,
                    last_modified: mtime,
                    mode,
                    source: ResourceSource::None,
                });
            } else if mode.map(is_symlink_mode).unwrap_or(false) {
                symlink_slots.insert(index, out.len());
                out.push(ResourceEntry {
                    path,
                    kind: ResourceKind::Symlink {
                        target: String::new(),
                    },
                    last_modified: mtime,
                    mode,
                    source: ResourceSource::None,
                });
            } else {
                out.push(ResourceEntry {
                    path,
                    kind: ResourceKind::File { size: entry.size() },
                    last_modified: mtime,
                    mode,
                    source: ResourceSource::Archive {
                        archive: self.archive.clone(),
                        index,
                    },
                });
            }
        }

        // Symlink targets are stored as the entry body; a second pass reads
        // only those.
        for (index, slot) in symlink_slots {
            let mut entry = archive.by_index(index)?;
            let mut target = String::new();
            entry
                .read_to_string(&mut target)
                .map_err(|e| ArchiverError::io(e, &self.archive))?;
            out[slot].kind = ResourceKind::Symlink { target };
        }
        Ok(out)
    }
}

/// A single file mapped to an explicit destination path.
pub struct SingleFileSet {
    file: PathBuf,
    dest: String,
}

impl SingleFileSet {
    pub fn new(file: impl Into<PathBuf>, dest: impl Into<String>) -> Self {
        SingleFileSet {
            file: file.into(),
            dest: dest.into(),
        }
    }
}

impl ResourceCollection for SingleFileSet {
    fn entries(&self) -> Result<Vec<ResourceEntry>> {
        let metadata =
            fs::metadata(&self.file).map_err(|e| ArchiverError::io(e, &self.file))?;
        if metadata.is_dir() {
            return Err(ArchiverError::Config(format!(
                "'{}' is a directory, not a file",
                self.file.display()
            )));
        }
        Ok(vec![ResourceEntry {
            path: self.dest.clone(),
            kind: ResourceKind::File {
                size: metadata.len(),
            },
            last_modified: mtime_secs(&metadata),
            mode: discovered_mode(&metadata),
            source: ResourceSource::Path(self.file.clone()),
        }])
    }
}

/// Entries held in memory, mainly for generated content.
#[derive(Default)]
pub struct InMemoryFileSet {
    entries: Vec<ResourceEntry>,
}

impl InMemoryFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>, bytes: Vec<u8>, last_modified: i64) {
        let bytes = Arc::new(bytes);
        self.entries.push(ResourceEntry {
            path: path.into(),
            kind: ResourceKind::File {
                size: bytes.len() as u64,
            },
            last_modified,
            mode: None,
            source: ResourceSource::Bytes(bytes),
        });
    }
}

impl ResourceCollection for InMemoryFileSet {
    fn entries(&self) -> Result<Vec<ResourceEntry>> {
        Ok(self.entries.clone())
    }
}

/// Reads an entry's full content, used by the manifest discovery pass.
pub(crate) fn read_source(source: &ResourceSource, path: &str) -> Result<Vec<u8>> {
    match source {
        ResourceSource::Path(file) => {
            fs::read(file).map_err(|e| ArchiverError::io(e, file))
        }
        ResourceSource::Archive { archive, index } => {
            let file = File::open(archive).map_err(|e| ArchiverError::io(e, archive))?;
            let mut zip = ZipArchive::new(file)?;
            let mut entry = zip.by_index(*index)?;
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| ArchiverError::io(e, archive))?;
            Ok(data)
        }
        ResourceSource::Bytes(bytes) => Ok(bytes.as_ref().clone()),
        ResourceSource::None => Err(ArchiverError::Config(format!(
            "entry '{path}' has no readable content"
        ))),
    }
}
