//! The plain ZIP builder: collects filesets, plans entries, and streams
//! them through the concurrent writer into a temp file that replaces the
//! destination only on success.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;
use zip::CompressionMethod;

use crate::error::{ArchiverError, Result};
use crate::fileset::{
    ArchiveFileSet, DirFileSet, ResourceCollection, ResourceKind, ResourceSource, SingleFileSet,
};
use crate::mode::ModePolicy;
use crate::writer::{ArchiveRef, ConcurrentZipWriter, ContentSupplier, EntrySubmission, WriterConfig};

const OUTPUT_BUFFER: usize = 1 << 20;

/// Files below this size are read and deflated inline on the control
/// thread; bigger ones go through the worker pool.
const PARALLEL_THRESHOLD: u64 = 4096;

struct Fileset {
    collection: Box<dyn ResourceCollection>,
    policy: ModePolicy,
}

/// Builder for a ZIP archive. Configuration setters apply to filesets added
/// afterwards; [`build`](Self::build) performs the whole write.
pub struct ZipBuilder {
    dest: PathBuf,
    filesets: Vec<Fileset>,
    policy: ModePolicy,
    compress: bool,
    threads: usize,
    recompress_added_zips: bool,
    update: bool,
    create_empty: bool,
    forced_mtime: Option<i64>,
    pub(crate) added_dirs: BTreeSet<String>,
    pub(crate) entry_names: Vec<String>,
}

/// One entry after planning: path normalized, mode resolved, origin known.
pub(crate) struct PlannedEntry {
    pub path: String,
    pub kind: PlannedKind,
    pub mtime: i64,
    pub mode: Option<u32>,
    /// Mode for parent directories synthesized for this entry.
    pub dir_mode: u32,
    pub parallel: bool,
    /// Came from the destination archive during an update build.
    pub from_dest: bool,
}

pub(crate) enum PlannedKind {
    File { source: ResourceSource, size: u64 },
    Directory,
    Symlink { target: String },
}

impl ZipBuilder {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        ZipBuilder {
            dest: dest.into(),
            filesets: Vec::new(),
            policy: ModePolicy::default(),
            compress: true,
            threads: 0,
            recompress_added_zips: true,
            update: false,
            create_empty: false,
            forced_mtime: None,
            added_dirs: BTreeSet::new(),
            entry_names: Vec::new(),
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;
        self
    }

    pub fn threads(&mut self, threads: usize) -> &mut Self {
        self.threads = threads;
        self
    }

    pub fn recompress_added_zips(&mut self, recompress: bool) -> &mut Self {
        self.recompress_added_zips = recompress;
        self
    }

    /// Keep the existing destination's entries and add new ones on top.
    pub fn update(&mut self, update: bool) -> &mut Self {
        self.update = update;
        self
    }

    /// Produce an archive even when no entries were added.
    pub fn create_empty(&mut self, create_empty: bool) -> &mut Self {
        self.create_empty = create_empty;
        self
    }

    /// Force one timestamp onto every entry, for reproducible output.
    pub fn last_modified(&mut self, unix_secs: i64) -> &mut Self {
        self.forced_mtime = Some(unix_secs);
        self
    }

    pub fn set_file_mode(&mut self, mode: Option<u32>) -> &mut Self {
        self.policy.file_override = mode;
        self
    }

    pub fn set_dir_mode(&mut self, mode: Option<u32>) -> &mut Self {
        self.policy.dir_override = mode;
        self
    }

    pub fn set_default_file_mode(&mut self, mode: u32) -> &mut Self {
        self.policy.default_file_mode = mode;
        self
    }

    pub fn set_default_dir_mode(&mut self, mode: u32) -> &mut Self {
        self.policy.default_dir_mode = mode;
        self
    }

    pub fn add_directory(&mut self, base: impl Into<PathBuf>, prefix: &str) -> &mut Self {
        self.add_fileset(DirFileSet::new(base).prefix(prefix))
    }

    pub fn add_file(&mut self, file: impl Into<PathBuf>, dest: &str) -> &mut Self {
        self.add_fileset(SingleFileSet::new(file, dest))
    }

    pub fn add_archive(&mut self, archive: impl Into<PathBuf>) -> &mut Self {
        self.add_fileset(ArchiveFileSet::new(archive))
    }

    /// Adds a collection under the mode policy in force right now.
    pub fn add_fileset(&mut self, collection: impl ResourceCollection + 'static) -> &mut Self {
        self.filesets.push(Fileset {
            collection: Box::new(collection),
            policy: self.policy,
        });
        self
    }

    /// Enumerates every fileset into a flat plan. During an update build
    /// the destination's own entries come first, minus any whose path a new
    /// addition shadows.
    pub(crate) fn plan(&self) -> Result<Vec<PlannedEntry>> {
        let mut planned = Vec::new();
        if self.update && self.dest.exists() {
            let existing = ArchiveFileSet::new(&self.dest);
            self.plan_collection(&existing, &ModePolicy::default(), true, &mut planned)?;
        }
        let kept_from_dest = planned.len();
        for fileset in &self.filesets {
            self.plan_collection(fileset.collection.as_ref(), &fileset.policy, false, &mut planned)?;
        }
        if kept_from_dest > 0 {
            let shadowed: BTreeSet<String> = planned[kept_from_dest..]
                .iter()
                .map(|e| e.path.clone())
                .collect();
            planned.retain(|e| !e.from_dest || !shadowed.contains(&e.path));
        }
        Ok(planned)
    }

    fn plan_collection(
        &self,
        collection: &dyn ResourceCollection,
        policy: &ModePolicy,
        from_dest: bool,
        planned: &mut Vec<PlannedEntry>,
    ) -> Result<()> {
        for entry in collection.entries()? {
            let mtime = self.forced_mtime.unwrap_or(entry.last_modified);
            let dir_mode = policy.dir_mode(None).mode;
            let planned_entry = match entry.kind {
                ResourceKind::Directory => PlannedEntry {
                    path: entry.path,
                    kind: PlannedKind::Directory,
                    mtime,
                    mode: Some(policy.dir_mode(entry.mode).mode),
                    dir_mode,
                    parallel: false,
                    from_dest,
                },
                ResourceKind::Symlink { target } => PlannedEntry {
                    path: entry.path,
                    kind: PlannedKind::Symlink { target },
                    mtime,
                    mode: entry.mode,
                    dir_mode,
                    parallel: false,
                    from_dest,
                },
                ResourceKind::File { size } => PlannedEntry {
                    path: entry.path,
                    kind: PlannedKind::File {
                        source: entry.source,
                        size,
                    },
                    mtime,
                    mode: Some(policy.file_mode(entry.mode).mode),
                    dir_mode,
                    parallel: size >= PARALLEL_THRESHOLD,
                    from_dest,
                },
            };
            planned.push(planned_entry);
        }
        Ok(())
    }

    /// Emits directory entries for every missing ancestor of `path`, using
    /// the entry's directory mode policy. Discovered attributes never apply
    /// here; these directories exist only in the archive.
    fn ensure_parent_dirs(
        &mut self,
        writer: &mut ConcurrentZipWriter<BufWriter<File>>,
        path: &str,
        mtime: i64,
        dir_mode: u32,
    ) -> Result<()> {
        let mut search = 0;
        while let Some(pos) = path[search..].find('/') {
            let end = search + pos + 1;
            search = end;
            if end == path.len() {
                break;
            }
            let dir = &path[..end];
            if self.added_dirs.insert(dir.to_string()) {
                writer.submit(EntrySubmission::directory(dir, mtime, Some(dir_mode)))?;
            }
        }
        Ok(())
    }

    pub(crate) fn submit_entry(
        &mut self,
        writer: &mut ConcurrentZipWriter<BufWriter<File>>,
        planned: PlannedEntry,
    ) -> Result<()> {
        self.ensure_parent_dirs(writer, &planned.path, planned.mtime, planned.dir_mode)?;
        match planned.kind {
            PlannedKind::Directory => {
                if self.added_dirs.insert(planned.path.clone()) {
                    writer.submit(EntrySubmission::directory(
                        planned.path,
                        planned.mtime,
                        planned.mode,
                    ))?;
                }
            }
            PlannedKind::Symlink { target } => {
                self.entry_names.push(planned.path.clone());
                writer.submit(EntrySubmission::symlink(
                    planned.path,
                    target,
                    planned.mtime,
                    planned.mode,
                ))?;
            }
            PlannedKind::File { source, size: _ } => {
                self.entry_names.push(planned.path.clone());
                match source {
                    ResourceSource::Path(file) => {
                        let supplier: ContentSupplier = Box::new(move || {
                            let f = File::open(&file)?;
                            Ok(Box::new(f) as Box<dyn std::io::Read + Send>)
                        });
                        writer.submit(EntrySubmission::file(
                            planned.path,
                            supplier,
                            planned.mtime,
                            planned.mode,
                            planned.parallel,
                        ))?;
                    }
                    ResourceSource::Bytes(bytes) => {
                        writer.submit(EntrySubmission::bytes(
                            planned.path,
                            bytes.as_ref().clone(),
                            planned.mtime,
                            planned.mode,
                            planned.parallel,
                        ))?;
                    }
                    ResourceSource::Archive { archive, index } => {
                        writer.submit(EntrySubmission::from_archive(
                            planned.path,
                            ArchiveRef { archive, index },
                            planned.mtime,
                            planned.mode,
                        ))?;
                    }
                    ResourceSource::None => {
                        writer.submit(EntrySubmission::bytes(
                            planned.path,
                            Vec::new(),
                            planned.mtime,
                            planned.mode,
                            false,
                        ))?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn temp_output(&self) -> Result<NamedTempFile> {
        let parent = self
            .dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        NamedTempFile::new_in(parent).map_err(|e| ArchiverError::io(e, parent))
    }

    pub(crate) fn open_writer(
        &self,
        temp: &NamedTempFile,
    ) -> Result<ConcurrentZipWriter<BufWriter<File>>> {
        let file = temp
            .reopen()
            .map_err(|e| ArchiverError::io(e, temp.path()))?;
        let config = WriterConfig {
            threads: self.threads,
            method: if self.compress {
                CompressionMethod::Deflated
            } else {
                CompressionMethod::Stored
            },
            recompress_added_zips: self.recompress_added_zips,
        };
        Ok(ConcurrentZipWriter::new(
            BufWriter::with_capacity(OUTPUT_BUFFER, file),
            &config,
        ))
    }

    /// Closes the writer and moves the temp file over the destination, but
    /// only when both the submissions and the drain succeeded.
    pub(crate) fn finish_build(
        &self,
        submit_failure: Option<ArchiverError>,
        writer: ConcurrentZipWriter<BufWriter<File>>,
        temp: NamedTempFile,
    ) -> Result<()> {
        let drained = writer.finish();
        if let Err(e) = drained {
            // The drain error names the root cause; a submit error after
            // shutdown is only a symptom.
            return Err(e);
        }
        if let Some(e) = submit_failure {
            return Err(e);
        }
        temp.persist(&self.dest)
            .map_err(|e| ArchiverError::io(e.error, &self.dest))?;
        debug!(dest = %self.dest.display(), "archive written");
        Ok(())
    }

    pub(crate) fn reset_build_state(&mut self) {
        self.added_dirs.clear();
        self.entry_names.clear();
    }

    pub(crate) fn is_create_empty(&self) -> bool {
        self.create_empty
    }

    pub(crate) fn is_update(&self) -> bool {
        self.update
    }

    pub(crate) fn forced_mtime(&self) -> Option<i64> {
        self.forced_mtime
    }

    pub(crate) fn dir_entry_mode(&self) -> u32 {
        self.policy.dir_mode(None).mode
    }

    pub(crate) fn file_entry_mode(&self) -> u32 {
        self.policy.file_mode(None).mode
    }

    /// Builds the archive. Fails with [`ArchiverError::EmptyArchive`] when
    /// nothing was added and empty archives were not requested.
    pub fn build(&mut self) -> Result<()> {
        self.reset_build_state();
        let planned = self.plan()?;
        if planned.is_empty() && !self.create_empty {
            return Err(ArchiverError::EmptyArchive);
        }
        debug!(entries = planned.len(), dest = %self.dest.display(), "building archive");

        let temp = self.temp_output()?;
        let mut writer = self.open_writer(&temp)?;
        let mut failure = None;
        for entry in planned {
            if let Err(e) = self.submit_entry(&mut writer, entry) {
                failure = Some(e);
                break;
            }
        }
        self.finish_build(failure, writer, temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dirs_are_synthesized_once() -> Result<()> {
        let dir = tempfile::tempdir().map_err(ArchiverError::from)?;
        let mut builder = ZipBuilder::new(dir.path().join("out.zip"));
        let temp = builder.temp_output()?;
        let mut writer = builder.open_writer(&temp)?;
        builder.ensure_parent_dirs(&mut writer, "a/b/c.txt", 1_700_000_000, 0o40755)?;
        builder.ensure_parent_dirs(&mut writer, "a/b/d.txt", 1_700_000_000, 0o40755)?;
        assert_eq!(builder.added_dirs.len(), 2);
        assert!(builder.added_dirs.contains("a/"));
        assert!(builder.added_dirs.contains("a/b/"));
        writer.finish()?;
        Ok(())
    }

    #[test]
    fn empty_build_is_an_error_unless_requested() {
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let mut builder = ZipBuilder::new(dir.path().join("out.zip"));
        assert!(matches!(builder.build(), Err(ArchiverError::EmptyArchive)));

        builder.create_empty(true);
        assert!(builder.build().is_ok());
        assert!(dir.path().join("out.zip").exists());
    }
}
