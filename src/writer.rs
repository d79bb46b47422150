//! Concurrent ZIP writer with submission-order output.
//!
//! Entries are submitted from a single control thread. Large file bodies are
//! compressed on a pool of worker threads, each producing a tiny single-entry
//! archive in memory; a dedicated drain thread splices those into the real
//! archive with a raw copy, in exactly the order the entries were submitted.
//! Ordering is carried by a bounded slot channel: every submission enqueues a
//! slot, and a slot whose compression is still in flight holds a rendezvous
//! channel the drain blocks on. Completion order of the workers is therefore
//! invisible in the output.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use chrono::{Datelike, TimeZone, Timelike, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use zip::write::FileOptions;
use zip::CompressionMethod;
use zip::DateTime as ZipDateTime;
use zip::{ZipArchive, ZipWriter};

use crate::error::{ArchiverError, Result};

/// Lazily opens an entry's content. Invoked at most once, possibly on a
/// worker thread, so it must carry everything it needs.
pub type ContentSupplier = Box<dyn FnOnce() -> io::Result<Box<dyn Read + Send>> + Send>;

/// A reference to an entry inside an existing archive on disk.
#[derive(Debug, Clone)]
pub struct ArchiveRef {
    pub archive: PathBuf,
    pub index: usize,
}

/// One entry handed to [`ConcurrentZipWriter::submit`].
pub struct EntrySubmission {
    pub path: String,
    pub content: Option<ContentSupplier>,
    /// Seconds since the Unix epoch.
    pub last_modified: i64,
    pub unix_mode: Option<u32>,
    pub symlink_target: Option<String>,
    pub from_archive: Option<ArchiveRef>,
    /// Compress on the worker pool instead of inline on the control thread.
    pub add_in_parallel: bool,
}

impl EntrySubmission {
    pub fn directory(path: impl Into<String>, last_modified: i64, unix_mode: Option<u32>) -> Self {
        EntrySubmission {
            path: path.into(),
            content: None,
            last_modified,
            unix_mode,
            symlink_target: None,
            from_archive: None,
            add_in_parallel: false,
        }
    }

    pub fn symlink(
        path: impl Into<String>,
        target: impl Into<String>,
        last_modified: i64,
        unix_mode: Option<u32>,
    ) -> Self {
        EntrySubmission {
            path: path.into(),
            content: None,
            last_modified,
            unix_mode,
            symlink_target: Some(target.into()),
            from_archive: None,
            add_in_parallel: false,
        }
    }

    pub fn file(
        path: impl Into<String>,
        content: ContentSupplier,
        last_modified: i64,
        unix_mode: Option<u32>,
        add_in_parallel: bool,
    ) -> Self {
        EntrySubmission {
            path: path.into(),
            content: Some(content),
            last_modified,
            unix_mode,
            symlink_target: None,
            from_archive: None,
            add_in_parallel,
        }
    }

    pub fn bytes(
        path: impl Into<String>,
        data: Vec<u8>,
        last_modified: i64,
        unix_mode: Option<u32>,
        add_in_parallel: bool,
    ) -> Self {
        let supplier: ContentSupplier =
            Box::new(move || Ok(Box::new(Cursor::new(data)) as Box<dyn Read + Send>));
        Self::file(path, supplier, last_modified, unix_mode, add_in_parallel)
    }

    pub fn from_archive(
        path: impl Into<String>,
        source: ArchiveRef,
        last_modified: i64,
        unix_mode: Option<u32>,
    ) -> Self {
        EntrySubmission {
            path: path.into(),
            content: None,
            last_modified,
            unix_mode,
            symlink_target: None,
            from_archive: Some(source),
            add_in_parallel: true,
        }
    }
}

/// Tuning knobs for the writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Worker thread count; 0 means one per logical CPU.
    pub threads: usize,
    pub method: CompressionMethod,
    /// Re-deflate entries copied out of other archives instead of splicing
    /// their stored bytes verbatim.
    pub recompress_added_zips: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            threads: 0,
            method: CompressionMethod::Deflated,
            recompress_added_zips: true,
        }
    }
}

#[derive(Clone)]
struct EntryMeta {
    path: String,
    mtime: ZipDateTime,
    mode: Option<u32>,
    method: CompressionMethod,
}

impl EntryMeta {
    fn options(&self) -> FileOptions {
        let mut options = FileOptions::default()
            .compression_method(self.method)
            .last_modified_time(self.mtime);
        if let Some(mode) = self.mode {
            options = options.unix_permissions(mode);
        }
        options
    }
}

struct Job {
    meta: EntryMeta,
    supplier: ContentSupplier,
    done: Sender<Result<Vec<u8>>>,
}

enum WriteOp {
    Directory(EntryMeta),
    Symlink(EntryMeta, String),
    FileBytes(EntryMeta, Vec<u8>),
    RawCopy { path: String, source: ArchiveRef },
}

enum Slot {
    Ready(WriteOp),
    /// A worker will deliver a single-entry archive here.
    Pending(Receiver<Result<Vec<u8>>>),
}

/// The concurrent writer. `W` is the destination stream; it is handed back
/// by [`finish`](Self::finish) after the central directory is written.
pub struct ConcurrentZipWriter<W: Write + Seek + Send + 'static> {
    method: CompressionMethod,
    recompress: bool,
    jobs: Option<Sender<Job>>,
    slots: Option<Sender<Slot>>,
    workers: Vec<JoinHandle<()>>,
    drain: Option<JoinHandle<Result<W>>>,
}

impl<W: Write + Seek + Send + 'static> ConcurrentZipWriter<W> {
    pub fn new(inner: W, config: &WriterConfig) -> Self {
        let threads = if config.threads == 0 {
            num_cpus::get()
        } else {
            config.threads
        };
        let (job_tx, job_rx) = bounded::<Job>(threads * 2);
        let (slot_tx, slot_rx) = bounded::<Slot>(threads * 4);

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let rx = job_rx.clone();
            workers.push(thread::spawn(move || run_worker(rx)));
        }
        let drain = thread::spawn(move || run_drain(inner, slot_rx));

        ConcurrentZipWriter {
            method: config.method,
            recompress: config.recompress_added_zips,
            jobs: Some(job_tx),
            slots: Some(slot_tx),
            workers,
            drain: Some(drain),
        }
    }

    /// Enqueues one entry. Returns an error when the pipeline has already
    /// shut down after a failure; the real cause surfaces from `finish`.
    pub fn submit(&mut self, entry: EntrySubmission) -> Result<()> {
        let meta = EntryMeta {
            path: entry.path,
            mtime: dos_time(entry.last_modified),
            mode: entry.unix_mode,
            method: self.method,
        };

        if let Some(target) = entry.symlink_target {
            return self.send_slot(Slot::Ready(WriteOp::Symlink(meta, target)));
        }

        if let Some(source) = entry.from_archive {
            if self.recompress {
                let supplier = archive_entry_supplier(source);
                return self.dispatch_parallel(meta, supplier);
            }
            return self.send_slot(Slot::Ready(WriteOp::RawCopy {
                path: meta.path,
                source,
            }));
        }

        let Some(supplier) = entry.content else {
            return self.send_slot(Slot::Ready(WriteOp::Directory(meta)));
        };
        if meta.path.ends_with('/') {
            return self.send_slot(Slot::Ready(WriteOp::Directory(meta)));
        }

        if entry.add_in_parallel {
            return self.dispatch_parallel(meta, supplier);
        }

        // Small entries are read here and deflated by the drain; the cost
        // of a worker round trip would exceed the work itself.
        let mut reader = supplier().map_err(|e| ArchiverError::io(e, &meta.path))?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| ArchiverError::io(e, &meta.path))?;
        self.send_slot(Slot::Ready(WriteOp::FileBytes(meta, data)))
    }

    fn dispatch_parallel(&mut self, meta: EntryMeta, supplier: ContentSupplier) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.send_slot(Slot::Pending(done_rx))?;
        let job = Job {
            meta,
            supplier,
            done: done_tx,
        };
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|_| aborted()),
            None => Err(aborted()),
        }
    }

    fn send_slot(&mut self, slot: Slot) -> Result<()> {
        match &self.slots {
            Some(slots) => slots.send(slot).map_err(|_| aborted()),
            None => Err(aborted()),
        }
    }

    /// Closes the pipeline, waits for every entry to land, and returns the
    /// destination stream with the archive fully written.
    pub fn finish(mut self) -> Result<W> {
        self.jobs.take();
        self.slots.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                return Err(ArchiverError::Aborted(
                    "a compression worker panicked".into(),
                ));
            }
        }
        match self.drain.take() {
            Some(drain) => drain
                .join()
                .map_err(|_| ArchiverError::Aborted("the archive drain thread panicked".into()))?,
            None => Err(aborted()),
        }
    }
}

fn aborted() -> ArchiverError {
    ArchiverError::Aborted("the archive writer has shut down after a failure".into())
}

/// Supplier that re-reads a single entry out of an archive on disk, used
/// when entries copied from other archives are re-compressed.
fn archive_entry_supplier(source: ArchiveRef) -> ContentSupplier {
    Box::new(move || {
        let file = File::open(&source.archive)?;
        let mut archive = ZipArchive::new(file).map_err(io::Error::from)?;
        let mut entry = archive.by_index(source.index).map_err(io::Error::from)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(Box::new(Cursor::new(data)) as Box<dyn Read + Send>)
    })
}

fn run_worker(jobs: Receiver<Job>) {
    for job in jobs.iter() {
        let result = compress_entry(&job.meta, job.supplier);
        // The drain gave up on this slot if the send fails; nothing to do.
        let _ = job.done.send(result);
    }
}

/// Deflates one entry into a throwaway single-entry archive whose local
/// header already carries the final name, mode and timestamp.
fn compress_entry(meta: &EntryMeta, supplier: ContentSupplier) -> Result<Vec<u8>> {
    let mut reader = supplier().map_err(|e| ArchiverError::io(e, &meta.path))?;
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(&meta.path, meta.options())?;
    io::copy(&mut reader, &mut zip).map_err(|e| ArchiverError::io(e, &meta.path))?;
    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn run_drain<W: Write + Seek + Send>(inner: W, slots: Receiver<Slot>) -> Result<W> {
    let mut zip = ZipWriter::new(inner);
    // Raw copies tend to arrive in runs from the same archive; keep the
    // last source open instead of reopening it per entry.
    let mut cached: Option<(PathBuf, ZipArchive<File>)> = None;

    for slot in slots.iter() {
        let op = match slot {
            Slot::Ready(op) => op,
            Slot::Pending(done) => match done.recv() {
                Ok(Ok(bytes)) => {
                    splice_single_entry(&mut zip, &bytes)?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(ArchiverError::Aborted(
                        "compression worker exited before delivering its entry".into(),
                    ))
                }
            },
        };
        match op {
            WriteOp::Directory(meta) => {
                zip.add_directory(&meta.path, meta.options())?;
            }
            WriteOp::Symlink(meta, target) => {
                zip.add_symlink(&meta.path, &target, meta.options())?;
            }
            WriteOp::FileBytes(meta, data) => {
                zip.start_file(&meta.path, meta.options())?;
                zip.write_all(&data)
                    .map_err(|e| ArchiverError::io(e, &meta.path))?;
            }
            WriteOp::RawCopy { path, source } => {
                let reopen = match &cached {
                    Some((p, _)) => p != &source.archive,
                    None => true,
                };
                if reopen {
                    let file = File::open(&source.archive)
                        .map_err(|e| ArchiverError::io(e, &source.archive))?;
                    cached = Some((source.archive.clone(), ZipArchive::new(file)?));
                }
                // `cached` was just populated on the reopen path.
                if let Some((_, archive)) = &mut cached {
                    let entry = archive.by_index_raw(source.index)?;
                    zip.raw_copy_file_rename(entry, &path)?;
                }
            }
        }
    }

    let mut inner = zip.finish()?;
    inner.flush().map_err(ArchiverError::from)?;
    Ok(inner)
}

/// Copies the sole entry of a worker-produced archive into the output,
/// preserving its compressed bytes, CRC, timestamps and mode.
fn splice_single_entry<W: Write + Seek>(zip: &mut ZipWriter<W>, bytes: &[u8]) -> Result<()> {
    let mut source = ZipArchive::new(Cursor::new(bytes))?;
    let entry = source.by_index_raw(0)?;
    zip.raw_copy_file(entry)?;
    Ok(())
}

/// Converts Unix seconds to DOS time. DOS timestamps have two-second
/// precision; odd seconds round up so a stored time is never earlier than
/// the source time. Years clamp to the representable 1980..=2107 range.
pub(crate) fn dos_time(unix_secs: i64) -> ZipDateTime {
    let secs = if unix_secs % 2 != 0 {
        unix_secs + 1
    } else {
        unix_secs
    };
    let Some(dt) = Utc.timestamp_opt(secs, 0).single() else {
        return ZipDateTime::default();
    };
    if dt.year() < 1980 {
        return ZipDateTime::default();
    }
    if dt.year() > 2107 {
        return ZipDateTime::from_date_and_time(2107, 12, 31, 23, 59, 58)
            .unwrap_or_default();
    }
    ZipDateTime::from_date_and_time(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .unwrap_or_default()
}

/// Converts a stored DOS timestamp back to Unix seconds.
pub(crate) fn unix_time(dt: ZipDateTime) -> i64 {
    Utc.with_ymd_and_hms(
        dt.year() as i32,
        dt.month() as u32,
        dt.day() as u32,
        dt.hour() as u32,
        dt.minute() as u32,
        dt.second() as u32,
    )
    .single()
    .map(|t| t.timestamp())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .map(|t| t.timestamp())
            .unwrap_or(0)
    }

    #[test]
    fn odd_seconds_round_up() {
        let dt = dos_time(epoch(2024, 5, 1, 12, 0, 3));
        assert_eq!(dt.second(), 4);
        let dt = dos_time(epoch(2024, 5, 1, 12, 0, 4));
        assert_eq!(dt.second(), 4);
    }

    #[test]
    fn pre_1980_clamps_to_dos_epoch() {
        let dt = dos_time(0);
        assert_eq!(dt.year(), 1980);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 1);
    }

    #[test]
    fn far_future_clamps_to_dos_maximum() {
        let dt = dos_time(epoch(2200, 1, 1, 0, 0, 0));
        assert_eq!(dt.year(), 2107);
    }

    #[test]
    fn dos_round_trip_keeps_even_seconds() {
        let secs = epoch(2030, 7, 15, 8, 30, 42);
        assert_eq!(unix_time(dos_time(secs)), secs);
    }

    #[test]
    fn output_order_matches_submission_order() -> Result<()> {
        let config = WriterConfig {
            threads: 3,
            ..WriterConfig::default()
        };
        let mut writer = ConcurrentZipWriter::new(Cursor::new(Vec::new()), &config);
        let names: Vec<String> = (0..20).map(|i| format!("entry-{i:02}.bin")).collect();
        for (i, name) in names.iter().enumerate() {
            // Later entries are smaller than earlier ones, so completion
            // order in the pool runs against submission order.
            let size = (20 - i) * 4096;
            let data = vec![i as u8; size];
            writer.submit(EntrySubmission::bytes(name.clone(), data, 1_700_000_000, None, true))?;
        }
        let cursor = writer.finish()?;
        let mut archive = ZipArchive::new(Cursor::new(cursor.into_inner()))?;
        let stored: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).map(|e| e.name().to_string()))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(stored, names);
        Ok(())
    }
}
