//! JAR building on top of [`ZipBuilder`]: manifest assembly, the optional
//! class-loader index, and the special handling both need during a build.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;
use zip::ZipArchive;

use crate::builder::{PlannedKind, ZipBuilder};
use crate::error::{ArchiverError, Result};
use crate::fileset::{self, ResourceCollection};
use crate::index::{self, IndexInputs};
use crate::manifest::{default_manifest, Manifest};
use crate::writer::EntrySubmission;

pub const META_INF_DIR: &str = "META-INF/";
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const INDEX_PATH: &str = "META-INF/INDEX.LIST";

/// What to do with `META-INF/MANIFEST.MF` entries found inside filesets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilesetManifestMode {
    /// Store them as ordinary entries; only configured manifests apply.
    #[default]
    Skip,
    /// Merge them, main section included.
    Merge,
    /// Merge their named sections but leave the main section alone.
    MergeWithoutMain,
}

/// How one planned entry participates in a JAR build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmissionKind {
    Regular,
    /// A manifest the merge engine consumes instead of the archive.
    ManifestCandidate,
    /// A stale index the generated one replaces.
    IndexCandidate,
}

/// Builder for a JAR archive.
pub struct JarBuilder {
    zip: ZipBuilder,
    configured_manifest: Option<Manifest>,
    explicit_manifest: Option<Manifest>,
    fileset_manifest_mode: FilesetManifestMode,
    minimal_default_manifest: bool,
    index: bool,
    index_jars: Vec<PathBuf>,
}

impl JarBuilder {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        JarBuilder {
            zip: ZipBuilder::new(dest),
            configured_manifest: None,
            explicit_manifest: None,
            fileset_manifest_mode: FilesetManifestMode::default(),
            minimal_default_manifest: false,
            index: false,
            index_jars: Vec::new(),
        }
    }

    /// The underlying ZIP builder, for filesets and mode configuration.
    pub fn zip_mut(&mut self) -> &mut ZipBuilder {
        &mut self.zip
    }

    pub fn add_directory(&mut self, base: impl Into<PathBuf>, prefix: &str) -> &mut Self {
        self.zip.add_directory(base, prefix);
        self
    }

    pub fn add_file(&mut self, file: impl Into<PathBuf>, dest: &str) -> &mut Self {
        self.zip.add_file(file, dest);
        self
    }

    pub fn add_fileset(&mut self, collection: impl ResourceCollection + 'static) -> &mut Self {
        self.zip.add_fileset(collection);
        self
    }

    /// Merges programmatic manifest attributes. Multiple calls accumulate.
    pub fn set_configured_manifest(&mut self, manifest: Manifest) -> &mut Self {
        match &mut self.configured_manifest {
            Some(existing) => existing.merge_from(&manifest, true),
            None => self.configured_manifest = Some(manifest),
        }
        self
    }

    /// Uses a manifest file as the highest-precedence layer. The file is
    /// read now, so a bad path fails the configuration, not the build.
    /// When the path names an archive, its own manifest is used.
    pub fn set_manifest_file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let bytes = read_manifest_source(path)?;
        self.explicit_manifest = Some(Manifest::parse(&bytes)?);
        Ok(self)
    }

    pub fn fileset_manifest_mode(&mut self, mode: FilesetManifestMode) -> &mut Self {
        self.fileset_manifest_mode = mode;
        self
    }

    /// Drop the `Created-By` attribute from the generated default manifest.
    pub fn minimal_default_manifest(&mut self, minimal: bool) -> &mut Self {
        self.minimal_default_manifest = minimal;
        self
    }

    /// Generate `META-INF/INDEX.LIST`.
    pub fn index(&mut self, index: bool) -> &mut Self {
        self.index = index;
        self
    }

    /// Additional archives covered by the generated index.
    pub fn add_index_jar(&mut self, jar: impl Into<PathBuf>) -> &mut Self {
        self.index_jars.push(jar.into());
        self
    }

    fn classify(&self, path: &str, from_dest: bool) -> SubmissionKind {
        if path.eq_ignore_ascii_case(MANIFEST_PATH) {
            if from_dest || self.fileset_manifest_mode != FilesetManifestMode::Skip {
                return SubmissionKind::ManifestCandidate;
            }
            return SubmissionKind::Regular;
        }
        if self.index && path.eq_ignore_ascii_case(INDEX_PATH) {
            return SubmissionKind::IndexCandidate;
        }
        SubmissionKind::Regular
    }

    /// Folds the manifest layers, lowest precedence first: the generated
    /// default, the destination's own manifest when updating, manifests
    /// found in filesets, configured attributes, then the explicit file.
    fn create_manifest(&self, original: Option<&Manifest>, from_filesets: Option<&Manifest>) -> Manifest {
        let mut manifest = default_manifest(self.minimal_default_manifest);
        if let Some(original) = original {
            manifest.merge_from(original, true);
        }
        if let Some(found) = from_filesets {
            let merge_main = self.fileset_manifest_mode == FilesetManifestMode::Merge;
            manifest.merge_from(found, merge_main);
        }
        if let Some(configured) = &self.configured_manifest {
            manifest.merge_from(configured, true);
        }
        if let Some(explicit) = &self.explicit_manifest {
            manifest.merge_from(explicit, true);
        }
        manifest
    }

    /// Builds the archive. A JAR with no content entries is an error unless
    /// empty archives were requested, in which case a manifest-only archive
    /// is written.
    pub fn build(&mut self) -> Result<()> {
        self.zip.reset_build_state();
        let planned = self.zip.plan()?;

        // Manifests buried in filesets (or the old destination) are only
        // found by reading entry content, which costs an extra pass.
        let needs_discovery_pass =
            self.fileset_manifest_mode != FilesetManifestMode::Skip || self.zip.is_update();
        let mut original: Option<Manifest> = None;
        let mut from_filesets: Option<Manifest> = None;
        if needs_discovery_pass {
            for entry in &planned {
                if self.classify(&entry.path, entry.from_dest) != SubmissionKind::ManifestCandidate
                {
                    continue;
                }
                let PlannedKind::File { source, .. } = &entry.kind else {
                    continue;
                };
                let bytes = fileset::read_source(source, &entry.path)?;
                let parsed = Manifest::parse(&bytes)?;
                if entry.from_dest {
                    original = Some(parsed);
                } else {
                    from_filesets
                        .get_or_insert_with(Manifest::default)
                        .merge_from(&parsed, true);
                }
            }
        }

        let manifest = self.create_manifest(original.as_ref(), from_filesets.as_ref());
        for warning in &manifest.warnings {
            warn!(%warning, "manifest oddity");
        }

        let has_content = planned
            .iter()
            .any(|e| self.classify(&e.path, e.from_dest) == SubmissionKind::Regular);
        if !has_content && !self.zip.is_create_empty() {
            return Err(ArchiverError::EmptyArchive);
        }

        let temp = self.zip.temp_output()?;
        let mut writer = self.zip.open_writer(&temp)?;
        let manifest_mtime = self
            .zip
            .forced_mtime()
            .unwrap_or_else(|| Utc::now().timestamp());

        let result = (|| -> Result<()> {
            self.zip.added_dirs.insert(META_INF_DIR.to_string());
            writer.submit(EntrySubmission::directory(
                META_INF_DIR,
                manifest_mtime,
                Some(self.zip.dir_entry_mode()),
            ))?;
            self.zip.entry_names.push(MANIFEST_PATH.to_string());
            writer.submit(EntrySubmission::bytes(
                MANIFEST_PATH,
                manifest.to_bytes(),
                manifest_mtime,
                Some(self.zip.file_entry_mode()),
                false,
            ))?;

            let mut root_entries: Vec<String> = Vec::new();
            for entry in planned {
                match self.classify(&entry.path, entry.from_dest) {
                    SubmissionKind::ManifestCandidate => continue,
                    SubmissionKind::IndexCandidate => {
                        warn!(path = %entry.path, "dropping stale index entry, a fresh one will be generated");
                        continue;
                    }
                    SubmissionKind::Regular => {}
                }
                if self.index
                    && matches!(entry.kind, PlannedKind::File { .. })
                    && !entry.path.contains('/')
                {
                    root_entries.push(entry.path.clone());
                }
                self.zip.submit_entry(&mut writer, entry)?;
            }

            if self.index {
                let archive_name = self
                    .zip
                    .dest()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let body = index::build_index(&IndexInputs {
                    archive_name: &archive_name,
                    directories: &self.zip.added_dirs,
                    root_entries: &root_entries,
                    entry_names: &self.zip.entry_names,
                    classpath: manifest.main.get("Class-Path"),
                    index_jars: &self.index_jars,
                })?;
                writer.submit(EntrySubmission::bytes(
                    INDEX_PATH,
                    body,
                    manifest_mtime,
                    Some(self.zip.file_entry_mode()),
                    true,
                ))?;
            }
            Ok(())
        })();

        self.zip.finish_build(result.err(), writer, temp)
    }
}

/// Reads the bytes a manifest file argument denotes. Archive extensions
/// mean "the manifest inside that archive".
fn read_manifest_source(path: &Path) -> Result<Vec<u8>> {
    let is_archive = path
        .extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            ["jar", "zip", "war", "ear"]
                .iter()
                .any(|a| ext.eq_ignore_ascii_case(a))
        })
        .unwrap_or(false);
    if !is_archive {
        return fs::read(path).map_err(|e| ArchiverError::io(e, path));
    }
    let file = File::open(path).map_err(|e| ArchiverError::io(e, path))?;
    let mut archive = ZipArchive::new(file)?;
    let mut entry = archive.by_name(MANIFEST_PATH).map_err(|e| match e {
        zip::result::ZipError::FileNotFound => ArchiverError::Config(format!(
            "archive '{}' carries no manifest",
            path.display()
        )),
        other => ArchiverError::Zip(other),
    })?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| ArchiverError::io(e, path))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_mode_treats_fileset_manifests_as_regular_entries() {
        let builder = JarBuilder::new("out.jar");
        assert_eq!(
            builder.classify(MANIFEST_PATH, false),
            SubmissionKind::Regular
        );
        assert_eq!(
            builder.classify(MANIFEST_PATH, true),
            SubmissionKind::ManifestCandidate
        );
    }

    #[test]
    fn merge_mode_captures_fileset_manifests() {
        let mut builder = JarBuilder::new("out.jar");
        builder.fileset_manifest_mode(FilesetManifestMode::Merge);
        assert_eq!(
            builder.classify("META-INF/MANIFEST.MF", false),
            SubmissionKind::ManifestCandidate
        );
        assert_eq!(
            builder.classify("meta-inf/manifest.mf", false),
            SubmissionKind::ManifestCandidate
        );
    }

    #[test]
    fn stale_index_is_dropped_only_when_indexing() {
        let mut builder = JarBuilder::new("out.jar");
        assert_eq!(builder.classify(INDEX_PATH, false), SubmissionKind::Regular);
        builder.index(true);
        assert_eq!(
            builder.classify(INDEX_PATH, false),
            SubmissionKind::IndexCandidate
        );
    }

    #[test]
    fn manifest_fold_orders_the_layers() {
        let mut builder = JarBuilder::new("out.jar");
        builder.fileset_manifest_mode(FilesetManifestMode::Merge);

        let mut original = Manifest::default();
        original.main.put("Tier", "original");
        original.main.put("From-Original", "yes");

        let mut found = Manifest::default();
        found.main.put("Tier", "fileset");
        found.main.put("From-Fileset", "yes");

        let mut configured = Manifest::default();
        configured.main.put("Tier", "configured");
        builder.set_configured_manifest(configured);

        let merged = builder.create_manifest(Some(&original), Some(&found));
        assert_eq!(merged.main.get("Tier"), Some("configured"));
        assert_eq!(merged.main.get("From-Original"), Some("yes"));
        assert_eq!(merged.main.get("From-Fileset"), Some("yes"));
        assert_eq!(merged.main.get("Manifest-Version"), Some("1.0"));
    }

    #[test]
    fn merge_without_main_ignores_fileset_main_attributes() {
        let mut builder = JarBuilder::new("out.jar");
        builder.fileset_manifest_mode(FilesetManifestMode::MergeWithoutMain);

        let mut found = Manifest::default();
        found.main.put("Main-Class", "sneaky.App");
        found.section_mut("org/demo/").put("Sealed", "true");

        let merged = builder.create_manifest(None, Some(&found));
        assert_eq!(merged.main.get("Main-Class"), None);
        assert_eq!(merged.sections.len(), 1);
        assert_eq!(merged.sections[0].1.get("Sealed"), Some("true"));
    }
}
