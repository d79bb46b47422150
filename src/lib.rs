//! # zipforge
//!
//! A ZIP and JAR archive builder with a concurrent deflate pipeline.
//!
//! ## Features
//! - **Concurrent compression**: file bodies are deflated on a worker pool
//!   while the archive itself is written by a single drain thread, so entry
//!   order in the output always matches submission order.
//! - **JAR semantics**: manifest parsing, merging across precedence layers,
//!   72-byte line folding, and optional `META-INF/INDEX.LIST` generation.
//! - **Unix permissions**: per-entry modes resolved from forced overrides,
//!   discovered filesystem attributes, or per-kind defaults.
//! - **Safe replacement**: archives are staged in a temp file and moved over
//!   the destination only after a fully successful build.
//!
//! ## Quick start
//!
//! ```no_run
//! use zipforge::{JarBuilder, Result};
//!
//! fn main() -> Result<()> {
//!     let mut jar = JarBuilder::new("app.jar");
//!     jar.add_directory("target/classes", "");
//!     jar.index(true);
//!     jar.build()
//! }
//! ```

pub mod builder;
pub mod error;
pub mod fileset;
pub mod index;
pub mod jar;
pub mod manifest;
pub mod mode;
pub mod writer;

pub use builder::ZipBuilder;
pub use error::{ArchiverError, Result};
pub use fileset::{
    ArchiveFileSet, DirFileSet, InMemoryFileSet, ResourceCollection, ResourceEntry, ResourceKind,
    ResourceSource, SingleFileSet,
};
pub use jar::{FilesetManifestMode, JarBuilder};
pub use manifest::{Attributes, Manifest};
pub use mode::{ModePolicy, ModeProvenance, ResolvedMode};
pub use writer::{ConcurrentZipWriter, EntrySubmission, WriterConfig};
