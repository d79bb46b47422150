//! Unix permission resolution for archive entries.
//!
//! Every entry's mode comes from one of three tiers, checked in order: an
//! explicit override forced on the archiver for the current addition, the
//! mode discovered from the source filesystem attributes, or the archiver's
//! per-kind default. Overrides are snapshotted when a fileset is added, so
//! changing them affects only filesets added afterwards.

/// Default mode for file entries when nothing better is known.
pub const DEFAULT_FILE_MODE: u32 = 0o100644;
/// Default mode for directory entries when nothing better is known.
pub const DEFAULT_DIR_MODE: u32 = 0o40755;

/// Unix file-type bits marking a symbolic link.
pub const LINK_TYPE_BITS: u32 = 0o120000;
const TYPE_MASK: u32 = 0o170000;

/// Where a resolved mode came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeProvenance {
    /// An override configured on the archiver for this addition.
    Forced,
    /// Attributes discovered on the source filesystem entry.
    Discovered,
    /// The archiver's default for this entry kind.
    Default,
}

/// A mode together with the tier that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMode {
    pub mode: u32,
    pub provenance: ModeProvenance,
}

/// Resolves the effective mode for one entry.
pub fn resolve(forced: Option<u32>, discovered: Option<u32>, fallback: u32) -> ResolvedMode {
    if let Some(mode) = forced {
        return ResolvedMode {
            mode,
            provenance: ModeProvenance::Forced,
        };
    }
    if let Some(mode) = discovered {
        return ResolvedMode {
            mode,
            provenance: ModeProvenance::Discovered,
        };
    }
    ResolvedMode {
        mode: fallback,
        provenance: ModeProvenance::Default,
    }
}

/// True when the mode's file-type bits mark a symbolic link.
pub fn is_symlink_mode(mode: u32) -> bool {
    mode & TYPE_MASK == LINK_TYPE_BITS
}

/// The archiver's current mode configuration. `None` overrides mean
/// "unforced": discovered attributes win, then the defaults.
#[derive(Debug, Clone, Copy)]
pub struct ModePolicy {
    pub file_override: Option<u32>,
    pub dir_override: Option<u32>,
    pub default_file_mode: u32,
    pub default_dir_mode: u32,
}

impl Default for ModePolicy {
    fn default() -> Self {
        ModePolicy {
            file_override: None,
            dir_override: None,
            default_file_mode: DEFAULT_FILE_MODE,
            default_dir_mode: DEFAULT_DIR_MODE,
        }
    }
}

impl ModePolicy {
    pub fn file_mode(&self, discovered: Option<u32>) -> ResolvedMode {
        resolve(self.file_override, discovered, self.default_file_mode)
    }

    pub fn dir_mode(&self, discovered: Option<u32>) -> ResolvedMode {
        resolve(self.dir_override, discovered, self.default_dir_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_mode_wins_over_discovered_and_default() {
        let mut policy = ModePolicy::default();
        policy.default_dir_mode = 0o777;
        policy.dir_override = Some(0o641);
        let resolved = policy.dir_mode(Some(0o755));
        assert_eq!(resolved.mode, 0o641);
        assert_eq!(resolved.provenance, ModeProvenance::Forced);
    }

    #[test]
    fn unforcing_falls_back_to_the_default() {
        let mut policy = ModePolicy::default();
        policy.default_dir_mode = 0o530;
        policy.dir_override = None;
        let resolved = policy.dir_mode(None);
        assert_eq!(resolved.mode, 0o530);
        assert_eq!(resolved.provenance, ModeProvenance::Default);
    }

    #[test]
    fn discovered_mode_wins_over_default() {
        let policy = ModePolicy::default();
        let resolved = policy.file_mode(Some(0o100777));
        assert_eq!(resolved.mode, 0o100777);
        assert_eq!(resolved.provenance, ModeProvenance::Discovered);
    }

    #[test]
    fn symlink_type_bits() {
        assert!(is_symlink_mode(0o120777));
        assert!(!is_symlink_mode(0o100644));
        assert!(!is_symlink_mode(0o40755));
    }
}
