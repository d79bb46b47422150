//! JAR manifest model: parse, merge, and serialize.
//!
//! A manifest is a main attribute block followed by named sections. Attribute
//! names compare case-insensitively but keep their first-seen spelling, and
//! insertion order is preserved through every parse/merge/write cycle. Output
//! uses CRLF line endings and folds long lines at 72 bytes with leading-space
//! continuations, so a manifest survives a write/parse round trip unchanged.

use std::io::Write;

use crate::error::{ArchiverError, Result};

const MAX_LINE_BYTES: usize = 72;

/// An ordered attribute map with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    items: Vec<(String, String)>,
}

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Sets an attribute, replacing an existing one in place so that its
    /// position in the section is preserved.
    pub fn put(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.items {
            if n.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.items.push((name.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A complete manifest: main attributes plus ordered named sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub main: Attributes,
    pub sections: Vec<(String, Attributes)>,
    /// Non-fatal oddities observed while parsing or merging.
    pub warnings: Vec<String>,
}

/// The manifest every archive starts from when nothing else is configured.
pub fn default_manifest(minimal: bool) -> Manifest {
    let mut manifest = Manifest::default();
    manifest.main.put("Manifest-Version", "1.0");
    if !minimal {
        manifest.main.put(
            "Created-By",
            concat!("zipforge ", env!("CARGO_PKG_VERSION")),
        );
    }
    manifest
}

impl Manifest {
    /// Parses manifest bytes. Malformed attribute lines and non-UTF-8 input
    /// are fatal; ignorable oddities are recorded as warnings instead.
    pub fn parse(bytes: &[u8]) -> Result<Manifest> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ArchiverError::ManifestParse("manifest is not valid UTF-8".into()))?;

        let mut manifest = Manifest::default();
        let mut current: Vec<(String, String)> = Vec::new();
        let mut blocks: Vec<Vec<(String, String)>> = Vec::new();

        for raw in text.lines() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                if !current.is_empty() {
                    blocks.push(std::mem::take(&mut current));
                }
                continue;
            }
            if let Some(cont) = line.strip_prefix(' ') {
                match current.last_mut() {
                    Some((_, value)) => value.push_str(cont),
                    None => {
                        return Err(ArchiverError::ManifestParse(
                            "continuation line with no attribute to continue".into(),
                        ))
                    }
                }
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ArchiverError::ManifestParse(format!("malformed attribute line '{line}'"))
            })?;
            if name.is_empty() {
                return Err(ArchiverError::ManifestParse(format!(
                    "attribute with empty name in line '{line}'"
                )));
            }
            let value = value.strip_prefix(' ').unwrap_or(value);
            current.push((name.to_string(), value.to_string()));
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        let mut blocks = blocks.into_iter();
        if let Some(main) = blocks.next() {
            for (name, value) in main {
                if manifest.main.get(&name).is_some() {
                    manifest
                        .warnings
                        .push(format!("duplicate attribute '{name}', keeping the later value"));
                }
                manifest.main.put(&name, &value);
            }
        }
        for block in blocks {
            let mut attrs = block.into_iter();
            let Some((first_name, section_name)) = attrs.next() else {
                continue;
            };
            if !first_name.eq_ignore_ascii_case("Name") {
                manifest.warnings.push(format!(
                    "section starting with '{first_name}' instead of 'Name' was ignored"
                ));
                continue;
            }
            let mut duplicates = Vec::new();
            let section = manifest.section_mut(&section_name);
            for (name, value) in attrs {
                if section.get(&name).is_some() {
                    duplicates.push(format!(
                        "duplicate attribute '{name}' in section '{section_name}', keeping the later value"
                    ));
                }
                section.put(&name, &value);
            }
            manifest.warnings.extend(duplicates);
        }
        Ok(manifest)
    }

    /// Returns the attributes of the named section, creating it at the end
    /// of the section list when absent. Name lookup is case-insensitive.
    pub fn section_mut(&mut self, name: &str) -> &mut Attributes {
        let pos = self
            .sections
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name));
        match pos {
            Some(i) => &mut self.sections[i].1,
            None => {
                self.sections.push((name.to_string(), Attributes::default()));
                // Just pushed, so the list is non-empty.
                let last = self.sections.len() - 1;
                &mut self.sections[last].1
            }
        }
    }

    /// Folds `other` into `self`. Attributes from `other` win on conflicts;
    /// the main section participates only when `merge_main` is set.
    pub fn merge_from(&mut self, other: &Manifest, merge_main: bool) {
        if merge_main {
            for (name, value) in other.main.iter() {
                self.main.put(name, value);
            }
        }
        for (section_name, attrs) in &other.sections {
            let section = self.section_mut(section_name);
            for (name, value) in attrs.iter() {
                section.put(name, value);
            }
        }
        self.warnings.extend(other.warnings.iter().cloned());
    }

    /// Serializes the manifest with CRLF endings and 72-byte line folding.
    /// `Manifest-Version` is always emitted first when present.
    pub fn write<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        if let Some(version) = self.main.get("Manifest-Version") {
            write_attribute(out, "Manifest-Version", version)?;
        }
        for (name, value) in self.main.iter() {
            if !name.eq_ignore_ascii_case("Manifest-Version") {
                write_attribute(out, name, value)?;
            }
        }
        out.write_all(b"\r\n")?;
        for (section_name, attrs) in &self.sections {
            write_attribute(out, "Name", section_name)?;
            for (name, value) in attrs.iter() {
                if !name.eq_ignore_ascii_case("Name") {
                    write_attribute(out, name, value)?;
                }
            }
            out.write_all(b"\r\n")?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut buf);
        buf
    }
}

/// Writes one `Name: value` line, folding at 72 bytes (including the CRLF)
/// with single-space continuation lines, never splitting a UTF-8 character.
fn write_attribute<W: Write>(out: &mut W, name: &str, value: &str) -> std::io::Result<()> {
    let mut line = format!("{name}: {value}");
    let mut first = true;
    loop {
        let limit = if first {
            MAX_LINE_BYTES - 2
        } else {
            MAX_LINE_BYTES - 3
        };
        if line.len() <= limit {
            if !first {
                out.write_all(b" ")?;
            }
            out.write_all(line.as_bytes())?;
            out.write_all(b"\r\n")?;
            return Ok(());
        }
        let mut cut = limit;
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        if !first {
            out.write_all(b" ")?;
        }
        out.write_all(line[..cut].as_bytes())?;
        out.write_all(b"\r\n")?;
        line = line.split_off(cut);
        first = false;
    }
}
