use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use tempfile::tempdir;
use zip::ZipArchive;
use zipforge::{
    FilesetManifestMode, InMemoryFileSet, JarBuilder, Manifest, ZipBuilder,
};

// ---------- helpers ----------
fn open_archive(path: &Path) -> ZipArchive<File> {
    ZipArchive::new(File::open(path).expect("open archive")).expect("parse archive")
}

fn entry_names(archive: &mut ZipArchive<File>) -> Vec<String> {
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Vec<u8> {
    let mut entry = archive.by_name(name).expect("entry present");
    let mut data = Vec::new();
    entry.read_to_end(&mut data).expect("read entry");
    data
}

fn read_manifest(path: &Path) -> Manifest {
    let mut archive = open_archive(path);
    let bytes = read_entry(&mut archive, "META-INF/MANIFEST.MF");
    Manifest::parse(&bytes).expect("manifest parses")
}

fn manifest_bytes(build: impl FnOnce(&mut Manifest)) -> Vec<u8> {
    let mut manifest = Manifest::default();
    manifest.main.put("Manifest-Version", "1.0");
    build(&mut manifest);
    manifest.to_bytes()
}

fn classes_fileset() -> InMemoryFileSet {
    let mut set = InMemoryFileSet::new();
    set.add("org/demo/App.class", vec![0xCA, 0xFE, 0xBA, 0xBE], 1_700_000_000);
    set.add("readme.txt", b"hello".to_vec(), 1_700_000_000);
    set
}

#[test]
fn manifest_only_jar_when_empty_is_allowed() {
    let out = tempdir().unwrap();
    let dest = out.path().join("empty.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.zip_mut().create_empty(true);
    jar.build().unwrap();

    let mut archive = open_archive(&dest);
    assert_eq!(entry_names(&mut archive), ["META-INF/", "META-INF/MANIFEST.MF"]);
    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Manifest-Version"), Some("1.0"));
    assert!(manifest.main.get("Created-By").is_some());
}

#[test]
fn minimal_default_manifest_has_no_created_by() {
    let out = tempdir().unwrap();
    let dest = out.path().join("minimal.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.minimal_default_manifest(true);
    jar.zip_mut().create_empty(true);
    jar.build().unwrap();

    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Created-By"), None);
}

#[test]
fn manifest_comes_first_and_content_follows() {
    let out = tempdir().unwrap();
    let dest = out.path().join("app.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.add_fileset(classes_fileset());
    jar.build().unwrap();

    let mut archive = open_archive(&dest);
    let names = entry_names(&mut archive);
    assert_eq!(names[0], "META-INF/");
    assert_eq!(names[1], "META-INF/MANIFEST.MF");
    assert!(names.contains(&"org/demo/App.class".to_string()));
}

#[test]
fn explicit_manifest_file_wins_over_configured_attributes() {
    let out = tempdir().unwrap();
    let manifest_file = out.path().join("MANIFEST.MF");
    fs::write(
        &manifest_file,
        manifest_bytes(|m| m.main.put("Main-Class", "explicit.App")),
    )
    .unwrap();

    let dest = out.path().join("app.jar");
    let mut jar = JarBuilder::new(&dest);
    let mut configured = Manifest::default();
    configured.main.put("Main-Class", "configured.App");
    configured.main.put("Vendor", "demo");
    jar.set_configured_manifest(configured);
    jar.set_manifest_file(&manifest_file).unwrap();
    jar.add_fileset(classes_fileset());
    jar.build().unwrap();

    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Main-Class"), Some("explicit.App"));
    assert_eq!(manifest.main.get("Vendor"), Some("demo"));
}

#[test]
fn missing_manifest_file_fails_at_configuration_time() {
    let mut jar = JarBuilder::new("never-built.jar");
    assert!(jar.set_manifest_file("/no/such/manifest.mf").is_err());
}

#[test]
fn merge_mode_folds_fileset_manifests_in() {
    let out = tempdir().unwrap();
    let dest = out.path().join("merged.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.fileset_manifest_mode(FilesetManifestMode::Merge);

    let mut set = classes_fileset();
    set.add(
        "META-INF/MANIFEST.MF",
        manifest_bytes(|m| {
            m.main.put("Main-Class", "fileset.App");
            m.section_mut("org/demo/").put("Sealed", "true");
        }),
        1_700_000_000,
    );
    jar.add_fileset(set);
    jar.build().unwrap();

    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Main-Class"), Some("fileset.App"));
    assert_eq!(manifest.sections.len(), 1);
    assert_eq!(manifest.sections[0].1.get("Sealed"), Some("true"));

    // The merged manifest replaces the fileset's copy entirely.
    let mut archive = open_archive(&dest);
    let names = entry_names(&mut archive);
    assert_eq!(
        names.iter().filter(|n| *n == "META-INF/MANIFEST.MF").count(),
        1
    );
}

#[test]
fn merge_without_main_takes_only_named_sections() {
    let out = tempdir().unwrap();
    let dest = out.path().join("sections.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.fileset_manifest_mode(FilesetManifestMode::MergeWithoutMain);

    let mut set = classes_fileset();
    set.add(
        "META-INF/MANIFEST.MF",
        manifest_bytes(|m| {
            m.main.put("Main-Class", "fileset.App");
            m.section_mut("org/demo/").put("Sealed", "true");
        }),
        1_700_000_000,
    );
    jar.add_fileset(set);
    jar.build().unwrap();

    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Main-Class"), None);
    assert_eq!(manifest.sections[0].1.get("Sealed"), Some("true"));
}

#[test]
fn skip_mode_stores_fileset_manifests_verbatim() {
    let out = tempdir().unwrap();
    let dest = out.path().join("skip.jar");
    let mut jar = JarBuilder::new(&dest);

    let mut set = classes_fileset();
    set.add(
        "META-INF/MANIFEST.MF",
        manifest_bytes(|m| m.main.put("Main-Class", "fileset.App")),
        1_700_000_000,
    );
    jar.add_fileset(set);
    jar.build().unwrap();

    // Both the generated manifest and the fileset's copy end up stored.
    let mut archive = open_archive(&dest);
    let names = entry_names(&mut archive);
    assert_eq!(
        names.iter().filter(|n| *n == "META-INF/MANIFEST.MF").count(),
        2
    );
    // The generated one sits right after the META-INF/ directory.
    let mut bytes = Vec::new();
    archive.by_index(1).unwrap().read_to_end(&mut bytes).unwrap();
    let generated = Manifest::parse(&bytes).unwrap();
    assert_eq!(generated.main.get("Main-Class"), None);
}

#[test]
fn update_keeps_the_destination_manifest() {
    let out = tempdir().unwrap();
    let dest = out.path().join("upd.jar");

    let mut jar = JarBuilder::new(&dest);
    let mut configured = Manifest::default();
    configured.main.put("Main-Class", "original.App");
    jar.set_configured_manifest(configured);
    jar.add_fileset(classes_fileset());
    jar.build().unwrap();

    let mut jar = JarBuilder::new(&dest);
    jar.zip_mut().update(true);
    let mut set = InMemoryFileSet::new();
    set.add("extra.txt", b"extra".to_vec(), 1_700_000_000);
    jar.add_fileset(set);
    jar.build().unwrap();

    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Main-Class"), Some("original.App"));
    let mut archive = open_archive(&dest);
    assert_eq!(read_entry(&mut archive, "extra.txt"), b"extra");
    assert_eq!(
        read_entry(&mut archive, "org/demo/App.class"),
        [0xCA, 0xFE, 0xBA, 0xBE]
    );
}

#[test]
fn generated_index_lists_packages_and_root_files() {
    let out = tempdir().unwrap();
    let dest = out.path().join("indexed.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.index(true);
    jar.add_fileset(classes_fileset());
    jar.build().unwrap();

    let mut archive = open_archive(&dest);
    let names = entry_names(&mut archive);
    assert_eq!(names.last().map(String::as_str), Some("META-INF/INDEX.LIST"));

    let body = read_entry(&mut archive, "META-INF/INDEX.LIST");
    let text = String::from_utf8(body).unwrap();
    assert_eq!(
        text,
        "JarIndex-Version: 1.0\n\nindexed.jar\norg\nreadme.txt\n\n"
    );
}

#[test]
fn stale_index_entries_are_replaced() {
    let out = tempdir().unwrap();
    let dest = out.path().join("reindexed.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.index(true);

    let mut set = classes_fileset();
    set.add("META-INF/INDEX.LIST", b"JarIndex-Version: 1.0\n\nstale\n".to_vec(), 1_700_000_000);
    jar.add_fileset(set);
    jar.build().unwrap();

    let mut archive = open_archive(&dest);
    let names = entry_names(&mut archive);
    assert_eq!(
        names.iter().filter(|n| *n == "META-INF/INDEX.LIST").count(),
        1
    );
    let text = String::from_utf8(read_entry(&mut archive, "META-INF/INDEX.LIST")).unwrap();
    assert!(!text.contains("stale"));
    assert!(text.starts_with("JarIndex-Version: 1.0\n"));
}

#[test]
fn index_covers_classpath_archives() {
    let out = tempdir().unwrap();
    fs::create_dir(out.path().join("lib")).unwrap();
    let dep = out.path().join("lib").join("dep.jar");
    let mut builder = ZipBuilder::new(&dep);
    let mut set = InMemoryFileSet::new();
    set.add("com/dep/Lib.class", vec![0xCA, 0xFE], 1_700_000_000);
    builder.add_fileset(set);
    builder.build().unwrap();

    let dest = out.path().join("main.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.index(true);
    jar.add_index_jar(&dep);
    let mut configured = Manifest::default();
    configured.main.put("Class-Path", "lib/dep.jar");
    jar.set_configured_manifest(configured);
    jar.add_fileset(classes_fileset());
    jar.build().unwrap();

    let mut archive = open_archive(&dest);
    let text = String::from_utf8(read_entry(&mut archive, "META-INF/INDEX.LIST")).unwrap();
    assert!(
        text.contains("\nlib/dep.jar\ncom\n"),
        "missing class-path block in:\n{}",
        text
    );
}

#[test]
fn manifest_file_can_come_from_another_archive() {
    let out = tempdir().unwrap();
    let donor = out.path().join("donor.jar");
    let mut jar = JarBuilder::new(&donor);
    let mut configured = Manifest::default();
    configured.main.put("Main-Class", "donor.App");
    jar.set_configured_manifest(configured);
    jar.zip_mut().create_empty(true);
    jar.build().unwrap();

    let dest = out.path().join("receiver.jar");
    let mut jar = JarBuilder::new(&dest);
    jar.set_manifest_file(&donor).unwrap();
    jar.add_fileset(classes_fileset());
    jar.build().unwrap();

    let manifest = read_manifest(&dest);
    assert_eq!(manifest.main.get("Main-Class"), Some("donor.App"));
}
