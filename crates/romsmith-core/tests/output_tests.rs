use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tempfile::tempdir;

use romsmith_core::catalog::CatalogEntry;
use romsmith_core::output::{create_writer, OutputFormat, WriteOutcome};
use romsmith_core::Error;

fn entry(set: &str, name: &str) -> CatalogEntry {
    CatalogEntry {
        name: name.to_string(),
        set_name: set.to_string(),
        crc32: Some("00000000".to_string()),
        date: Some("2004-05-06 07:08:09".to_string()),
        ..Default::default()
    }
}

/// Writes the same three members into `out` in the given order.
fn write_set(format: OutputFormat, out: &Path, sources: &Path, order: &[&str]) {
    let writer = create_writer(format, out, None, false).unwrap();
    for name in order {
        let outcome = writer
            .write(&entry("Canonical Set", name), &sources.join(name))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }
}

fn make_sources(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("b.rom"), vec![0x42u8; 10_000]).unwrap();
    fs::write(dir.join("A.rom"), b"first by lowercase name").unwrap();
    fs::write(dir.join("c.rom"), (0..=255u8).cycle().take(4096).collect::<Vec<_>>()).unwrap();
}

#[test]
fn test_zip_output_is_byte_reproducible() {
    let tmp = tempdir().unwrap();
    let sources = tmp.path().join("src");
    make_sources(&sources);

    write_set(OutputFormat::ZipFamily, &tmp.path().join("one"), &sources, &["c.rom", "A.rom", "b.rom"]);
    write_set(OutputFormat::ZipFamily, &tmp.path().join("two"), &sources, &["b.rom", "c.rom", "A.rom"]);

    let one = fs::read(tmp.path().join("one/Canonical Set.zip")).unwrap();
    let two = fs::read(tmp.path().join("two/Canonical Set.zip")).unwrap();
    assert_eq!(one, two);

    let mut archive = zip::ZipArchive::new(File::open(tmp.path().join("one/Canonical Set.zip")).unwrap()).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["A.rom", "b.rom", "c.rom"]);

    let mut member = archive.by_name("b.rom").unwrap();
    assert_eq!(member.compression(), zip::CompressionMethod::Deflated);
    let mut data = Vec::new();
    member.read_to_end(&mut data).unwrap();
    assert_eq!(data, vec![0x42u8; 10_000]);
}

#[test]
fn test_tar_output_is_byte_reproducible() {
    let tmp = tempdir().unwrap();
    let sources = tmp.path().join("src");
    make_sources(&sources);

    write_set(OutputFormat::TapeArchive, &tmp.path().join("one"), &sources, &["A.rom", "b.rom", "c.rom"]);
    write_set(OutputFormat::TapeArchive, &tmp.path().join("two"), &sources, &["c.rom", "b.rom", "A.rom"]);

    let one = fs::read(tmp.path().join("one/Canonical Set.tar")).unwrap();
    let two = fs::read(tmp.path().join("two/Canonical Set.tar")).unwrap();
    assert_eq!(one, two);

    let mut archive = tar::Archive::new(File::open(tmp.path().join("one/Canonical Set.tar")).unwrap());
    for item in archive.entries().unwrap() {
        let item = item.unwrap();
        let header = item.header();
        assert_eq!(header.mtime().unwrap(), 0);
        assert_eq!(header.mode().unwrap(), 0o644);
        assert_eq!(header.uid().unwrap(), 0);
        assert_eq!(header.gid().unwrap(), 0);
    }
}

#[test]
fn test_tar_preserves_catalog_date_when_asked() {
    let tmp = tempdir().unwrap();
    let source = tmp.path().join("a.rom");
    fs::write(&source, b"dated").unwrap();
    let writer = create_writer(OutputFormat::TapeArchive, &tmp.path().join("out"), None, true).unwrap();
    writer.write(&entry("Dated", "a.rom"), &source).unwrap();

    let mut archive = tar::Archive::new(File::open(tmp.path().join("out/Dated.tar")).unwrap());
    let item = archive.entries().unwrap().next().unwrap().unwrap();
    // 2004-05-06 07:08:09 UTC
    assert_eq!(item.header().mtime().unwrap(), 1_083_827_289);
}

#[test]
fn test_archive_writers_reject_escaping_names() {
    let tmp = tempdir().unwrap();
    let source = tmp.path().join("a.rom");
    fs::write(&source, b"x").unwrap();

    for format in [OutputFormat::ZipFamily, OutputFormat::TapeArchive, OutputFormat::Folder] {
        let writer = create_writer(format, &tmp.path().join("out"), None, false).unwrap();
        assert!(matches!(
            writer.write(&entry("Set", "../../etc/passwd"), &source),
            Err(Error::Write { .. })
        ));
        assert!(matches!(
            writer.write(&entry("Set", "/abs/path.rom"), &source),
            Err(Error::Write { .. })
        ));
    }
}

#[test]
fn test_depot_writer_needs_depot() {
    let tmp = tempdir().unwrap();
    assert!(create_writer(OutputFormat::ContentAddressed, tmp.path(), None, false).is_err());
}

#[test]
fn test_concurrent_writes_to_one_set() {
    let tmp = tempdir().unwrap();
    let sources = tmp.path().join("src");
    fs::create_dir_all(&sources).unwrap();
    let names: Vec<String> = (0..16).map(|i| format!("{:02}.rom", i)).collect();
    for name in &names {
        fs::write(sources.join(name), name.as_bytes()).unwrap();
    }

    let writer = create_writer(OutputFormat::ZipFamily, &tmp.path().join("out"), None, false).unwrap();
    std::thread::scope(|scope| {
        for name in &names {
            let writer = &writer;
            let sources = &sources;
            scope.spawn(move || {
                writer.write(&entry("Shared", name), &sources.join(name)).unwrap();
            });
        }
    });

    let archive = zip::ZipArchive::new(File::open(tmp.path().join("out/Shared.zip")).unwrap()).unwrap();
    assert_eq!(archive.len(), 16);
}
