//! Mounting real archives from disk through the filesystem.

use std::error::Error as StdError;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use packfs::formats::ReadWriteZipFile;
use packfs::{
    hash_filename, Error, FileSystem, FileSystemConfig, Package, PackageHashType, WritablePackage,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

type TestResult = Result<(), Box<dyn StdError>>;

fn read_all(fs: &FileSystem, name: &str) -> Result<Vec<u8>, Box<dyn StdError>> {
    let mut out = Vec::new();
    fs.open(name)?.read_to_end(&mut out)?;
    Ok(out)
}

fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
}

/// A Tiberian Dawn style mix: no flags word, names only by hash.
fn cnc_mix(files: &[(&str, &[u8])]) -> Vec<u8> {
    let total: usize = files.iter().map(|(_, b)| b.len()).sum();
    let mut out = Vec::new();
    out.extend_from_slice(&(files.len() as u16).to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());

    let mut offset = 0u32;
    for (name, bytes) in files {
        out.extend_from_slice(&hash_filename(name, PackageHashType::Classic).to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        offset += bytes.len() as u32;
    }
    for (_, bytes) in files {
        out.extend_from_slice(bytes);
    }
    out
}

fn global_database(names: &[&str]) -> Vec<u8> {
    let mut out = (names.len() as i32).to_le_bytes().to_vec();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(b"description\0");
    }
    out
}

#[test]
fn test_later_directory_overrides_earlier() -> TestResult {
    let root = TempDir::new()?;
    write(root.path(), "base/rules.yaml", b"base")?;
    write(root.path(), "base/only-base.txt", b"kept")?;
    write(root.path(), "patch/rules.yaml", b"patched")?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("base", None)?;
    let patch = fs.mount("patch", None)?.ok_or("patch not mounted")?;

    assert_eq!(read_all(&fs, "rules.yaml")?, b"patched");
    assert_eq!(read_all(&fs, "only-base.txt")?, b"kept");

    assert!(fs.unmount(&patch));
    assert_eq!(read_all(&fs, "rules.yaml")?, b"base");
    Ok(())
}

#[test]
fn test_missing_names() -> TestResult {
    let root = TempDir::new()?;
    write(root.path(), "content/a.txt", b"a")?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", Some("content"))?;

    assert!(!fs.exists("b.txt"));
    assert!(!fs.exists("content|b.txt"));
    assert!(matches!(fs.open("b.txt"), Err(Error::NotFound(name)) if name == "b.txt"));

    // Mount failures propagate unless the mount is optional.
    assert!(fs.mount("missing.mix", None).is_err());
    assert!(fs.mount("~missing.mix", None)?.is_none());
    Ok(())
}

#[test]
fn test_mix_inside_directory_uses_global_database() -> TestResult {
    let root = TempDir::new()?;
    let content = root.path().join("content");
    let mix = cnc_mix(&[("rules.ini", b"[General]"), ("art.ini", b"[Art]")]);
    write(&content, "conquer.mix", &mix)?;
    write(&content, "global mix database.dat", &global_database(&["rules.ini", "art.ini"]))?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", None)?;
    let mix = fs.mount("conquer.mix", Some("conquer"))?.ok_or("mix not mounted")?;

    let mut contents = mix.contents();
    contents.sort();
    assert_eq!(contents, ["art.ini", "rules.ini"]);
    assert_eq!(read_all(&fs, "rules.ini")?, b"[General]");
    assert_eq!(read_all(&fs, "conquer|art.ini")?, b"[Art]");
    assert_eq!(fs.prefix_of(&mix), Some("conquer"));
    Ok(())
}

#[test]
fn test_bag_reads_its_index_through_the_filesystem() -> TestResult {
    let root = TempDir::new()?;
    let content = root.path().join("content");

    let mut idx = b"GABA".to_vec();
    idx.extend_from_slice(&2u32.to_le_bytes());
    idx.extend_from_slice(&1u32.to_le_bytes());
    let mut name = [0u8; 16];
    name[..6].copy_from_slice(b"ibeepa");
    idx.extend_from_slice(&name);
    for field in [0u32, 4, 22050, 0, 0] {
        idx.extend_from_slice(&field.to_le_bytes());
    }
    write(&content, "audio.idx", &idx)?;
    write(&content, "audio.bag", b"\x01\x02\x03\x04")?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", None)?;
    fs.mount("audio.bag", None)?;

    assert_eq!(read_all(&fs, "ibeepa.wav")?, b"\x01\x02\x03\x04");
    Ok(())
}

#[test]
fn test_bag_without_index_fails() -> TestResult {
    let root = TempDir::new()?;
    write(root.path(), "content/audio.bag", b"data")?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", None)?;
    assert!(matches!(
        fs.mount("audio.bag", None),
        Err(Error::NotFound(name)) if name == "audio.idx"
    ));
    Ok(())
}

#[test]
fn test_zip_folders() -> TestResult {
    let root = TempDir::new()?;
    let content = root.path().join("content");
    fs::create_dir_all(&content)?;

    let mut writer = ZipWriter::new(fs::File::create(content.join("pack.zip"))?);
    let options = SimpleFileOptions::default();
    writer.add_directory("maps/", options)?;
    writer.start_file("maps/desert.map", options)?;
    writer.write_all(b"sand")?;
    writer.start_file("mod.yaml", options)?;
    writer.write_all(b"id: pack")?;
    writer.finish()?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", None)?;
    fs.mount("pack.zip", Some("pack"))?;

    assert_eq!(read_all(&fs, "mod.yaml")?, b"id: pack");
    assert_eq!(read_all(&fs, "pack|maps/desert.map")?, b"sand");

    let maps = fs.open_package("pack|maps")?.ok_or("folder not opened")?;
    assert_eq!(maps.contents(), ["desert.map"]);
    let mut out = Vec::new();
    maps.get_stream("desert.map")?
        .ok_or("missing entry")?
        .read_to_end(&mut out)?;
    assert_eq!(out, b"sand");

    // Mounting the folder makes its files visible at the top level.
    fs.mount("pack|maps", None)?;
    assert_eq!(read_all(&fs, "desert.map")?, b"sand");
    Ok(())
}

#[test]
fn test_writable_packages_round_trip() -> TestResult {
    let root = TempDir::new()?;
    fs::create_dir_all(root.path().join("user"))?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    let user = fs.mount("user", Some("user"))?.ok_or("user not mounted")?;
    let writable = user.as_writable().ok_or("directory is not writable")?;

    writable.update("settings/keys.yaml", b"fire: space")?;
    assert_eq!(read_all(&fs, "user|settings/keys.yaml")?, b"fire: space");
    assert_eq!(read_all(&fs, "settings/keys.yaml")?, b"fire: space");

    writable.delete("settings/keys.yaml")?;
    assert!(!fs.exists("user|settings/keys.yaml"));

    let path = root.path().join("save.zip");
    let archive = ReadWriteZipFile::create(Some(path.clone()))?;
    archive.update("slot1.sav", b"turn 12")?;
    archive.update("slot2.sav", b"turn 40")?;
    archive.delete("slot1.sav")?;
    drop(archive);

    let reopened = ReadWriteZipFile::open(&path)?;
    assert_eq!(reopened.contents(), ["slot2.sav"]);
    let mut out = Vec::new();
    reopened
        .get_stream("slot2.sav")?
        .ok_or("missing save")?
        .read_to_end(&mut out)?;
    assert_eq!(out, b"turn 40");
    Ok(())
}

#[test]
fn test_load_packages_replaces_mounts() -> TestResult {
    let root = TempDir::new()?;
    write(root.path(), "one/a.txt", b"one")?;
    write(root.path(), "two/b.txt", b"two")?;
    write(root.path(), "support/c.txt", b"support")?;

    let config = FileSystemConfig::new(root.path()).with_support_dir(root.path().join("support"));
    let mut fs = FileSystem::new(config);
    fs.mount("one", Some("one"))?;

    fs.load_packages([("two", Some("two")), ("^", None), ("~absent", None)])?;
    assert_eq!(fs.mounted_packages().len(), 2);
    assert!(!fs.exists("a.txt"));
    assert!(!fs.exists("one|a.txt"));
    assert_eq!(read_all(&fs, "two|b.txt")?, b"two");
    assert_eq!(read_all(&fs, "c.txt")?, b"support");
    Ok(())
}

fn zip_bytes(files: &[(&str, &[u8])]) -> Result<Vec<u8>, Box<dyn StdError>> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, bytes) in files {
        writer.start_file(*name, SimpleFileOptions::default())?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

#[test]
fn test_zip_inside_zip() -> TestResult {
    let root = TempDir::new()?;
    let inner = zip_bytes(&[("deep.txt", b"deep")])?;
    let outer = zip_bytes(&[("inner.zip", inner.as_slice()), ("top.txt", b"top")])?;
    write(root.path(), "content/outer.zip", &outer)?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", None)?;
    fs.mount("outer.zip", Some("outer"))?;

    let nested = fs.open_package("outer|inner.zip")?.ok_or("nested zip not opened")?;
    assert_eq!(nested.contents(), ["deep.txt"]);

    fs.mount_package(nested, Some("inner"))?;
    assert_eq!(read_all(&fs, "inner|deep.txt")?, b"deep");
    assert_eq!(read_all(&fs, "deep.txt")?, b"deep");
    assert_eq!(read_all(&fs, "outer|top.txt")?, b"top");
    Ok(())
}

#[test]
fn test_native_mounts_ignore_case() -> TestResult {
    let root = TempDir::new()?;
    let mix = cnc_mix(&[("rules.ini", b"[General]")]);
    write(root.path(), "Content/CONQUER.MIX", &mix)?;
    write(root.path(), "Content/global mix database.dat", &global_database(&["rules.ini"]))?;

    let mut fs = FileSystem::new(FileSystemConfig::new(root.path()));
    fs.mount("content", None)?;
    fs.mount("content/conquer.mix", Some("conquer"))?;
    assert_eq!(read_all(&fs, "conquer|rules.ini")?, b"[General]");
    Ok(())
}
