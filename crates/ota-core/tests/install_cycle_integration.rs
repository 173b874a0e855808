use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use ota_core::{
    ArchiveInstaller, BackupManager, FirmwareVersion, IntegrityError, MANIFEST_NAME,
    UpdateApplier, UpdateStateStore, VersionRecord,
};
use ota_platform::DevicePaths;
use ota_platform::fake::FakeReset;
use sha2::{Digest, Sha256};

fn firmware_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let manifest: serde_json::Map<String, serde_json::Value> = files
        .iter()
        .map(|(path, data)| {
            (
                (*path).to_string(),
                format!("{:x}", Sha256::digest(data)).into(),
            )
        })
        .collect();
    let manifest = serde_json::to_vec(&manifest).expect("manifest should serialize");

    let mut builder = tar::Builder::new(Vec::new());
    let mut entries: Vec<(&str, &[u8])> = vec![(MANIFEST_NAME, manifest.as_slice())];
    entries.extend_from_slice(files);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, path, data)
            .expect("entry should be appended");
    }
    let tar = builder.into_inner().expect("tar should finish");

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).expect("tar should compress");
    encoder.finish().expect("zlib stream should finish")
}

struct Device {
    _dir: tempfile::TempDir,
    paths: DevicePaths,
}

impl Device {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = DevicePaths::at(dir.path());
        paths.ensure_dirs().expect("device directories should be created");
        Self { _dir: dir, paths }
    }

    fn write_live(&self, relative: &str, contents: &str) {
        let path = self.paths.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent directory should be created");
        }
        std::fs::write(path, contents).expect("live file should be written");
    }

    fn read_live(&self, relative: &str) -> String {
        std::fs::read_to_string(self.paths.root.join(relative)).expect("live file should exist")
    }
}

#[test]
fn staged_archive_is_applied_and_can_be_restored() {
    let device = Device::new();
    device.write_live("main.py", "old main");
    device.write_live("lib/driver.py", "old driver");
    let record = VersionRecord::new(device.paths.version_file());
    let installed = FirmwareVersion::new(1, 0, 0);
    record.write(&installed).expect("version record should be written");

    let archive = firmware_archive(&[
        ("main.py", b"new main"),
        ("lib/driver.py", b"new driver"),
        ("lib/extra.py", b"brand new"),
    ]);
    std::fs::write(device.paths.download_file(), archive).expect("archive should be written");

    let installer = ArchiveInstaller::new(vec!["main.py".to_string()]);
    let manifest = installer
        .stage(&device.paths.download_file(), &device.paths.staging_dir())
        .expect("archive should stage");
    assert_eq!(manifest.len(), 3);
    assert_eq!(device.read_live("main.py"), "old main");

    let backup = BackupManager::new(device.paths.root.clone(), device.paths.backup_dir());
    let state = UpdateStateStore::new(device.paths.flag_file());
    state.begin().expect("flag should be created");
    let reset = FakeReset::new();
    let target = FirmwareVersion::new(1, 1, 0);

    UpdateApplier::new(&device.paths.root, &backup, &record, &state, &reset)
        .apply(&device.paths.staging_dir(), &manifest, &installed, &target)
        .expect("apply should succeed");

    assert_eq!(device.read_live("main.py"), "new main");
    assert_eq!(device.read_live("lib/driver.py"), "new driver");
    assert_eq!(device.read_live("lib/extra.py"), "brand new");
    assert_eq!(record.read(), target);
    assert!(!device.paths.flag_file().exists());
    assert!(!device.paths.staging_dir().exists());
    assert_eq!(reset.resets(), 1);

    let set = backup
        .load()
        .expect("backup index should be readable")
        .expect("backup set should exist");
    assert_eq!(set.previous_version(), Some(installed));
    backup.restore(&set).expect("restore should succeed");

    assert_eq!(device.read_live("main.py"), "old main");
    assert_eq!(device.read_live("lib/driver.py"), "old driver");
    assert!(!device.paths.root.join("lib/extra.py").exists());
}

#[test]
fn archive_missing_required_file_is_refused() {
    let device = Device::new();
    let archive = firmware_archive(&[("lib/driver.py", b"driver")]);
    std::fs::write(device.paths.download_file(), archive).expect("archive should be written");

    let installer = ArchiveInstaller::new(vec!["boot.py".to_string(), "main.py".to_string()]);
    let error = installer
        .stage(&device.paths.download_file(), &device.paths.staging_dir())
        .expect_err("staging should fail");

    assert!(matches!(error, IntegrityError::MissingRequired { .. }), "{error}");
    let leftovers = std::fs::read_dir(device.paths.staging_dir())
        .map(Iterator::count)
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}
