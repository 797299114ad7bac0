//! Floppy controller driven through its registers, the way the guest
//! format and copy routines drive the hardware.

use eurocom_emu::{
    AccessMode, DiskContainer, FloppyController, ImageFormat, IoDevice,
};
use eurocom_emu::disk::image::format_disk;
use tempfile::tempdir;
use test_log::test;

const STATUS_BUSY: u8 = 0x01;
const STATUS_WRITE_PROTECT: u8 = 0x40;
const STATUS_NOT_READY: u8 = 0x80;

fn fdc_with_disk() -> (tempfile::TempDir, FloppyController) {
    let dir = tempdir().unwrap();
    format_disk(dir.path(), "WORK.DSK", 35, 10, ImageFormat::Dsk, None).unwrap();
    let mut fdc = FloppyController::new(dir.path());
    fdc.mount_drive("WORK.DSK", 0, AccessMode::ReadWrite).unwrap();
    fdc.write_io(4, 0x01);
    (dir, fdc)
}

#[test]
fn write_track_state_machine_writes_addressed_sector() {
    let (_dir, mut fdc) = fdc_with_disk();

    // CMD_WRITETRACK
    fdc.write_io(0, 0xF0);
    assert_ne!(fdc.read_io(0) & STATUS_BUSY, 0);

    // ID address mark: track 5, side 0, sector 3, size code 1 (256).
    fdc.write_io(3, 0xFE);
    for id in [5u8, 0, 3, 1] {
        fdc.write_io(3, id);
    }
    // Data address mark, then one sector of payload.
    fdc.write_io(3, 0xFB);
    for i in 0..256u16 {
        fdc.write_io(3, (i ^ 0x5A) as u8);
    }
    // Two CRC filler bytes complete the sector.
    fdc.write_io(3, 0xF7);
    fdc.write_io(3, 0xF7);

    assert_eq!(fdc.read_io(0) & STATUS_BUSY, 0, "busy drops at end");

    let sector = fdc
        .drive_container(0)
        .expect("mounted")
        .read_sector(5, 3)
        .unwrap();
    let expected: Vec<u8> = (0..256u16).map(|i| (i ^ 0x5A) as u8).collect();
    assert_eq!(sector, expected);
}

#[test]
fn write_track_ignores_gap_bytes_between_sectors() {
    let (_dir, mut fdc) = fdc_with_disk();

    fdc.write_io(0, 0xF0);
    // Format routines emit gap/sync filler before the address mark.
    for _ in 0..32 {
        fdc.write_io(3, 0x4E);
    }
    fdc.write_io(3, 0xFE);
    for id in [2u8, 0, 7, 1] {
        fdc.write_io(3, id);
    }
    // More filler between ID and data mark.
    for _ in 0..16 {
        fdc.write_io(3, 0x4E);
    }
    fdc.write_io(3, 0xFB);
    for _ in 0..256 {
        fdc.write_io(3, 0xD1);
    }
    fdc.write_io(3, 0xF7);
    fdc.write_io(3, 0xF7);

    let sector = fdc
        .drive_container(0)
        .expect("mounted")
        .read_sector(2, 7)
        .unwrap();
    assert!(sector.iter().all(|&b| b == 0xD1));
}

#[test]
fn write_track_formats_consecutive_sectors() {
    let (_dir, mut fdc) = fdc_with_disk();

    fdc.write_io(0, 0xF0);
    for sector in 1..=3u8 {
        fdc.write_io(3, 0xFE);
        for id in [9u8, 0, sector, 1] {
            fdc.write_io(3, id);
        }
        fdc.write_io(3, 0xFB);
        for _ in 0..256 {
            fdc.write_io(3, sector);
        }
        fdc.write_io(3, 0xF7);
        fdc.write_io(3, 0xF7);
    }

    let container = fdc.drive_container(0).expect("mounted");
    for sector in 1..=3u8 {
        let data = container.read_sector(9, sector).unwrap();
        assert!(data.iter().all(|&b| b == sector));
    }
}

#[test]
fn write_track_on_protected_disk_sets_status_only() {
    let dir = tempdir().unwrap();
    format_disk(dir.path(), "RO.DSK", 35, 10, ImageFormat::Dsk, None).unwrap();
    let mut fdc = FloppyController::new(dir.path());
    fdc.mount_drive("RO.DSK", 0, AccessMode::ReadOnly).unwrap();
    fdc.write_io(4, 0x01);

    fdc.write_io(0, 0xF0);
    let status = fdc.read_io(0);
    assert_ne!(status & STATUS_WRITE_PROTECT, 0);
    assert_eq!(status & STATUS_BUSY, 0);
}

#[test]
fn sector_copy_through_registers() {
    let (_dir, mut fdc) = fdc_with_disk();

    // Read the system information sector...
    fdc.write_io(1, 0);
    fdc.write_io(2, 3);
    fdc.write_io(0, 0x80);
    let sis: Vec<u8> = (0..256).map(|_| fdc.read_io(3)).collect();

    // ...and copy it to a scratch sector.
    fdc.write_io(1, 3);
    fdc.write_io(2, 1);
    fdc.write_io(0, 0xA0);
    for &b in &sis {
        fdc.write_io(3, b);
    }
    assert_eq!(fdc.read_io(0) & STATUS_BUSY, 0);

    let copy = fdc
        .drive_container(0)
        .expect("mounted")
        .read_sector(3, 1)
        .unwrap();
    assert_eq!(copy, sis);
}

#[test]
fn directory_mount_serves_sectors() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("BOOT.CMD"), vec![0x7E; 300]).unwrap();

    let mut fdc = FloppyController::new(dir.path());
    fdc.mount_drive(dir.path().to_str().unwrap(), 2, AccessMode::ReadWrite)
        .unwrap();
    fdc.write_io(4, 0x04);

    // The synthesized image exposes a regular FLEX layout: the SIS is
    // readable through the registers.
    fdc.write_io(1, 0);
    fdc.write_io(2, 3);
    fdc.write_io(0, 0x80);
    let sis: Vec<u8> = (0..256).map(|_| fdc.read_io(3)).collect();
    assert_ne!(sis[38], 0, "geometry trailer present");

    // And the host file is visible as a directory entry.
    match fdc.drive_container(2).expect("mounted") {
        DiskContainer::Directory(container) => {
            let entries = container.iter_directory().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].file_name(), "BOOT.CMD");
        }
        DiskContainer::Image(_) => panic!("expected a directory container"),
    }
}

#[test]
fn unmounted_drive_reports_not_ready() {
    let dir = tempdir().unwrap();
    let mut fdc = FloppyController::new(dir.path());
    fdc.write_io(4, 0x02);

    fdc.write_io(0, 0x80);
    let status = fdc.read_io(0);
    assert_ne!(status & STATUS_NOT_READY, 0);
    assert_eq!(fdc.read_io(3), 0x00, "no data to stream");
}
