//! Formatting and mount/remount behaviour of packed images.

use eurocom_emu::disk::flex::SysInfoSector;
use eurocom_emu::{format_disk, AccessMode, ImageContainer, ImageFormat};
use tempfile::tempdir;
use test_log::test;

#[test]
fn format_dsk_creates_exact_file_size() {
    let dir = tempdir().unwrap();
    let path = format_disk(dir.path(), "TEST.DSK", 35, 10, ImageFormat::Dsk, None).unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 35 * 10 * 256);
}

#[test]
fn format_dsk_sis_describes_geometry_and_free_chain() {
    let dir = tempdir().unwrap();
    let path = format_disk(dir.path(), "TEST.DSK", 35, 10, ImageFormat::Dsk, None).unwrap();

    let mut image = ImageContainer::open(&path, AccessMode::ReadWrite).unwrap();
    let sis = SysInfoSector::from_sector(&image.read_sector(0, 3).unwrap());

    assert_eq!(sis.last_trk, 34);
    assert_eq!(sis.last_sec, 10);
    // free = total sectors minus the reserved prefix (boot, boot2,
    // SIS, SIS copy, directory sectors).
    let dir_sectors = (35 * 10 * 256) / 12_800;
    assert_eq!(sis.free, (350 - (dir_sectors + 4)) as u16);
    assert_eq!(sis.fc_end, (34, 10));

    // The duplicate SIS in sector 4 matches.
    let copy = SysInfoSector::from_sector(&image.read_sector(0, 4).unwrap());
    assert_eq!(copy, sis);
}

#[test]
fn format_walks_whole_free_chain_to_termination() {
    let dir = tempdir().unwrap();
    let path = format_disk(dir.path(), "CHAIN.DSK", 35, 10, ImageFormat::Dsk, None).unwrap();
    let mut image = ImageContainer::open(&path, AccessMode::ReadWrite).unwrap();
    let sis = SysInfoSector::from_sector(&image.read_sector(0, 3).unwrap());

    let (mut trk, mut sec) = sis.fc_start;
    let mut length = 0u32;
    while !(trk == 0 && sec == 0) {
        assert!(length <= 350, "free chain must terminate");
        let sector = image.read_sector(trk, sec).unwrap();
        trk = sector[0];
        sec = sector[1];
        length += 1;
    }
    assert_eq!(length, u32::from(sis.free));
}

#[test]
fn flx_roundtrip_preserves_geometry_and_empty_directory() {
    let dir = tempdir().unwrap();
    let path = format_disk(dir.path(), "ROUND.FLX", 40, 12, ImageFormat::Flx, None).unwrap();

    let first = {
        let mut image = ImageContainer::open(&path, AccessMode::ReadWrite).unwrap();
        let geometry = *image.geometry();
        assert!(image.iter_directory().unwrap().is_empty());
        drop(image);
        geometry
    };

    // Mount a second time: same geometry, still empty.
    let mut image = ImageContainer::open(&path, AccessMode::ReadWrite).unwrap();
    assert_eq!(*image.geometry(), first);
    assert!(image.iter_directory().unwrap().is_empty());
}

#[test]
fn container_info_reports_sizes_in_kb() {
    let dir = tempdir().unwrap();
    let mut image =
        ImageContainer::create(dir.path(), "INFO.DSK", 35, 10, ImageFormat::Dsk, None).unwrap();
    let info = image.info().unwrap();

    assert_eq!(info.name, "INFO");
    assert_eq!(info.tracks, 35);
    assert_eq!(info.sectors, 10);
    assert_eq!(info.total_kb, 35 * 10 * 256 / 1024);
    let dir_sectors = (35 * 10 * 256) / 12_800;
    assert_eq!(info.free_kb, ((350 - (dir_sectors as u32 + 4)) * 256) >> 10);
}
