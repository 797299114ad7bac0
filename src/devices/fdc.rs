//! WD1793-compatible floppy disk controller.
//!
//! The controller exposes five byte registers:
//!
//! | Offset | Register            |
//! |--------|---------------------|
//! | 0      | Command (W) / Status (R) |
//! | 1      | Track               |
//! | 2      | Sector              |
//! | 3      | Data                |
//! | 4      | Drive select latch  |
//!
//! Sector commands buffer a whole sector; the CPU then streams it
//! through the data register one byte per access. Track-write (format)
//! commands run a small state machine over the raw byte stream the CPU
//! emits, picking out ID and data address marks.
//!
//! The controller is hardware-like: it never reports errors through
//! return values. Disk-layer failures are folded into the status
//! register as RECORD_NOT_FOUND / NOT_READY / WRITE_PROTECT bits.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::devices::IoDevice;
use crate::disk::{
    format_disk, AccessMode, DiskContainer, FlexError, ImageFormat, Result,
};

/// Number of drive slots.
pub const DRIVE_COUNT: usize = 4;

bitflags! {
    /// WD1793 status register bits. RECORD_NOT_FOUND doubles as the
    /// seek-error bit and TRACK0 as the lost-data bit, as on the chip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdcStatus: u8 {
        const NOT_READY        = 0x80;
        const WRITE_PROTECT    = 0x40;
        const HEAD_LOADED      = 0x20;
        const RECORD_NOT_FOUND = 0x10;
        const CRC_ERROR        = 0x08;
        const TRACK0           = 0x04;
        const DATA_REQUEST     = 0x02;
        const BUSY             = 0x01;
    }
}

/// Host-visible state of one drive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveState {
    #[default]
    Empty,
    Inactive,
    Active,
}

/// States of the track-write (format) protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteTrackState {
    Inactive,
    WaitForIdAddressMark,
    IdAddressMark,
    WaitForDataAddressMark,
    WriteData,
    WaitForCrc,
}

/// What the data register is currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataPhase {
    Idle,
    ReadSector,
    WriteSector,
    WriteTrack,
}

const ID_ADDRESS_MARK: u8 = 0xFE;
const DATA_ADDRESS_MARK: u8 = 0xFB;

/// The floppy controller with its four drive slots.
pub struct FloppyController {
    drives: [Option<DiskContainer>; DRIVE_COUNT],
    drive_tracks: [u8; DRIVE_COUNT],
    drive_status: Mutex<[DriveState; DRIVE_COUNT]>,
    selected: Option<usize>,
    select_latch: u8,
    disk_dir: PathBuf,

    status: FdcStatus,
    track: u8,
    sector: u8,
    data: u8,
    step_out: bool,

    buffer: Vec<u8>,
    index: usize,
    phase: DataPhase,

    write_track_state: WriteTrackState,
    id_address_mark: [u8; 4],
    id_index: usize,
    crc_count: u8,
}

impl FloppyController {
    pub fn new(disk_dir: &Path) -> Self {
        Self {
            drives: Default::default(),
            drive_tracks: [0; DRIVE_COUNT],
            drive_status: Mutex::new([DriveState::Empty; DRIVE_COUNT]),
            selected: None,
            select_latch: 0,
            disk_dir: disk_dir.to_path_buf(),
            status: FdcStatus::empty(),
            track: 0,
            sector: 0,
            data: 0,
            step_out: false,
            buffer: Vec::new(),
            index: 0,
            phase: DataPhase::Idle,
            write_track_state: WriteTrackState::Inactive,
            id_address_mark: [0; 4],
            id_index: 0,
            crc_count: 0,
        }
    }

    /// Directory used to resolve relative mount paths and to place
    /// freshly formatted images.
    pub fn set_disk_directory(&mut self, dir: &Path) {
        self.disk_dir = dir.to_path_buf();
    }

    // Drive management (host side).

    pub fn mount_drive(&mut self, path: &str, drive: usize, mode: AccessMode) -> Result<()> {
        if drive >= DRIVE_COUNT {
            return Err(FlexError::BadParameter);
        }
        if self.drives[drive].is_some() {
            return Err(FlexError::BadParameter);
        }
        let direct = PathBuf::from(path);
        let resolved = if direct.exists() {
            direct
        } else {
            self.disk_dir.join(path)
        };
        let container = DiskContainer::mount(&resolved, mode)?;
        info!("drive {}: mounted {}", drive, resolved.display());
        self.drives[drive] = Some(container);
        self.refresh_drive_status();
        Ok(())
    }

    /// Mount a path on every slot where it succeeds, skipping empties.
    pub fn mount_all_drives(&mut self, paths: [Option<&str>; DRIVE_COUNT]) {
        for (drive, path) in paths.into_iter().enumerate() {
            if let Some(path) = path {
                if let Err(err) = self.mount_drive(path, drive, AccessMode::ReadWrite) {
                    warn!("drive {}: mount {} failed: {}", drive, path, err);
                }
            }
        }
    }

    pub fn umount_drive(&mut self, drive: usize) -> Result<()> {
        if drive >= DRIVE_COUNT {
            return Err(FlexError::BadParameter);
        }
        match self.drives[drive].take() {
            Some(container) => {
                info!("drive {}: unmounted {}", drive, container.path().display());
                drop(container);
                self.refresh_drive_status();
                Ok(())
            }
            None => Err(FlexError::BadParameter),
        }
    }

    pub fn umount_all_drives(&mut self) -> Result<()> {
        for drive in 0..DRIVE_COUNT {
            if self.drives[drive].is_some() {
                self.umount_drive(drive)?;
            }
        }
        Ok(())
    }

    pub fn update_drive(&mut self, drive: usize) -> Result<()> {
        match self.drives.get_mut(drive) {
            Some(Some(container)) => container.update(),
            _ => Err(FlexError::BadParameter),
        }
    }

    pub fn update_all_drives(&mut self) -> Result<()> {
        for container in self.drives.iter_mut().flatten() {
            container.update()?;
        }
        Ok(())
    }

    /// Format a new image inside the disk directory. The image is not
    /// mounted.
    pub fn format_disk(
        &mut self,
        tracks: u8,
        sectors: u8,
        name: &str,
        fmt: ImageFormat,
    ) -> Result<()> {
        format_disk(&self.disk_dir, name, tracks, sectors, fmt, None)?;
        Ok(())
    }

    /// Formatted description of one drive for the `info` command.
    pub fn drive_info(&mut self, drive: usize) -> String {
        if drive >= DRIVE_COUNT {
            return format!("drive #{} invalid\n", drive);
        }
        let Some(container) = &mut self.drives[drive] else {
            return format!("drive #{} not ready\n", drive);
        };
        match container.info() {
            Ok(info) => format!(
                "drive #{}:\n\
                 \x20 type:       {}\n\
                 \x20 path:       {}\n\
                 \x20 name:       {}\n\
                 \x20 date:       {}\n\
                 \x20 tracks:     {}\n\
                 \x20 sectors:    {}\n\
                 \x20 write-prot: {}\n\
                 \x20 free:       {} KByte\n\
                 \x20 total:      {} KByte\n",
                drive,
                info.type_name(),
                info.path.display(),
                info.name,
                info.date,
                info.tracks,
                info.sectors,
                if info.attributes.bits() != 0 { "yes" } else { "no" },
                info.free_kb,
                info.total_kb,
            ),
            Err(err) => format!("drive #{}: {}\n", drive, err),
        }
    }

    /// Poll-only per-drive state for host displays.
    pub fn get_drive_status(&self) -> [DriveState; DRIVE_COUNT] {
        *self.drive_status.lock().expect("drive status lock")
    }

    pub fn drive_container(&mut self, drive: usize) -> Option<&mut DiskContainer> {
        self.drives.get_mut(drive).and_then(|c| c.as_mut())
    }

    pub fn selected_drive(&self) -> Option<usize> {
        self.selected
    }

    fn refresh_drive_status(&mut self) {
        let mut status = self.drive_status.lock().expect("drive status lock");
        for drive in 0..DRIVE_COUNT {
            status[drive] = if self.drives[drive].is_none() {
                DriveState::Empty
            } else if self.selected == Some(drive) {
                DriveState::Active
            } else {
                DriveState::Inactive
            };
        }
    }

    /// Change the selected drive, preserving each drive's track
    /// register across switches.
    pub fn select_drive(&mut self, new_selected: Option<usize>) {
        if new_selected == self.selected {
            return;
        }
        if let Some(old) = self.selected {
            self.drive_tracks[old] = self.track;
        }
        if let Some(new) = new_selected {
            self.track = self.drive_tracks[new];
        }
        debug!("drive select: {:?} -> {:?}", self.selected, new_selected);
        self.selected = new_selected;
        self.refresh_drive_status();
    }

    // Controller internals.

    fn container(&mut self) -> Option<&mut DiskContainer> {
        match self.selected {
            Some(drive) => self.drives[drive].as_mut(),
            None => None,
        }
    }

    fn error_status(err: &FlexError) -> FdcStatus {
        match err {
            FlexError::Io(_) => FdcStatus::NOT_READY,
            FlexError::WriteProtected | FlexError::ReadOnly => FdcStatus::WRITE_PROTECT,
            _ => FdcStatus::RECORD_NOT_FOUND,
        }
    }

    fn is_seek_error(&mut self, new_track: u8) -> bool {
        match self.container() {
            Some(container) => !container.geometry().is_track_valid(new_track),
            None => true,
        }
    }

    fn is_record_not_found(&mut self) -> bool {
        let (track, sector) = (self.track, self.sector);
        match self.container() {
            Some(container) => {
                let geo = container.geometry();
                !geo.is_track_valid(track) || !geo.is_sector_valid(track, sector)
            }
            None => true,
        }
    }

    fn start_command(&mut self, command: u8) {
        self.status = FdcStatus::empty();
        self.phase = DataPhase::Idle;
        self.write_track_state = WriteTrackState::Inactive;
        self.index = 0;

        match command >> 4 {
            0x0 => {
                // RESTORE
                self.track = 0;
                self.status |= FdcStatus::TRACK0;
            }
            0x1 => {
                // SEEK to the data register value
                let target = self.data;
                if self.is_seek_error(target) {
                    self.status |= FdcStatus::RECORD_NOT_FOUND;
                } else {
                    self.track = target;
                    if target == 0 {
                        self.status |= FdcStatus::TRACK0;
                    }
                }
            }
            0x2 | 0x3 => {
                let step_out = self.step_out;
                self.step(step_out, command & 0x10 != 0);
            }
            0x4 | 0x5 => {
                self.step_out = false;
                self.step(false, command & 0x10 != 0);
            }
            0x6 | 0x7 => {
                self.step_out = true;
                self.step(true, command & 0x10 != 0);
            }
            0x8 | 0x9 => self.begin_read_sector(),
            0xA | 0xB => self.begin_write_sector(),
            0xC => self.begin_read_address(),
            0xD => {
                // FORCE INTERRUPT terminates whatever is in flight.
                self.status.remove(FdcStatus::BUSY | FdcStatus::DATA_REQUEST);
            }
            0xE => {
                // READ TRACK is not supported by the emulation.
                self.status |= FdcStatus::RECORD_NOT_FOUND;
            }
            0xF => self.begin_write_track(),
            _ => unreachable!(),
        }
    }

    fn step(&mut self, step_out: bool, update_track: bool) {
        if update_track {
            self.track = if step_out {
                self.track.saturating_sub(1)
            } else {
                self.track.saturating_add(1)
            };
        }
        if self.track == 0 {
            self.status |= FdcStatus::TRACK0;
        }
    }

    fn begin_read_sector(&mut self) {
        let (track, sector) = (self.track, self.sector);
        match self.container() {
            None => self.status |= FdcStatus::NOT_READY,
            Some(container) => match container.read_sector(track, sector) {
                Ok(data) => {
                    self.buffer = data;
                    self.index = 0;
                    self.phase = DataPhase::ReadSector;
                    self.status |= FdcStatus::BUSY | FdcStatus::DATA_REQUEST;
                }
                Err(err) => {
                    debug!("read sector ({},{}): {}", track, sector, err);
                    self.status |= Self::error_status(&err);
                }
            },
        }
    }

    fn begin_write_sector(&mut self) {
        let Some(container) = self.container() else {
            self.status |= FdcStatus::NOT_READY;
            return;
        };
        if container.is_write_protected() {
            self.status |= FdcStatus::WRITE_PROTECT;
            return;
        }
        let size = container.bytes_per_sector();
        if self.is_record_not_found() {
            self.status |= FdcStatus::RECORD_NOT_FOUND;
            return;
        }
        self.buffer = vec![0; size];
        self.index = 0;
        self.phase = DataPhase::WriteSector;
        self.status |= FdcStatus::BUSY | FdcStatus::DATA_REQUEST;
    }

    fn begin_read_address(&mut self) {
        if self.container().is_none() {
            self.status |= FdcStatus::NOT_READY;
            return;
        }
        let sizecode = match self.container().map(|c| c.bytes_per_sector()) {
            Some(128) => 0,
            Some(512) => 2,
            Some(1024) => 3,
            _ => 1,
        };
        self.buffer = vec![self.track, 0, self.sector, sizecode, 0, 0];
        self.index = 0;
        self.phase = DataPhase::ReadSector;
        self.status |= FdcStatus::BUSY | FdcStatus::DATA_REQUEST;
    }

    fn begin_write_track(&mut self) {
        match self.container() {
            None => self.status |= FdcStatus::NOT_READY,
            Some(container) => {
                if container.is_write_protected() {
                    self.status |= FdcStatus::WRITE_PROTECT;
                    return;
                }
                self.phase = DataPhase::WriteTrack;
                self.write_track_state = WriteTrackState::WaitForIdAddressMark;
                self.status |= FdcStatus::BUSY | FdcStatus::DATA_REQUEST;
            }
        }
    }

    fn read_data(&mut self) -> u8 {
        if self.phase == DataPhase::ReadSector {
            let value = self.buffer.get(self.index).copied().unwrap_or(0xFF);
            self.index += 1;
            if self.index >= self.buffer.len() {
                self.phase = DataPhase::Idle;
                self.status.remove(FdcStatus::BUSY | FdcStatus::DATA_REQUEST);
            }
            self.data = value;
            return value;
        }
        self.data
    }

    fn write_data(&mut self, value: u8) {
        match self.phase {
            DataPhase::WriteSector => {
                self.buffer[self.index] = value;
                self.index += 1;
                if self.index >= self.buffer.len() {
                    self.finish_sector_write();
                }
            }
            DataPhase::WriteTrack => self.write_track_byte(value),
            _ => self.data = value,
        }
        self.data = value;
    }

    fn finish_sector_write(&mut self) {
        let (track, sector) = (self.track, self.sector);
        let buffer = std::mem::take(&mut self.buffer);
        if let Some(container) = self.container() {
            if let Err(err) = container.write_sector(track, sector, &buffer) {
                debug!("write sector ({},{}): {}", track, sector, err);
                self.status |= Self::error_status(&err);
            }
        }
        self.phase = DataPhase::Idle;
        self.status.remove(FdcStatus::BUSY | FdcStatus::DATA_REQUEST);
    }

    /// One byte of the raw track stream produced by a format routine.
    fn write_track_byte(&mut self, value: u8) {
        match self.write_track_state {
            WriteTrackState::Inactive => {}
            WriteTrackState::WaitForIdAddressMark => {
                if value == ID_ADDRESS_MARK {
                    self.write_track_state = WriteTrackState::IdAddressMark;
                    self.id_index = 0;
                    self.status |= FdcStatus::BUSY | FdcStatus::DATA_REQUEST;
                }
            }
            WriteTrackState::IdAddressMark => {
                self.id_address_mark[self.id_index] = value;
                self.id_index += 1;
                if self.id_index == self.id_address_mark.len() {
                    self.write_track_state = WriteTrackState::WaitForDataAddressMark;
                }
            }
            WriteTrackState::WaitForDataAddressMark => {
                if value == DATA_ADDRESS_MARK {
                    let size = 128usize << (self.id_address_mark[3] & 0x03);
                    self.buffer = vec![0; size];
                    self.index = 0;
                    self.write_track_state = WriteTrackState::WriteData;
                }
            }
            WriteTrackState::WriteData => {
                self.buffer[self.index] = value;
                self.index += 1;
                if self.index >= self.buffer.len() {
                    self.write_track_state = WriteTrackState::WaitForCrc;
                    self.crc_count = 0;
                }
            }
            WriteTrackState::WaitForCrc => {
                self.crc_count += 1;
                if self.crc_count == 2 {
                    let (track, sector) = (self.id_address_mark[0], self.id_address_mark[2]);
                    let buffer = std::mem::take(&mut self.buffer);
                    if let Some(container) = self.container() {
                        if let Err(err) = container.write_sector(track, sector, &buffer) {
                            debug!("write track ({},{}): {}", track, sector, err);
                            self.status |= Self::error_status(&err);
                        }
                    }
                    self.write_track_state = WriteTrackState::WaitForIdAddressMark;
                    self.status.remove(FdcStatus::BUSY | FdcStatus::DATA_REQUEST);
                }
            }
        }
    }

    fn read_status(&mut self) -> u8 {
        let mut status = self.status;
        match self.container() {
            None => status |= FdcStatus::NOT_READY,
            Some(container) => {
                if container.is_write_protected() {
                    status |= FdcStatus::WRITE_PROTECT;
                }
            }
        }
        status.bits()
    }
}

impl IoDevice for FloppyController {
    fn reset_io(&mut self) {
        self.status = FdcStatus::empty();
        self.track = 0;
        self.sector = 0;
        self.data = 0;
        self.step_out = false;
        self.buffer.clear();
        self.index = 0;
        self.phase = DataPhase::Idle;
        self.write_track_state = WriteTrackState::Inactive;
        self.id_index = 0;
        self.crc_count = 0;
    }

    fn read_io(&mut self, offset: u16) -> u8 {
        if self.selected.is_none() && offset < 4 {
            // No drive selected: the bus sees pulled-up data lines,
            // except that the status register still reports not-ready.
            if offset == 0 {
                return (self.status | FdcStatus::NOT_READY).bits();
            }
            return 0xFF;
        }
        match offset {
            0 => self.read_status(),
            1 => self.track,
            2 => self.sector,
            3 => self.read_data(),
            4 => self.select_latch,
            _ => 0xFF,
        }
    }

    fn write_io(&mut self, offset: u16, value: u8) {
        if self.selected.is_none() && offset < 4 {
            return;
        }
        match offset {
            0 => self.start_command(value),
            1 => self.track = value,
            2 => self.sector = value,
            3 => self.write_data(value),
            4 => {
                self.select_latch = value;
                let selected = match value & 0x0F {
                    0x01 => Some(0),
                    0x02 => Some(1),
                    0x04 => Some(2),
                    0x08 => Some(3),
                    _ => None,
                };
                self.select_drive(selected);
            }
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        "fdc"
    }
}
