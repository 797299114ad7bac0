//! Packed FLEX disk images (DSK and FLX).
//!
//! A DSK image is a bare concatenation of 256-byte sectors; its geometry
//! is recovered from the System Information Sector and cross-checked
//! against the file size. An FLX image prefixes the sector data with a
//! 16-byte header that carries the geometry directly.
//!
//! Images are normally backed by the host file and accessed sector by
//! sector. A RAM-backed variant loads the whole image up front (used for
//! `rmount`); its changes reach the host file only through [`update`].
//!
//! [`update`]: ImageContainer::update

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::disk::buffer::FileBuffer;
use crate::disk::flex::{
    is_valid_filename, matches_pattern, split_filename, ContainerType, DirEntry, DiskGeometry,
    FileAttributes, FlexDate, FlxHeader, SysInfoSector, BYTES_PER_DIR_SECTOR, DIR_ENTRIES_PER_SECTOR,
    DIR_ENTRY_SIZE, DIR_HEADER_SIZE, FIRST_DIR_SECTOR, FIRST_DIR_TRACK, FLX_HEADER_SIZE,
    SECTOR_PAYLOAD, SECTOR_SIZE, SIS_SECTOR, SIS_TRACK, SLOT_DELETED, SLOT_FREE,
};
use crate::disk::{ContainerInfo, FlexError, Result};

/// How an image is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    /// Load the whole image into memory; the file is rewritten on
    /// [`ImageContainer::update`] only.
    Ram,
}

/// On-disk layout of a new image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Dsk,
    Flx,
}

enum Backing {
    File(File),
    Ram(Vec<u8>),
}

/// A FLEX filesystem stored as a packed sector image.
pub struct ImageContainer {
    path: PathBuf,
    backing: Backing,
    geometry: DiskGeometry,
}

/// Position of a directory entry on disk.
#[derive(Debug, Clone, Copy)]
struct DirSlot {
    track: u8,
    sector: u8,
    index: usize,
}

impl ImageContainer {
    /// Open an existing image, detecting FLX and DSK layouts.
    ///
    /// `ReadWrite` silently degrades to a write-protected container when
    /// the host file is not writable.
    pub fn open(path: &Path, mode: AccessMode) -> Result<Self> {
        let (mut file, mut read_only) = match mode {
            AccessMode::ReadOnly => (File::open(path)?, true),
            AccessMode::ReadWrite | AccessMode::Ram => {
                match OpenOptions::new().read(true).write(true).open(path) {
                    Ok(file) => (file, false),
                    Err(_) => (File::open(path)?, true),
                }
            }
        };

        let file_size = file.metadata()?.len();
        let geometry = Self::detect_geometry(&mut file, file_size, path, read_only)?;

        let backing = if mode == AccessMode::Ram {
            let mut data = Vec::with_capacity(file_size as usize);
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut data)?;
            // RAM images accept writes regardless of how the host file
            // was opened; the write-back in update() may still fail.
            read_only = false;
            Backing::Ram(data)
        } else {
            Backing::File(file)
        };

        let mut geometry = geometry;
        geometry.write_protect = geometry.write_protect || read_only;
        if matches!(backing, Backing::Ram(_)) {
            geometry.write_protect = false;
            geometry.container_type |= ContainerType::RAM;
        }

        info!(
            "mounted image {} ({:?}, {} tracks, {} sectors/track)",
            path.display(),
            geometry.container_type,
            geometry.max_track as u16 + 1,
            geometry.sectors_per_track(),
        );

        Ok(Self {
            path: path.to_path_buf(),
            backing,
            geometry,
        })
    }

    /// Format a new image in `dir` and open it read-write.
    pub fn create(
        dir: &Path,
        name: &str,
        tracks: u8,
        sectors: u8,
        fmt: ImageFormat,
        boot_sector: Option<&Path>,
    ) -> Result<Self> {
        let path = format_disk(dir, name, tracks, sectors, fmt, boot_sector)?;
        Self::open(&path, AccessMode::ReadWrite)
    }

    fn detect_geometry(
        file: &mut File,
        file_size: u64,
        path: &Path,
        read_only: bool,
    ) -> Result<DiskGeometry> {
        let mut header_buf = [0u8; FLX_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        let header_ok = file.read_exact(&mut header_buf).is_ok();

        let mut sis_buf = [0u8; SECTOR_SIZE];
        file.seek(SeekFrom::Start(2 * SECTOR_SIZE as u64))?;
        let sis_ok = file.read_exact(&mut sis_buf).is_ok();

        Self::classify(
            header_ok.then_some(&header_buf),
            sis_ok.then_some(&sis_buf),
            file_size,
            path,
            read_only,
        )
    }

    /// Wrap an already-assembled in-memory image. Used by the directory
    /// container for its synthesized sector view.
    pub(crate) fn open_ram(label: &Path, data: Vec<u8>) -> Result<Self> {
        let header = data.get(..FLX_HEADER_SIZE).map(|s| {
            let mut buf = [0u8; FLX_HEADER_SIZE];
            buf.copy_from_slice(s);
            buf
        });
        let sis = data
            .get(2 * SECTOR_SIZE..3 * SECTOR_SIZE)
            .map(|s| {
                let mut buf = [0u8; SECTOR_SIZE];
                buf.copy_from_slice(s);
                buf
            });
        let mut geometry = Self::classify(
            header.as_ref(),
            sis.as_ref(),
            data.len() as u64,
            label,
            false,
        )?;
        geometry.container_type |= ContainerType::RAM;
        Ok(Self {
            path: label.to_path_buf(),
            backing: Backing::Ram(data),
            geometry,
        })
    }

    fn classify(
        header: Option<&[u8; FLX_HEADER_SIZE]>,
        sis: Option<&[u8; SECTOR_SIZE]>,
        file_size: u64,
        path: &Path,
        read_only: bool,
    ) -> Result<DiskGeometry> {
        if let Some(header_buf) = header {
            if let Some(header) = FlxHeader::from_bytes(header_buf) {
                return Ok(DiskGeometry::from_flx_header(&header, read_only));
            }
        }

        // Not FLX: probe the system information sector for a DSK layout
        // and cross-check the implied size against the backing store.
        if let Some(sis_buf) = sis {
            let sis = SysInfoSector::from_sector(sis_buf);
            let tracks = u64::from(sis.last_trk) + 1;
            let sectors = u64::from(sis.last_sec);
            if sectors > 0 && tracks * sectors * SECTOR_SIZE as u64 == file_size {
                return Ok(DiskGeometry::from_dsk(
                    sis.last_trk.wrapping_add(1),
                    sis.last_sec,
                    read_only,
                ));
            }
        }

        Err(FlexError::NotAContainer(path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> &DiskGeometry {
        &self.geometry
    }

    pub fn is_write_protected(&self) -> bool {
        self.geometry.write_protect
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.geometry.bytes_per_sector
    }

    // Raw backing I/O.

    fn read_at(&mut self, pos: usize, buf: &mut [u8]) -> Result<()> {
        match &mut self.backing {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(pos as u64))?;
                file.read_exact(buf)?;
            }
            Backing::Ram(data) => {
                let end = pos + buf.len();
                let src = data
                    .get(pos..end)
                    .ok_or_else(|| FlexError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
                buf.copy_from_slice(src);
            }
        }
        Ok(())
    }

    fn write_at(&mut self, pos: usize, buf: &[u8]) -> Result<()> {
        match &mut self.backing {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(pos as u64))?;
                file.write_all(buf)?;
            }
            Backing::Ram(data) => {
                let end = pos + buf.len();
                let dst = data
                    .get_mut(pos..end)
                    .ok_or_else(|| FlexError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
                dst.copy_from_slice(buf);
            }
        }
        Ok(())
    }

    fn check_address(&self, track: u8, sector: u8) -> Result<()> {
        if !self.geometry.is_track_valid(track) || !self.geometry.is_sector_valid(track, sector) {
            return Err(FlexError::OutOfRange { track, sector });
        }
        Ok(())
    }

    /// Read one physical sector.
    pub fn read_sector(&mut self, track: u8, sector: u8) -> Result<Vec<u8>> {
        self.check_address(track, sector)?;
        let mut buf = vec![0u8; self.geometry.bytes_per_sector];
        let pos = self.geometry.byte_offset(track, sector);
        self.read_at(pos, &mut buf)?;
        Ok(buf)
    }

    /// Write one physical sector.
    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> Result<()> {
        if self.geometry.write_protect {
            return Err(FlexError::WriteProtected);
        }
        self.check_address(track, sector)?;
        let len = data.len().min(self.geometry.bytes_per_sector);
        let pos = self.geometry.byte_offset(track, sector);
        self.write_at(pos, &data[..len])
    }

    // Filesystem-level sector access. The FLEX structures occupy the
    // first 256 bytes of a sector independent of the physical size.

    fn fs_read(&mut self, track: u8, sector: u8) -> Result<[u8; SECTOR_SIZE]> {
        self.check_address(track, sector)?;
        let mut buf = [0u8; SECTOR_SIZE];
        let pos = self.geometry.byte_offset(track, sector);
        self.read_at(pos, &mut buf)?;
        Ok(buf)
    }

    fn fs_write(&mut self, track: u8, sector: u8, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        if self.geometry.write_protect {
            return Err(FlexError::WriteProtected);
        }
        self.check_address(track, sector)?;
        let pos = self.geometry.byte_offset(track, sector);
        self.write_at(pos, buf)
    }

    fn read_sys_info(&mut self) -> Result<SysInfoSector> {
        Ok(SysInfoSector::from_sector(&self.fs_read(SIS_TRACK, SIS_SECTOR)?))
    }

    fn write_sys_info(&mut self, sis: &SysInfoSector) -> Result<()> {
        let mut buf = self.fs_read(SIS_TRACK, SIS_SECTOR)?;
        sis.write_to(&mut buf);
        self.fs_write(SIS_TRACK, SIS_SECTOR, &buf)
    }

    /// Upper bound for chain walks; following more links than sectors
    /// exist means the chain is cyclic or corrupt.
    fn max_chain_len(&self) -> usize {
        (self.geometry.max_track as usize + 1) * self.geometry.sectors_per_track() as usize
    }

    // Directory access.

    /// Find all directory slots whose entry matches `pattern`.
    fn matching_slots(&mut self, pattern: &str) -> Result<Vec<(DirSlot, DirEntry)>> {
        let mut found = Vec::new();
        let mut track = FIRST_DIR_TRACK;
        let mut sector = FIRST_DIR_SECTOR;
        let mut hops = 0;

        while !(track == 0 && sector == 0) {
            if hops > self.max_chain_len() {
                return Err(FlexError::InvalidFormat);
            }
            hops += 1;

            let buf = self.fs_read(track, sector)?;
            for index in 0..DIR_ENTRIES_PER_SECTOR {
                let off = DIR_HEADER_SIZE + index * DIR_ENTRY_SIZE;
                if let Some(entry) = DirEntry::decode(&buf[off..off + DIR_ENTRY_SIZE]) {
                    if matches_pattern(pattern, &entry.file_name()) {
                        found.push((
                            DirSlot {
                                track,
                                sector,
                                index,
                            },
                            entry,
                        ));
                    }
                }
            }
            track = buf[0];
            sector = buf[1];
        }
        Ok(found)
    }

    /// Look up a single file by exact (validated) name.
    pub fn find_file(&mut self, name: &str) -> Result<Option<DirEntry>> {
        if !is_valid_filename(name) {
            return Err(FlexError::InvalidFilename(name.into()));
        }
        Ok(self
            .matching_slots(name)?
            .into_iter()
            .map(|(_, entry)| entry)
            .next())
    }

    /// All directory entries in directory order.
    pub fn iter_directory(&mut self) -> Result<Vec<DirEntry>> {
        Ok(self
            .matching_slots("*")?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Delete every file matching `pattern`, returning its sectors to
    /// the free chain.
    pub fn delete_file(&mut self, pattern: &str) -> Result<usize> {
        if self.geometry.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let victims = self.matching_slots(pattern)?;
        if victims.is_empty() {
            return Err(FlexError::NoSuchFile(pattern.into()));
        }

        let count = victims.len();
        for (slot, entry) in victims {
            let mut buf = self.fs_read(slot.track, slot.sector)?;
            buf[DIR_HEADER_SIZE + slot.index * DIR_ENTRY_SIZE] = SLOT_DELETED;
            self.fs_write(slot.track, slot.sector, &buf)?;

            // Append the file chain to the free chain.
            let mut sis = self.read_sys_info()?;
            if sis.fc_start == (0, 0) {
                sis.fc_start = entry.start;
            } else {
                let (end_trk, end_sec) = sis.fc_end;
                let mut tail = self.fs_read(end_trk, end_sec)?;
                tail[0] = entry.start.0;
                tail[1] = entry.start.1;
                self.fs_write(end_trk, end_sec, &tail)?;
            }
            sis.fc_end = entry.end;
            sis.free += entry.records;
            self.write_sys_info(&sis)?;

            debug!("deleted {} ({} sectors)", entry.file_name(), entry.records);
        }
        Ok(count)
    }

    /// Rename a file; fails when the target name is taken.
    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if self.geometry.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let (base, ext) =
            split_filename(new_name).ok_or_else(|| FlexError::InvalidFilename(new_name.into()))?;
        if self.find_file(new_name)?.is_some() {
            return Err(FlexError::FileAlreadyExists(new_name.into()));
        }
        let slots = self.matching_slots(old_name)?;
        let (slot, mut entry) = slots
            .into_iter()
            .next()
            .ok_or_else(|| FlexError::NoSuchFile(old_name.into()))?;

        entry.base_name = base;
        entry.extension = ext;
        let mut buf = self.fs_read(slot.track, slot.sector)?;
        let off = DIR_HEADER_SIZE + slot.index * DIR_ENTRY_SIZE;
        entry.encode(&mut buf[off..off + DIR_ENTRY_SIZE]);
        self.fs_write(slot.track, slot.sector, &buf)
    }

    /// Apply `set_mask` and `clear_mask` to every file matching
    /// `pattern`.
    pub fn set_attributes(
        &mut self,
        pattern: &str,
        set_mask: FileAttributes,
        clear_mask: FileAttributes,
    ) -> Result<usize> {
        if self.geometry.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let slots = self.matching_slots(pattern)?;
        if slots.is_empty() {
            return Err(FlexError::NoSuchFile(pattern.into()));
        }
        let count = slots.len();
        for (slot, mut entry) in slots {
            entry.attributes = (entry.attributes & !clear_mask) | set_mask;
            let mut buf = self.fs_read(slot.track, slot.sector)?;
            let off = DIR_HEADER_SIZE + slot.index * DIR_ENTRY_SIZE;
            entry.encode(&mut buf[off..off + DIR_ENTRY_SIZE]);
            self.fs_write(slot.track, slot.sector, &buf)?;
        }
        Ok(count)
    }

    /// Read a file into a [`FileBuffer`].
    ///
    /// The payload is a whole number of 252-byte records; the final
    /// record keeps its zero padding, as the on-disk format carries no
    /// byte-exact length.
    pub fn read_to_buffer(&mut self, name: &str) -> Result<FileBuffer> {
        let entry = self
            .find_file(name)?
            .ok_or_else(|| FlexError::NoSuchFile(name.into()))?;

        let mut size = entry.size() as i64;
        if entry.random {
            size -= 2 * SECTOR_SIZE as i64;
        }
        if size <= 0 {
            return Err(FlexError::BadParameter);
        }

        let mut buffer = FileBuffer::new(&entry.file_name(), Vec::with_capacity(size as usize));
        buffer.set_attributes(entry.attributes);
        buffer.set_random(entry.random);
        buffer.set_date(entry.date);

        let (mut track, mut sector) = entry.start;
        let mut first = true;
        let mut hops = 0;
        loop {
            // A random file's first two sectors hold the sector map.
            let skip = if first && entry.random { 3 } else { 1 };
            first = false;

            let mut buf = [0u8; SECTOR_SIZE];
            for _ in 0..skip {
                if track == 0 && sector == 0 {
                    return Ok(buffer);
                }
                if hops > self.max_chain_len() {
                    return Err(FlexError::InvalidFormat);
                }
                hops += 1;
                buf = self.fs_read(track, sector)?;
                track = buf[0];
                sector = buf[1];
            }
            buffer.push_record(&buf[4..]);
        }
    }

    /// Write a [`FileBuffer`] as a new file.
    ///
    /// Sectors come off the free chain in order. Data sectors get their
    /// record number in bytes 2..4 and 252 payload bytes at byte 4; the
    /// last one is linked to (0,0). Random files first reserve two
    /// sectors for the sector map, which records runs of physically
    /// contiguous sectors as (track, sector, count) triples.
    pub fn write_from_buffer(&mut self, buffer: &FileBuffer, name: Option<&str>) -> Result<()> {
        let file_name = name.unwrap_or_else(|| buffer.file_name());
        let (base, ext) =
            split_filename(file_name).ok_or_else(|| FlexError::InvalidFilename(file_name.into()))?;
        if self.geometry.write_protect {
            return Err(FlexError::WriteProtected);
        }
        if self.find_file(file_name)?.is_some() {
            return Err(FlexError::FileAlreadyExists(file_name.into()));
        }

        let mut sis = self.read_sys_info()?;
        let start = sis.fc_start;
        let (mut next_trk, mut next_sec) = sis.fc_start;

        // bufs[0] is the data sector; bufs[2] and bufs[1] hold the
        // sector map of a random file, consumed in that order.
        let mut bufs = [[0u8; SECTOR_SIZE]; 3];
        let mut sm_sector = 2usize;
        let mut sm_index = 1usize;
        let mut record_nr: u16 = 0;
        let mut repeat = if buffer.is_random() { 2usize } else { 0 };
        let (mut trk, mut sec) = (0u8, 0u8);
        let (mut next_p_trk, mut next_p_sec) = (0u16, 0u16);
        let sectors_per_track = u16::from(self.geometry.sectors_per_track());

        loop {
            for i in (0..=repeat).rev() {
                trk = next_trk;
                sec = next_sec;
                if trk == 0 && sec == 0 {
                    return Err(FlexError::DiskFull);
                }
                bufs[i] = self.fs_read(trk, sec)?;
                if i > 0 {
                    bufs[i][2..].fill(0);
                }
                next_trk = bufs[i][0];
                next_sec = bufs[i][1];
            }

            buffer.copy_record(record_nr as usize, &mut bufs[0][4..]);
            record_nr += 1;

            if buffer.is_random() {
                let here = (u16::from(trk), u16::from(sec));
                if here != (next_p_trk, next_p_sec) || bufs[sm_sector][sm_index + 2] == 255 {
                    sm_index += 3;
                    if sm_index >= SECTOR_SIZE {
                        sm_sector -= 1;
                        if sm_sector == 0 {
                            return Err(FlexError::RecordMapFull(file_name.into()));
                        }
                        sm_index = 4;
                    }
                    bufs[sm_sector][sm_index] = trk;
                    bufs[sm_sector][sm_index + 1] = sec;
                }
                bufs[sm_sector][sm_index + 2] += 1;
                next_p_trk = u16::from(trk);
                next_p_sec = u16::from(sec) + 1;
                if next_p_sec > sectors_per_track {
                    next_p_trk += 1;
                    next_p_sec = 1;
                }
            }

            bufs[0][2] = (record_nr >> 8) as u8;
            bufs[0][3] = (record_nr & 0xFF) as u8;
            let done = record_nr as usize * SECTOR_PAYLOAD >= buffer.len();
            if done {
                bufs[0][0] = 0;
                bufs[0][1] = 0;
            }
            self.fs_write(trk, sec, &bufs[0])?;
            repeat = 0;
            if done {
                break;
            }
        }

        sis.fc_start = (next_trk, next_sec);
        if next_trk == 0 && next_sec == 0 {
            sis.fc_end = (0, 0);
        }

        if buffer.is_random() {
            let (mut map_trk, mut map_sec) = start;
            for i in [2usize, 1] {
                let map = bufs[i];
                self.fs_write(map_trk, map_sec, &map)?;
                map_trk = map[0];
                map_sec = map[1];
            }
        }

        sis.free = sis.free.saturating_sub(record_nr);
        self.write_sys_info(&sis)?;

        let records = record_nr + if buffer.is_random() { 2 } else { 0 };
        self.create_dir_entry(DirEntry {
            base_name: base,
            extension: ext,
            attributes: buffer.attributes(),
            start,
            end: (trk, sec),
            records,
            random: buffer.is_random(),
            date: buffer.date(),
        })?;

        debug!("wrote {} ({} records)", file_name, record_nr);
        Ok(())
    }

    /// Put a new entry into the first free directory slot.
    fn create_dir_entry(&mut self, entry: DirEntry) -> Result<()> {
        let mut track = FIRST_DIR_TRACK;
        let mut sector = FIRST_DIR_SECTOR;
        let mut hops = 0;

        while !(track == 0 && sector == 0) {
            if hops > self.max_chain_len() {
                return Err(FlexError::InvalidFormat);
            }
            hops += 1;

            let mut buf = self.fs_read(track, sector)?;
            for index in 0..DIR_ENTRIES_PER_SECTOR {
                let off = DIR_HEADER_SIZE + index * DIR_ENTRY_SIZE;
                if buf[off] == SLOT_FREE || buf[off] == SLOT_DELETED {
                    entry.encode(&mut buf[off..off + DIR_ENTRY_SIZE]);
                    return self.fs_write(track, sector, &buf);
                }
            }
            track = buf[0];
            sector = buf[1];
        }
        Err(FlexError::DirectoryFull)
    }

    /// Copy a file into another container under `dst_name`.
    pub fn copy_file(
        &mut self,
        name: &str,
        destination: &mut super::DiskContainer,
        dst_name: &str,
    ) -> Result<()> {
        let buffer = self.read_to_buffer(name)?;
        destination.write_from_buffer(&buffer, Some(dst_name))
    }

    /// Container summary for the `info` command and explorers.
    pub fn info(&mut self) -> Result<ContainerInfo> {
        let sis = self.read_sys_info()?;
        let bps = self.geometry.bytes_per_sector as u32;
        let tracks = u32::from(sis.last_trk) + 1;
        let sectors = u32::from(sis.last_sec);
        Ok(ContainerInfo {
            path: self.path.clone(),
            name: sis.name(),
            date: sis.date(),
            tracks: tracks as u16,
            sectors: sectors as u16,
            free_kb: (u32::from(sis.free) * bps) >> 10,
            total_kb: (tracks * sectors * bps) >> 10,
            container_type: self.geometry.container_type,
            attributes: if self.geometry.write_protect {
                FileAttributes::WRITE_PROTECT
            } else {
                FileAttributes::empty()
            },
        })
    }

    /// Flush a RAM-backed image back to its host file. File-backed
    /// images only sync the handle.
    pub fn update(&mut self) -> Result<()> {
        match &mut self.backing {
            Backing::File(file) => {
                file.flush()?;
                Ok(())
            }
            Backing::Ram(data) => {
                std::fs::write(&self.path, data)?;
                debug!("flushed RAM image back to {}", self.path.display());
                Ok(())
            }
        }
    }
}

/// Create and format a new image file, returning its path.
///
/// Tracks clamp to 2..=255 and sectors to 5..=255. Track 0 is laid out
/// as boot sector, link-only second sector, the SIS and its duplicate,
/// then the directory chain; every remaining sector joins the free
/// chain in ascending order.
pub fn format_disk(
    dir: &Path,
    name: &str,
    tracks: u8,
    sectors: u8,
    fmt: ImageFormat,
    boot_sector: Option<&Path>,
) -> Result<PathBuf> {
    let data = image_bytes(name, tracks, sectors, fmt, boot_sector)?;
    let path = dir.join(name);
    std::fs::write(&path, &data)?;
    info!(
        "formatted {} ({:?}, {}x{})",
        path.display(),
        fmt,
        tracks.max(2),
        sectors.max(5)
    );
    Ok(path)
}

/// Assemble the bytes of a freshly formatted image.
pub(crate) fn image_bytes(
    name: &str,
    tracks: u8,
    sectors: u8,
    fmt: ImageFormat,
    boot_sector: Option<&Path>,
) -> Result<Vec<u8>> {
    if name.is_empty() {
        return Err(FlexError::BadParameter);
    }
    let tracks = tracks.max(2) as usize;
    let sectors = sectors.max(5) as usize;
    let total = tracks * sectors;
    let size = total * SECTOR_SIZE;
    let dir_sectors = (size / BYTES_PER_DIR_SECTOR).max(sectors - 4);

    let mut data = Vec::with_capacity(size + FLX_HEADER_SIZE);

    if fmt == ImageFormat::Flx {
        let header = FlxHeader::new(SECTOR_SIZE, tracks as u8, sectors as u8, sectors as u8, 1);
        data.extend_from_slice(&header.to_bytes());
    }

    // Boot sector: either the supplied file's first sector or a lone RTS.
    let mut buf = [0u8; SECTOR_SIZE];
    let mut have_boot = false;
    if let Some(boot_path) = boot_sector {
        match File::open(boot_path) {
            Ok(mut boot) => {
                have_boot = boot.read(&mut buf).map(|n| n > 0).unwrap_or(false);
            }
            Err(err) => warn!("boot sector file {}: {}", boot_path.display(), err),
        }
    }
    if !have_boot {
        buf.fill(0);
        buf[0] = 0x39;
    }
    data.extend_from_slice(&buf);

    // Second boot sector, link-only.
    buf.fill(0);
    buf[1] = 3;
    data.extend_from_slice(&buf);

    // System information sector, written twice.
    buf.fill(0);
    let today = FlexDate::today();
    let fc_start_index = dir_sectors + 4;
    let mut disk_name = [0u8; 8];
    for (i, b) in name
        .bytes()
        .take_while(|&b| b != b'.')
        .take(8)
        .enumerate()
    {
        disk_name[i] = b.to_ascii_uppercase();
    }
    let sis = SysInfoSector {
        disk_name,
        disk_number: 1,
        fc_start: (
            (fc_start_index / sectors) as u8,
            (fc_start_index % sectors + 1) as u8,
        ),
        fc_end: ((tracks - 1) as u8, sectors as u8),
        free: (total - fc_start_index) as u16,
        month: today.month,
        day: today.day,
        // Stored as years since 1900, unmasked.
        year: (today.year - 1900) as u8,
        last_trk: (tracks - 1) as u8,
        last_sec: sectors as u8,
    };
    sis.write_to(&mut buf);
    data.extend_from_slice(&buf);
    data.extend_from_slice(&buf);

    // Directory chain.
    for i in 0..dir_sectors {
        buf.fill(0);
        if i < dir_sectors - 1 {
            buf[0] = ((i + 5) / sectors) as u8;
            buf[1] = ((i + 5) % sectors + 1) as u8;
        }
        data.extend_from_slice(&buf);
    }

    // Free chain: every remaining sector links to its successor.
    for i in dir_sectors + 5..=total {
        buf.fill(0);
        if i < total {
            buf[0] = (i / sectors) as u8;
            buf[1] = (i % sectors + 1) as u8;
        }
        data.extend_from_slice(&buf);
    }

    Ok(data)
}
