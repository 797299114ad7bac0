//! Host-directory backed FLEX container.
//!
//! Every FLEX file is one host file inside the directory. Because host
//! filesystems cannot carry FLEX attributes or the random-file flag,
//! those live in a shadow metadata file (`.flexattrs`) next to the
//! files.
//!
//! The floppy controller needs sector-level access even to a mounted
//! directory, so the container keeps a synthesized in-memory FLEX image
//! built from the host files at mount time. Sector reads and writes
//! operate on that image; `update()` extracts the image's files back to
//! the host directory when the guest has written through the sector
//! interface. File-level operations are applied to both views at once.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::disk::buffer::FileBuffer;
use crate::disk::flex::{
    is_valid_filename, matches_pattern, split_filename, ContainerType, DirEntry, FileAttributes,
    FlexDate,
};
use crate::disk::image::{image_bytes, ImageContainer, ImageFormat};
use crate::disk::{ContainerInfo, FlexError, Result};

/// Shadow metadata file name.
const METADATA_FILE: &str = ".flexattrs";

/// Geometry of the synthesized image.
const DIR_IMAGE_SECTORS: u8 = 36;

#[derive(Debug, Clone, Copy, Default)]
struct ShadowMeta {
    attributes: FileAttributes,
    random: bool,
}

/// A FLEX container simulated over a host directory.
pub struct DirectoryContainer {
    path: PathBuf,
    image: ImageContainer,
    meta: BTreeMap<String, ShadowMeta>,
    write_protect: bool,
    /// Set when the guest wrote through the sector interface; `update`
    /// then extracts the image back to the host files.
    sectors_dirty: bool,
}

impl DirectoryContainer {
    /// Open a host directory as a container, synthesizing the sector
    /// image from its FLEX-named files.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(FlexError::NotAContainer(path.to_path_buf()));
        }
        let write_protect = fs::metadata(path)?.permissions().readonly();
        let meta = load_metadata(path);

        // Collect host files carrying valid FLEX names.
        let mut files = Vec::new();
        let mut total_records = 0usize;
        for dirent in fs::read_dir(path)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            let host_name = dirent.file_name().to_string_lossy().into_owned();
            if host_name == METADATA_FILE || !is_valid_filename(&host_name) {
                continue;
            }
            let len = dirent.metadata()?.len() as usize;
            total_records += len.div_ceil(252) + 2;
            files.push((host_name, dirent.path()));
        }

        // Size the image to fit everything with headroom.
        let sectors = DIR_IMAGE_SECTORS;
        let tracks = ((total_records / sectors as usize) + 4).clamp(8, 255) as u8;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "DIR".into());
        let data = image_bytes(&sanitize_disk_name(&name), tracks, sectors, ImageFormat::Dsk, None)?;
        let mut image = ImageContainer::open_ram(path, data)?;

        for (host_name, host_path) in files {
            let data = fs::read(&host_path)?;
            let mut buffer = FileBuffer::new(&host_name, data);
            let shadow = meta
                .get(&host_name.to_ascii_uppercase())
                .copied()
                .unwrap_or_default();
            buffer.set_attributes(shadow.attributes);
            buffer.set_random(shadow.random);
            buffer.set_date(host_date(&host_path));
            if let Err(err) = image.write_from_buffer(&buffer, None) {
                warn!("{}: not represented in sector view: {}", host_name, err);
            }
        }

        info!("mounted directory {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            image,
            meta,
            write_protect,
            sectors_dirty: false,
        })
    }

    /// Create a new directory container under `dir`.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        fs::create_dir_all(&path)?;
        Self::open(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protect
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.image.bytes_per_sector()
    }

    pub fn geometry(&self) -> &crate::disk::flex::DiskGeometry {
        self.image.geometry()
    }

    // Sector interface, backed by the synthesized image.

    pub fn read_sector(&mut self, track: u8, sector: u8) -> Result<Vec<u8>> {
        self.image.read_sector(track, sector)
    }

    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> Result<()> {
        if self.write_protect {
            return Err(FlexError::WriteProtected);
        }
        self.image.write_sector(track, sector, data)?;
        self.sectors_dirty = true;
        Ok(())
    }

    // File interface, kept in step on both views.

    fn host_file_for(&self, name: &str) -> Result<Option<PathBuf>> {
        for dirent in fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let host_name = dirent.file_name().to_string_lossy().into_owned();
            if host_name.eq_ignore_ascii_case(name) && dirent.file_type()?.is_file() {
                return Ok(Some(dirent.path()));
            }
        }
        Ok(None)
    }

    pub fn find_file(&mut self, name: &str) -> Result<Option<DirEntry>> {
        self.image.find_file(name)
    }

    pub fn iter_directory(&mut self) -> Result<Vec<DirEntry>> {
        self.image.iter_directory()
    }

    /// Read a file, preferring the byte-exact host copy over the
    /// record-padded sector view.
    pub fn read_to_buffer(&mut self, name: &str) -> Result<FileBuffer> {
        if !is_valid_filename(name) {
            return Err(FlexError::InvalidFilename(name.into()));
        }
        if let Some(host_path) = self.host_file_for(name)? {
            let data = fs::read(&host_path)?;
            let (base, ext) = split_filename(name).expect("validated above");
            let full = if ext.is_empty() {
                base
            } else {
                format!("{}.{}", base, ext)
            };
            let mut buffer = FileBuffer::new(&full, data);
            let shadow = self.meta.get(&full).copied().unwrap_or_default();
            buffer.set_attributes(shadow.attributes);
            buffer.set_random(shadow.random);
            buffer.set_date(host_date(&host_path));
            return Ok(buffer);
        }
        self.image.read_to_buffer(name)
    }

    pub fn write_from_buffer(&mut self, buffer: &FileBuffer, name: Option<&str>) -> Result<()> {
        if self.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let file_name = name.unwrap_or_else(|| buffer.file_name());
        let (base, ext) =
            split_filename(file_name).ok_or_else(|| FlexError::InvalidFilename(file_name.into()))?;
        let full = if ext.is_empty() {
            base
        } else {
            format!("{}.{}", base, ext)
        };
        if self.host_file_for(&full)?.is_some() {
            return Err(FlexError::FileAlreadyExists(full));
        }

        self.image.write_from_buffer(buffer, Some(&full))?;
        fs::write(self.path.join(&full), buffer.data())?;

        if !buffer.attributes().is_empty() || buffer.is_random() {
            self.meta.insert(
                full,
                ShadowMeta {
                    attributes: buffer.attributes(),
                    random: buffer.is_random(),
                },
            );
            self.save_metadata()?;
        }
        Ok(())
    }

    pub fn delete_file(&mut self, pattern: &str) -> Result<usize> {
        if self.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let names: Vec<String> = self
            .image
            .iter_directory()?
            .into_iter()
            .map(|e| e.file_name())
            .filter(|n| matches_pattern(pattern, n))
            .collect();
        if names.is_empty() {
            return Err(FlexError::NoSuchFile(pattern.into()));
        }

        self.image.delete_file(pattern)?;
        for name in &names {
            if let Some(host_path) = self.host_file_for(name)? {
                fs::remove_file(host_path)?;
            }
            let _ = self.meta.remove(name);
            debug!("deleted {}", name);
        }
        self.save_metadata()?;
        Ok(names.len())
    }

    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if self.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let (base, ext) =
            split_filename(new_name).ok_or_else(|| FlexError::InvalidFilename(new_name.into()))?;
        let full = if ext.is_empty() {
            base
        } else {
            format!("{}.{}", base, ext)
        };
        if self.host_file_for(&full)?.is_some() {
            return Err(FlexError::FileAlreadyExists(full));
        }
        let host_path = self
            .host_file_for(old_name)?
            .ok_or_else(|| FlexError::NoSuchFile(old_name.into()))?;

        self.image.rename_file(old_name, &full)?;
        fs::rename(host_path, self.path.join(&full))?;

        if let Some(shadow) = self.meta.remove(&old_name.to_ascii_uppercase()) {
            self.meta.insert(full, shadow);
            self.save_metadata()?;
        }
        Ok(())
    }

    pub fn set_attributes(
        &mut self,
        pattern: &str,
        set_mask: FileAttributes,
        clear_mask: FileAttributes,
    ) -> Result<usize> {
        if self.write_protect {
            return Err(FlexError::WriteProtected);
        }
        let count = self.image.set_attributes(pattern, set_mask, clear_mask)?;
        for entry in self.image.iter_directory()? {
            let name = entry.file_name();
            if matches_pattern(pattern, &name) {
                let shadow = self.meta.entry(name).or_default();
                shadow.attributes = (shadow.attributes & !clear_mask) | set_mask;
            }
        }
        self.save_metadata()?;
        Ok(count)
    }

    pub fn copy_file(
        &mut self,
        name: &str,
        destination: &mut super::DiskContainer,
        dst_name: &str,
    ) -> Result<()> {
        let buffer = self.read_to_buffer(name)?;
        destination.write_from_buffer(&buffer, Some(dst_name))
    }

    pub fn info(&mut self) -> Result<ContainerInfo> {
        let mut info = self.image.info()?;
        info.path = self.path.clone();
        info.container_type = ContainerType::CONTAINER | ContainerType::DIRECTORY;
        info.attributes = if self.write_protect {
            FileAttributes::WRITE_PROTECT
        } else {
            FileAttributes::empty()
        };
        Ok(info)
    }

    /// Propagate guest sector writes back to the host files.
    ///
    /// Files written by the guest come back with their record padding,
    /// since the sector view carries no byte-exact lengths.
    pub fn update(&mut self) -> Result<()> {
        if !self.sectors_dirty {
            return Ok(());
        }
        let entries = self.image.iter_directory()?;
        let mut keep: Vec<String> = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            let buffer = self.image.read_to_buffer(&name)?;
            fs::write(self.path.join(&name), buffer.data())?;
            if !buffer.attributes().is_empty() || buffer.is_random() {
                self.meta.insert(
                    name.clone(),
                    ShadowMeta {
                        attributes: buffer.attributes(),
                        random: buffer.is_random(),
                    },
                );
            }
            keep.push(name);
        }

        // Host files the guest deleted through the sector interface.
        for dirent in fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let host_name = dirent.file_name().to_string_lossy().into_owned();
            if host_name == METADATA_FILE || !is_valid_filename(&host_name) {
                continue;
            }
            if !keep.iter().any(|k| k.eq_ignore_ascii_case(&host_name)) {
                fs::remove_file(dirent.path())?;
                let _ = self.meta.remove(&host_name.to_ascii_uppercase());
            }
        }

        self.save_metadata()?;
        self.sectors_dirty = false;
        debug!("synchronized directory {}", self.path.display());
        Ok(())
    }

    fn save_metadata(&self) -> Result<()> {
        if self.write_protect {
            return Ok(());
        }
        let mut text = String::new();
        for (name, shadow) in &self.meta {
            if shadow.attributes.is_empty() && !shadow.random {
                continue;
            }
            text.push_str(&format!(
                "{} {:02X} {}\n",
                name,
                shadow.attributes.bits(),
                if shadow.random { 'R' } else { '-' }
            ));
        }
        let meta_path = self.path.join(METADATA_FILE);
        if text.is_empty() {
            let _ = fs::remove_file(&meta_path);
        } else {
            fs::write(&meta_path, text)?;
        }
        Ok(())
    }
}

impl Drop for DirectoryContainer {
    fn drop(&mut self) {
        if let Err(err) = self.update() {
            warn!("{}: sync on unmount failed: {}", self.path.display(), err);
        }
    }
}

fn load_metadata(path: &Path) -> BTreeMap<String, ShadowMeta> {
    let mut meta = BTreeMap::new();
    let Ok(text) = fs::read_to_string(path.join(METADATA_FILE)) else {
        return meta;
    };
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(attr), Some(random)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(bits) = u8::from_str_radix(attr, 16) else {
            continue;
        };
        meta.insert(
            name.to_ascii_uppercase(),
            ShadowMeta {
                attributes: FileAttributes::from_bits_truncate(bits),
                random: random == "R",
            },
        );
    }
    meta
}

fn host_date(path: &Path) -> FlexDate {
    use chrono::{DateTime, Datelike, Local};

    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| {
            let local: DateTime<Local> = mtime.into();
            FlexDate {
                day: local.day() as u8,
                month: local.month() as u8,
                year: local.year() as u16,
            }
        })
        .unwrap_or_else(|_| FlexDate::today())
}

fn sanitize_disk_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(8)
        .collect();
    if cleaned.is_empty() || !cleaned.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        format!("D{}", cleaned)
    } else {
        cleaned
    }
}
