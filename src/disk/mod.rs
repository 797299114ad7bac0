//! FLEX disk containers.
//!
//! A [`DiskContainer`] is the store behind one drive slot of the floppy
//! controller: either a packed sector image ([`ImageContainer`], DSK or
//! FLX layout) or a host directory ([`DirectoryContainer`]). Both
//! variants offer the same capability set, so the container is a tagged
//! variant rather than a trait-object hierarchy.

pub mod buffer;
pub mod directory;
pub mod flex;
pub mod image;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use buffer::FileBuffer;
pub use directory::DirectoryContainer;
pub use flex::{
    ContainerType, DirEntry, DiskGeometry, FileAttributes, FlexDate, SECTOR_SIZE,
};
pub use image::{format_disk, AccessMode, ImageContainer, ImageFormat};

/// Errors raised by the disk layer.
///
/// The floppy controller converts these to status bits and the command
/// channel to answer strings; neither lets them escape further.
#[derive(Debug, Error)]
pub enum FlexError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}: not a FLEX container")]
    NotAContainer(PathBuf),

    #[error("unrecognized container format")]
    InvalidFormat,

    #[error("container is write protected")]
    WriteProtected,

    #[error("container is read only")]
    ReadOnly,

    #[error("track {track} sector {sector} outside disk geometry")]
    OutOfRange { track: u8, sector: u8 },

    #[error("invalid FLEX file name: {0}")]
    InvalidFilename(String),

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("directory is full")]
    DirectoryFull,

    #[error("disk is full")]
    DiskFull,

    #[error("sector map full while writing {0}")]
    RecordMapFull(String),

    #[error("invalid parameter")]
    BadParameter,
}

pub type Result<T> = std::result::Result<T, FlexError>;

/// Summary returned by [`DiskContainer::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub path: PathBuf,
    pub name: String,
    pub date: FlexDate,
    pub tracks: u16,
    pub sectors: u16,
    pub free_kb: u32,
    pub total_kb: u32,
    pub container_type: ContainerType,
    pub attributes: FileAttributes,
}

impl ContainerInfo {
    /// Human-readable type tag used by drive info listings.
    pub fn type_name(&self) -> &'static str {
        if self.container_type.contains(ContainerType::DIRECTORY) {
            "directory"
        } else if self.container_type.contains(ContainerType::FLX) {
            "FLX container"
        } else {
            "DSK container"
        }
    }
}

/// A mounted FLEX disk, image- or directory-backed.
pub enum DiskContainer {
    Image(ImageContainer),
    Directory(DirectoryContainer),
}

impl DiskContainer {
    /// Mount `path`: directories become [`DirectoryContainer`]s, files
    /// are probed as packed images.
    pub fn mount(path: &Path, mode: AccessMode) -> Result<Self> {
        if path.is_dir() {
            Ok(Self::Directory(DirectoryContainer::open(path)?))
        } else {
            Ok(Self::Image(ImageContainer::open(path, mode)?))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Image(c) => c.path(),
            Self::Directory(c) => c.path(),
        }
    }

    pub fn is_write_protected(&self) -> bool {
        match self {
            Self::Image(c) => c.is_write_protected(),
            Self::Directory(c) => c.is_write_protected(),
        }
    }

    pub fn bytes_per_sector(&self) -> usize {
        match self {
            Self::Image(c) => c.bytes_per_sector(),
            Self::Directory(c) => c.bytes_per_sector(),
        }
    }

    pub fn geometry(&self) -> &DiskGeometry {
        match self {
            Self::Image(c) => c.geometry(),
            Self::Directory(c) => c.geometry(),
        }
    }

    pub fn read_sector(&mut self, track: u8, sector: u8) -> Result<Vec<u8>> {
        match self {
            Self::Image(c) => c.read_sector(track, sector),
            Self::Directory(c) => c.read_sector(track, sector),
        }
    }

    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> Result<()> {
        match self {
            Self::Image(c) => c.write_sector(track, sector, data),
            Self::Directory(c) => c.write_sector(track, sector, data),
        }
    }

    pub fn find_file(&mut self, name: &str) -> Result<Option<DirEntry>> {
        match self {
            Self::Image(c) => c.find_file(name),
            Self::Directory(c) => c.find_file(name),
        }
    }

    pub fn iter_directory(&mut self) -> Result<Vec<DirEntry>> {
        match self {
            Self::Image(c) => c.iter_directory(),
            Self::Directory(c) => c.iter_directory(),
        }
    }

    pub fn read_to_buffer(&mut self, name: &str) -> Result<FileBuffer> {
        match self {
            Self::Image(c) => c.read_to_buffer(name),
            Self::Directory(c) => c.read_to_buffer(name),
        }
    }

    pub fn write_from_buffer(&mut self, buffer: &FileBuffer, name: Option<&str>) -> Result<()> {
        match self {
            Self::Image(c) => c.write_from_buffer(buffer, name),
            Self::Directory(c) => c.write_from_buffer(buffer, name),
        }
    }

    pub fn delete_file(&mut self, pattern: &str) -> Result<usize> {
        match self {
            Self::Image(c) => c.delete_file(pattern),
            Self::Directory(c) => c.delete_file(pattern),
        }
    }

    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        match self {
            Self::Image(c) => c.rename_file(old_name, new_name),
            Self::Directory(c) => c.rename_file(old_name, new_name),
        }
    }

    pub fn set_attributes(
        &mut self,
        pattern: &str,
        set_mask: FileAttributes,
        clear_mask: FileAttributes,
    ) -> Result<usize> {
        match self {
            Self::Image(c) => c.set_attributes(pattern, set_mask, clear_mask),
            Self::Directory(c) => c.set_attributes(pattern, set_mask, clear_mask),
        }
    }

    pub fn copy_file(&mut self, name: &str, destination: &mut DiskContainer, dst_name: &str) -> Result<()> {
        let buffer = self.read_to_buffer(name)?;
        destination.write_from_buffer(&buffer, Some(dst_name))
    }

    pub fn info(&mut self) -> Result<ContainerInfo> {
        match self {
            Self::Image(c) => c.info(),
            Self::Directory(c) => c.info(),
        }
    }

    /// Flush deferred state: RAM images write back to their file,
    /// directory containers synchronize guest sector writes.
    pub fn update(&mut self) -> Result<()> {
        match self {
            Self::Image(c) => c.update(),
            Self::Directory(c) => c.update(),
        }
    }
}
