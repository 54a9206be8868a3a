//! Endpoint classification by device numbers

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{format_err, Error};
use nix::errno::Errno;

use crate::sg_io::sg_ioctl::{blkgetsize64, blksszget};

/// Character major of the scsi generic driver
pub const SCSI_GENERIC_MAJOR: u32 = 21;
/// Character major of the linux tape driver (st)
pub const SCSI_TAPE_MAJOR: u32 = 9;
/// Character major of the raw driver
pub const RAW_MAJOR: u32 = 162;
const MEM_MAJOR: u32 = 1;
const DEV_NULL_MINOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `/dev/null` or an explicit null sink
    Null,
    /// sg device
    PassThrough,
    Raw,
    /// st device, not usable for copying
    Tape,
    Block,
    Regular,
    /// pipes, ttys and other character devices, only sequential access
    Stream,
}

impl FileType {
    /// Detect the type of `path`
    ///
    /// Files which do not exist yet are treated as regular files, they
    /// are created when opened as output.
    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if path == Path::new("-") {
            return Ok(FileType::Stream);
        }
        match nix::sys::stat::stat(path) {
            Ok(stat) => Ok(Self::from_stat(&stat)),
            Err(Errno::ENOENT) => Ok(FileType::Regular),
            Err(err) => Err(format_err!("unable to stat {:?} - {}", path, err)),
        }
    }

    /// Detect the type of an already opened file (stdin/stdout)
    pub fn detect_file(file: &File) -> Result<Self, Error> {
        let stat = nix::sys::stat::fstat(file.as_raw_fd())?;
        Ok(Self::from_stat(&stat))
    }

    fn from_stat(stat: &nix::sys::stat::FileStat) -> Self {
        let major = unsafe { libc::major(stat.st_rdev) };
        let minor = unsafe { libc::minor(stat.st_rdev) };
        match stat.st_mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Regular,
            libc::S_IFBLK => FileType::Block,
            libc::S_IFCHR => match major {
                MEM_MAJOR if minor == DEV_NULL_MINOR => FileType::Null,
                SCSI_GENERIC_MAJOR => FileType::PassThrough,
                RAW_MAJOR => FileType::Raw,
                SCSI_TAPE_MAJOR => FileType::Tape,
                _ => FileType::Stream,
            },
            _ => FileType::Stream,
        }
    }

    /// Types which support positioned reads and writes
    pub fn is_seekable(self) -> bool {
        matches!(self, FileType::Regular | FileType::Block | FileType::Raw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Null => "null device",
            FileType::PassThrough => "scsi generic device",
            FileType::Raw => "raw device",
            FileType::Tape => "scsi tape device",
            FileType::Block => "block device",
            FileType::Regular => "regular file",
            FileType::Stream => "stream",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size in blocks of a block device, and its logical block size
pub fn block_device_capacity(file: &File) -> Result<(u64, u32), Error> {
    let mut bytes = 0u64;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut bytes) }
        .map_err(|err| format_err!("BLKGETSIZE64 failed - {}", err))?;
    let mut block_size: libc::c_int = 0;
    unsafe { blksszget(file.as_raw_fd(), &mut block_size) }
        .map_err(|err| format_err!("BLKSSZGET failed - {}", err))?;
    if block_size <= 0 {
        return Err(format_err!("block device reports block size {}", block_size));
    }
    Ok((bytes / block_size as u64, block_size as u32))
}
