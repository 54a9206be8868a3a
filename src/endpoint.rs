//! Copy endpoints
//!
//! An endpoint is either the null sink, a plain file (regular file, block
//! or raw device, pipe) accessed with read/write, or a pass-through
//! device driven with SCSI commands.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use sg_pt::{
    file_type::block_device_capacity, read_capacity, FileType, OpenMode, PassThrough,
    PassThroughOpener, SgDeviceOpener,
};

use crate::options::DdFlags;

pub enum Endpoint {
    /// `/dev/null`, or no `of=` given
    Null,
    File(FileEndpoint),
    PassThrough(PtEndpoint),
}

pub struct FileEndpoint {
    pub file: File,
    pub kind: FileType,
    /// positions are implied by the access order (streams, same_fds, append)
    pub sequential: bool,
    pub name: String,
}

pub struct PtEndpoint {
    pub opener: Arc<dyn PassThroughOpener>,
    /// one handle used by all workers (same_fds)
    pub shared: Option<Arc<dyn PassThrough>>,
    pub version: i32,
    pub num_blocks: Option<u64>,
    pub block_length: Option<u32>,
}

impl Endpoint {
    pub fn file_type(&self) -> FileType {
        match self {
            Endpoint::Null => FileType::Null,
            Endpoint::File(file) => file.kind,
            Endpoint::PassThrough(_) => FileType::PassThrough,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Endpoint::PassThrough(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Endpoint::Null)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Endpoint::File(file) if file.sequential)
    }

    pub fn name(&self) -> &str {
        match self {
            Endpoint::Null => "/dev/null",
            Endpoint::File(file) => &file.name,
            Endpoint::PassThrough(pt) => pt.opener.name(),
        }
    }

    pub fn as_pass_through(&self) -> Option<&PtEndpoint> {
        match self {
            Endpoint::PassThrough(pt) => Some(pt),
            _ => None,
        }
    }

    /// Capacity in units of `bs`, if it can be determined
    pub fn num_blocks(&self, bs: usize) -> Result<Option<u64>, Error> {
        match self {
            Endpoint::Null => Ok(None),
            Endpoint::PassThrough(pt) => Ok(pt.num_blocks),
            Endpoint::File(file) => match file.kind {
                FileType::Block => {
                    let (blocks, block_size) = block_device_capacity(&file.file)?;
                    Ok(Some(blocks * block_size as u64 / bs as u64))
                }
                FileType::Regular if !file.sequential => {
                    let len = file.file.metadata()?.len();
                    Ok(Some((len + bs as u64 - 1) / bs as u64))
                }
                _ => Ok(None),
            },
        }
    }
}

fn open_mode(flags: DdFlags) -> OpenMode {
    OpenMode {
        excl: flags.contains(DdFlags::EXCL),
        dsync: flags.contains(DdFlags::DSYNC),
        direct: flags.contains(DdFlags::DIRECT),
        append: flags.contains(DdFlags::APPEND),
        ..Default::default()
    }
}

/// dup() a standard stream so it can be owned as a [File]
fn std_stream(fd: i32) -> Result<File, Error> {
    let fd = nix::unistd::dup(fd).map_err(|err| format_err!("dup of fd {} failed - {}", fd, err))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

impl PtEndpoint {
    /// Probe a pass-through device, reading driver version and capacity
    pub fn probe(opener: Arc<dyn PassThroughOpener>, same_fds: bool) -> Result<Self, Error> {
        let handle = opener.open()?;
        let version = handle
            .version_num()
            .map_err(|err| format_err!("{}: SG_GET_VERSION_NUM failed - {}", opener.name(), err))?;

        let (num_blocks, block_length) = match read_capacity(&*handle) {
            Ok(capacity) => (Some(capacity.num_blocks), Some(capacity.block_length)),
            Err(err) => {
                log::warn!("{}: unable to read capacity - {}", opener.name(), err);
                (None, None)
            }
        };
        log::debug!(
            "{}: sg driver version {}, {:?} blocks of {:?} bytes",
            opener.name(),
            version,
            num_blocks,
            block_length
        );

        Ok(Self {
            opener,
            shared: if same_fds { Some(handle) } else { None },
            version,
            num_blocks,
            block_length,
        })
    }

    /// Handle for one worker
    pub fn handle(&self) -> Result<Arc<dyn PassThrough>, Error> {
        match &self.shared {
            Some(handle) => Ok(Arc::clone(handle)),
            None => self.opener.open(),
        }
    }
}

/// Open the input endpoint
pub fn open_input(
    path: Option<&Path>,
    kind: FileType,
    flags: DdFlags,
    skip: u64,
    bs: usize,
) -> Result<Endpoint, Error> {
    let same_fds = flags.contains(DdFlags::SAME_FDS);
    let name = path.map(|p| p.display().to_string()).unwrap_or_else(|| "-".into());

    let file = match path {
        None => std_stream(libc::STDIN_FILENO)?,
        Some(path) if path == Path::new("-") => std_stream(libc::STDIN_FILENO)?,
        Some(path) => {
            if kind == FileType::PassThrough {
                let mode = OpenMode {
                    excl: flags.contains(DdFlags::EXCL),
                    dsync: flags.contains(DdFlags::DSYNC),
                    ..Default::default()
                };
                let opener = Arc::new(SgDeviceOpener::new(path, mode));
                return Ok(Endpoint::PassThrough(PtEndpoint::probe(opener, same_fds)?));
            }
            let mode = OpenMode {
                read_only: true,
                append: false,
                ..open_mode(flags)
            };
            mode.open(path)?
        }
    };

    let stdin = path.map(|p| p == Path::new("-")).unwrap_or(true);
    let kind = if stdin { FileType::detect_file(&file)? } else { kind };
    let sequential = stdin || same_fds || !kind.is_seekable();

    let mut endpoint = FileEndpoint {
        file,
        kind,
        sequential,
        name,
    };
    if sequential && skip > 0 {
        endpoint.discard(skip * bs as u64)?;
    }
    Ok(Endpoint::File(endpoint))
}

/// Open an output endpoint (`of=` or `of2=`)
pub fn open_output(
    path: Option<&Path>,
    kind: FileType,
    flags: DdFlags,
    seek: u64,
) -> Result<Endpoint, Error> {
    let path = match path {
        None => return Ok(Endpoint::Null),
        Some(path) => path,
    };
    let name = path.display().to_string();

    let file = if path == Path::new("-") {
        std_stream(libc::STDOUT_FILENO)?
    } else {
        match kind {
            FileType::Null => return Ok(Endpoint::Null),
            FileType::PassThrough => {
                let mode = OpenMode {
                    excl: flags.contains(DdFlags::EXCL),
                    dsync: flags.contains(DdFlags::DSYNC),
                    ..Default::default()
                };
                let opener = Arc::new(SgDeviceOpener::new(path, mode));
                return Ok(Endpoint::PassThrough(PtEndpoint::probe(
                    opener,
                    flags.contains(DdFlags::SAME_FDS),
                )?));
            }
            _ => OpenMode {
                create: kind == FileType::Regular,
                ..open_mode(flags)
            }
            .open(path)?,
        }
    };

    let stdout = path == Path::new("-");
    let kind = if stdout { FileType::detect_file(&file)? } else { kind };
    let sequential = stdout
        || flags.intersects(DdFlags::SAME_FDS | DdFlags::APPEND)
        || !kind.is_seekable();

    if sequential && seek > 0 && !flags.contains(DdFlags::APPEND) {
        bail!("{}: can not seek on a {}", name, kind);
    }

    Ok(Endpoint::File(FileEndpoint {
        file,
        kind,
        sequential,
        name,
    }))
}

impl FileEndpoint {
    fn discard(&mut self, mut bytes: u64) -> Result<(), Error> {
        let mut scratch = vec![0u8; 64 * 1024];
        while bytes > 0 {
            let want = bytes.min(scratch.len() as u64) as usize;
            let got = self.read_sequential(&mut scratch[..want])?;
            if got == 0 {
                bail!("{}: end of input while skipping", self.name);
            }
            bytes -= got as u64;
        }
        Ok(())
    }

    fn read_sequential(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut done = 0;
        while done < buf.len() {
            match (&self.file).read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => bail!("{}: read failed - {}", self.name, err),
            }
        }
        Ok(done)
    }

    /// Fill `buf` starting at `offset`, returns the bytes read
    ///
    /// Only an end of file ends the read early, so a short count means
    /// there is no more data.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        if self.sequential {
            return self.read_sequential(buf);
        }
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => bail!("{}: read at offset {} failed - {}", self.name, offset, err),
            }
        }
        Ok(done)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let res = if self.sequential {
            (&self.file).write_all(buf)
        } else {
            self.file.write_all_at(buf, offset)
        };
        res.map_err(|err| format_err!("{}: write at offset {} failed - {}", self.name, offset, err))
    }

    pub fn sync(&self) -> Result<(), Error> {
        if self.kind == FileType::Regular || self.kind == FileType::Block {
            self.file
                .sync_all()
                .map_err(|err| format_err!("{}: fsync failed - {}", self.name, err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regular_file_endpoints() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        std::fs::write(&src, vec![7u8; 1000])?;

        let input = open_input(Some(&src), FileType::Regular, DdFlags::empty(), 0, 512)?;
        assert_eq!(input.num_blocks(512)?, Some(2));
        assert!(!input.is_sequential());

        let dst = dir.path().join("dst");
        let output = open_output(Some(&dst), FileType::Regular, DdFlags::empty(), 3)?;
        match (&input, &output) {
            (Endpoint::File(input), Endpoint::File(output)) => {
                let mut buf = vec![0u8; 1024];
                assert_eq!(input.read_at(&mut buf, 512)?, 488);
                output.write_at(&buf[..488], 3 * 512)?;
            }
            _ => panic!("expected file endpoints"),
        }
        let data = std::fs::read(&dst)?;
        assert_eq!(data.len(), 3 * 512 + 488);
        assert!(data[1536..].iter().all(|b| *b == 7));
        assert!(data[..1536].iter().all(|b| *b == 0));

        let null = open_output(None, FileType::Null, DdFlags::empty(), 0)?;
        assert!(null.is_null());
        assert_eq!(null.num_blocks(512)?, None);
        Ok(())
    }

    #[test]
    fn append_output_is_sequential() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let dst = dir.path().join("log");
        std::fs::write(&dst, b"head")?;
        let output = open_output(Some(&dst), FileType::Regular, DdFlags::APPEND, 0)?;
        assert!(output.is_sequential());
        if let Endpoint::File(file) = &output {
            file.write_at(b"tail", 0)?;
        }
        assert_eq!(std::fs::read(&dst)?, b"headtail");
        Ok(())
    }
}
