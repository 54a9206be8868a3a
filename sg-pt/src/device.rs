//! Pass-through handles
//!
//! [PassThrough] is the seam between the copy engine and the sg driver.
//! [SgDevice] talks to a real `/dev/sgN` node, the emulated disk in
//! [crate::emulate] implements the same traits in process.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::sg_io::{sg_ioctl::*, CtlFlags, SeiMask, SgExtendedInfo, SgIoHdr, SgIoV4};

/// One open file descriptor onto a SCSI pass-through device
///
/// All methods take `&self`, the driver serializes per fd state itself.
pub trait PassThrough: Send + Sync {
    fn raw_fd(&self) -> RawFd;

    /// Synchronous v3 command (SG_IO)
    fn sg_io_v3(&self, hdr: &mut SgIoHdr) -> nix::Result<()>;

    /// Synchronous v4 command or multiple requests (SG_IO)
    fn sg_io_v4(&self, hdr: &mut SgIoV4) -> nix::Result<()>;

    /// SG_IOSUBMIT
    fn submit(&self, hdr: &mut SgIoV4) -> nix::Result<()>;

    /// SG_IORECEIVE
    fn receive(&self, hdr: &mut SgIoV4) -> nix::Result<()>;

    /// SG_IOABORT, matches on `request_extra` (pack id or mrq id)
    fn abort(&self, hdr: &SgIoV4) -> nix::Result<()>;

    /// Number of completed requests waiting to be received
    fn num_waiting(&self) -> nix::Result<i32>;

    fn set_get_extended(&self, sei: &mut SgExtendedInfo) -> nix::Result<()>;

    fn set_reserved_size(&self, size: i32) -> nix::Result<()>;

    fn reserved_size(&self) -> nix::Result<i32>;

    /// Make SG_IORECEIVE match on the pack id given in the header
    fn set_force_pack_id(&self, on: bool) -> nix::Result<()>;

    /// Driver version, e.g. 40045 for 4.0.45
    fn version_num(&self) -> nix::Result<i32>;

    /// Map the reservation buffer into user space
    fn map_reservation(&self, _len: usize, _keep: bool) -> Result<ReservationMap, Error> {
        bail!("reservation buffer mapping not supported");
    }
}

/// Hands out fresh handles onto one logical unit
pub trait PassThroughOpener: Send + Sync {
    fn open(&self) -> Result<Arc<dyn PassThrough>, Error>;

    fn name(&self) -> &str;
}

/// Open flags derived from iflag=/oflag=
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read_only: bool,
    pub excl: bool,
    pub dsync: bool,
    pub direct: bool,
    pub append: bool,
    /// create (and do not truncate) missing regular files
    pub create: bool,
}

impl OpenMode {
    fn custom_flags(&self) -> i32 {
        let mut flags = 0;
        if self.excl {
            flags |= libc::O_EXCL;
        }
        if self.dsync {
            flags |= libc::O_SYNC;
        }
        if self.direct {
            flags |= libc::O_DIRECT;
        }
        flags
    }

    /// Open a non pass-through endpoint
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<File, Error> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        if !self.read_only {
            options.write(true);
        }
        if self.append {
            options.append(true);
        }
        if self.create {
            options.create(true);
        }
        // O_EXCL together with O_CREAT would refuse existing files
        let mut custom = self.custom_flags();
        if self.create {
            custom &= !libc::O_EXCL;
        }
        options
            .custom_flags(custom)
            .open(path)
            .map_err(|err| format_err!("could not open {:?} - {}", path, err))
    }
}

/// A real sg device node
pub struct SgDevice {
    file: File,
}

impl SgDevice {
    /// Opens a sg device
    ///
    /// The open call uses O_NONBLOCK so it does not wait for the device,
    /// the flag is cleared again once the open succeeded.
    pub fn open<P: AsRef<Path>>(path: P, mode: &OpenMode) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        if !mode.read_only {
            options.write(true);
        }
        let file = options
            .custom_flags(mode.custom_flags() | libc::O_NONBLOCK)
            .open(path)
            .map_err(|err| format_err!("could not open {:?} - {}", path, err))?;

        let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?;
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.remove(OFlag::O_NONBLOCK);
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags))?;

        let stat = nix::sys::stat::fstat(file.as_raw_fd())?;
        let major = unsafe { libc::major(stat.st_rdev) };
        if stat.st_mode & libc::S_IFMT != libc::S_IFCHR
            || major != crate::file_type::SCSI_GENERIC_MAJOR
        {
            bail!("{:?} is not a scsi generic device", path);
        }

        Ok(Self { file })
    }
}

impl PassThrough for SgDevice {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn sg_io_v3(&self, hdr: &mut SgIoHdr) -> nix::Result<()> {
        unsafe { sg_io_v3(self.raw_fd(), hdr) }.map(drop)
    }

    fn sg_io_v4(&self, hdr: &mut SgIoV4) -> nix::Result<()> {
        unsafe { sg_io_v4(self.raw_fd(), hdr) }.map(drop)
    }

    fn submit(&self, hdr: &mut SgIoV4) -> nix::Result<()> {
        unsafe { sg_iosubmit(self.raw_fd(), hdr) }.map(drop)
    }

    fn receive(&self, hdr: &mut SgIoV4) -> nix::Result<()> {
        unsafe { sg_ioreceive(self.raw_fd(), hdr) }.map(drop)
    }

    fn abort(&self, hdr: &SgIoV4) -> nix::Result<()> {
        unsafe { sg_ioabort(self.raw_fd(), hdr) }.map(drop)
    }

    fn num_waiting(&self) -> nix::Result<i32> {
        let mut num = 0;
        unsafe { sg_get_num_waiting(self.raw_fd(), &mut num) }?;
        Ok(num)
    }

    fn set_get_extended(&self, sei: &mut SgExtendedInfo) -> nix::Result<()> {
        unsafe { sg_set_get_extended(self.raw_fd(), sei) }.map(drop)
    }

    fn set_reserved_size(&self, size: i32) -> nix::Result<()> {
        unsafe { sg_set_reserved_size(self.raw_fd(), &size) }.map(drop)
    }

    fn reserved_size(&self) -> nix::Result<i32> {
        let mut size = 0;
        unsafe { sg_get_reserved_size(self.raw_fd(), &mut size) }?;
        Ok(size)
    }

    fn set_force_pack_id(&self, on: bool) -> nix::Result<()> {
        let value: libc::c_int = on.into();
        unsafe { sg_set_force_pack_id(self.raw_fd(), &value) }.map(drop)
    }

    fn version_num(&self) -> nix::Result<i32> {
        let mut version = 0;
        unsafe { sg_get_version_num(self.raw_fd(), &mut version) }?;
        Ok(version)
    }

    fn map_reservation(&self, len: usize, keep: bool) -> Result<ReservationMap, Error> {
        ReservationMap::map(self.raw_fd(), len, keep)
    }
}

/// Opens [SgDevice] handles, one per worker
pub struct SgDeviceOpener {
    path: PathBuf,
    name: String,
    mode: OpenMode,
}

impl SgDeviceOpener {
    pub fn new<P: AsRef<Path>>(path: P, mode: OpenMode) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path.to_string_lossy().into_owned();
        Self { path, name, mode }
    }
}

impl PassThroughOpener for SgDeviceOpener {
    fn open(&self) -> Result<Arc<dyn PassThrough>, Error> {
        Ok(Arc::new(SgDevice::open(&self.path, &self.mode)?))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Share the reservation of `read_side` with `write_side`
///
/// Issued on the write side, which names the read side fd.
pub fn share(write_side: &dyn PassThrough, read_side: &dyn PassThrough) -> nix::Result<()> {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: SeiMask::SHARE_FD.bits(),
        sei_rd_mask: SeiMask::SHARE_FD.bits(),
        share_fd: read_side.raw_fd() as u32,
        ..Default::default()
    };
    write_side.set_get_extended(&mut sei)?;
    log::debug!(
        "fd {} shares reservation of fd {}",
        write_side.raw_fd(),
        read_side.raw_fd()
    );
    Ok(())
}

/// Break up a share, issued on the read side
pub fn unshare(read_side: &dyn PassThrough) -> nix::Result<()> {
    set_ctl_flags(read_side, CtlFlags::UNSHARE, true)
}

/// Set (or clear) SG_CTL_FLAGM_* bits
pub fn set_ctl_flags(pt: &dyn PassThrough, flags: CtlFlags, on: bool) -> nix::Result<()> {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: SeiMask::CTL_FLAGS.bits(),
        ctl_flags_wr_mask: flags.bits(),
        ctl_flags: if on { flags.bits() } else { 0 },
        ..Default::default()
    };
    pt.set_get_extended(&mut sei)
}

/// Read back SG_CTL_FLAGM_* bits
pub fn get_ctl_flags(pt: &dyn PassThrough, flags: CtlFlags) -> nix::Result<CtlFlags> {
    let mut sei = SgExtendedInfo {
        sei_rd_mask: SeiMask::CTL_FLAGS.bits(),
        ctl_flags_rd_mask: flags.bits(),
        ..Default::default()
    };
    pt.set_get_extended(&mut sei)?;
    Ok(CtlFlags::from_bits_truncate(sei.ctl_flags) & flags)
}

/// Scatter gather element size of the reservation, 0 keeps the default
pub fn set_elem_size(pt: &dyn PassThrough, size: u32) -> nix::Result<()> {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: SeiMask::SGAT_ELEM_SZ.bits(),
        sgat_elem_sz: size,
        ..Default::default()
    };
    pt.set_get_extended(&mut sei)
}

/// Raise the per fd threshold of memory used for data transfers
pub fn set_fd_threshold(pt: &dyn PassThrough, bytes: u32) -> nix::Result<()> {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: SeiMask::TOT_FD_THRESH.bits(),
        tot_fd_thresh: bytes,
        ..Default::default()
    };
    pt.set_get_extended(&mut sei)
}

/// User space mapping of a reservation buffer
///
/// Unmapped on drop unless created with `keep`.
pub struct ReservationMap {
    ptr: NonNull<u8>,
    len: usize,
    keep: bool,
}

// The mapping is owned by one worker, the kernel serializes accesses
// through the commands issued on the fd.
unsafe impl Send for ReservationMap {}

impl ReservationMap {
    fn map(fd: RawFd, len: usize, keep: bool) -> Result<Self, Error> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};

        let length = std::num::NonZeroUsize::new(len)
            .ok_or_else(|| format_err!("cannot map an empty reservation"))?;
        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|err| format_err!("mmap of reservation buffer failed - {}", err))?;

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| format_err!("mmap returned a NULL mapping"))?;

        Ok(Self { ptr, len, keep })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ReservationMap {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) =
            unsafe { nix::sys::mman::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) }
        {
            log::warn!("munmap of reservation buffer failed - {}", err);
        }
    }
}

/// Retry an ioctl while the driver reports EAGAIN or EBUSY
///
/// Every retry yields the thread, `on_retry` is called with the errno so
/// callers can count them.
pub fn retry_busy<T, F, C>(mut op: F, mut on_retry: C) -> nix::Result<T>
where
    F: FnMut() -> nix::Result<T>,
    C: FnMut(Errno),
{
    loop {
        match op() {
            Err(err @ (Errno::EAGAIN | Errno::EBUSY)) => {
                on_retry(err);
                std::thread::yield_now();
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_mode_flags() {
        let mode = OpenMode {
            excl: true,
            dsync: true,
            ..Default::default()
        };
        assert_eq!(mode.custom_flags(), libc::O_EXCL | libc::O_SYNC);
        assert_eq!(OpenMode::default().custom_flags(), 0);
    }

    #[test]
    fn plain_file_is_not_sg() -> Result<(), Error> {
        let file = tempfile::NamedTempFile::new()?;
        assert!(SgDevice::open(file.path(), &OpenMode::default()).is_err());
        Ok(())
    }

    #[test]
    fn retry_counts_busy() {
        let mut attempts = 0;
        let mut retries = Vec::new();
        let res = retry_busy(
            || {
                attempts += 1;
                match attempts {
                    1 => Err(Errno::EAGAIN),
                    2 => Err(Errno::EBUSY),
                    _ => Ok(attempts),
                }
            },
            |err| retries.push(err),
        );
        assert_eq!(res, Ok(3));
        assert_eq!(retries, vec![Errno::EAGAIN, Errno::EBUSY]);

        let res: nix::Result<()> = retry_busy(|| Err(Errno::ENOMEM), |_| panic!("no retry"));
        assert_eq!(res, Err(Errno::ENOMEM));
    }
}
