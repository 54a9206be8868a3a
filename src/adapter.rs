//! Submitting single commands to a pass-through handle
//!
//! A [Command] owns its CDB and sense buffer and keeps an sg v4 header
//! pointing at them. v4 capable handles go through SG_IOSUBMIT and
//! SG_IORECEIVE, older drivers get the header converted to v3 and run
//! through the blocking SG_IO ioctl.

use anyhow::Error;
use nix::errno::Errno;

use sg_pt::device::{retry_busy, set_ctl_flags};
use sg_pt::sense::decode_sense;
use sg_pt::sg_io::{SG_DXFER_FROM_DEV, SG_DXFER_NONE, SG_DXFER_TO_DEV};
use sg_pt::{classify, CtlFlags, PassThrough, SenseCategory, SenseInfo, SgFlags, SgIoHdr, SgIoV4};

use crate::collection::SharedState;
use crate::error::DdError;
use crate::stats::Counters;

pub const SENSE_LEN: usize = 32;

/// Unit attentions and aborted commands are retried this often
pub const MAX_RETRIES: u32 = 16;

pub struct Command {
    pub hdr: SgIoV4,
    cdb: Vec<u8>,
    sense: Box<[u8; SENSE_LEN]>,
}

/// What came back for one command
#[derive(Debug, Clone)]
pub struct Completion {
    pub category: SenseCategory,
    pub resid: i32,
    pub info: u32,
    pub duration: u32,
    pub sense: Option<SenseInfo>,
}

impl Completion {
    /// Good completion, recovered errors and NO SENSE included
    pub fn is_good(&self) -> bool {
        matches!(
            self.category,
            SenseCategory::Clean
                | SenseCategory::ConditionMet
                | SenseCategory::NoSense
                | SenseCategory::Recovered
        )
    }

    pub fn describe(&self) -> String {
        match &self.sense {
            Some(sense) => format!("{} ({})", self.category, sense),
            None => self.category.to_string(),
        }
    }
}

impl Command {
    pub fn new(cdb: Vec<u8>, flags: SgFlags, pack_id: i32) -> Self {
        let mut cmd = Self {
            hdr: SgIoV4::new(),
            cdb,
            sense: Box::new([0u8; SENSE_LEN]),
        };
        cmd.hdr.set_sg_flags(flags);
        cmd.hdr.set_pack_id(pack_id);
        cmd.attach();
        cmd
    }

    // the heap addresses of cdb and sense never change once built
    fn attach(&mut self) {
        self.hdr.request_len = self.cdb.len() as u32;
        self.hdr.request = self.cdb.as_ptr() as u64;
        self.hdr.max_response_len = SENSE_LEN as u32;
        self.hdr.response = self.sense.as_mut_ptr() as u64;
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn pack_id(&self) -> i32 {
        self.hdr.pack_id()
    }

    pub fn flags(&self) -> SgFlags {
        self.hdr.sg_flags()
    }

    pub fn set_din(&mut self, addr: u64, len: usize) {
        self.hdr.din_xferp = addr;
        self.hdr.din_xfer_len = len as u32;
    }

    pub fn set_dout(&mut self, addr: u64, len: usize) {
        self.hdr.dout_xferp = addr;
        self.hdr.dout_xfer_len = len as u32;
    }

    /// Data-out starts `offset` bytes into the buffer (or reservation)
    pub fn set_dout_offset(&mut self, offset: u32) {
        self.hdr.set_sg_flags(self.flags() | SgFlags::DOUT_OFFSET);
        self.hdr.spare_in = offset;
    }

    /// Prepare a resubmission of the same command
    pub fn rearm(&mut self, pack_id: i32) {
        self.hdr.reset_output();
        self.hdr.set_pack_id(pack_id);
        self.sense.fill(0);
    }

    pub fn completion(&self) -> Completion {
        completion_of(&self.hdr, &self.sense[..])
    }

    fn to_v3(&mut self) -> SgIoHdr {
        let (direction, len, ptr) = if self.hdr.dout_xfer_len > 0 {
            (SG_DXFER_TO_DEV, self.hdr.dout_xfer_len, self.hdr.dout_xferp)
        } else if self.hdr.din_xfer_len > 0 {
            (SG_DXFER_FROM_DEV, self.hdr.din_xfer_len, self.hdr.din_xferp)
        } else {
            (SG_DXFER_NONE, 0, 0)
        };
        let v3_flags = SgFlags::DIRECT_IO | SgFlags::MMAP_IO | SgFlags::Q_AT_TAIL | SgFlags::Q_AT_HEAD;

        SgIoHdr {
            dxfer_direction: direction,
            cmd_len: self.cdb.len() as u8,
            mx_sb_len: SENSE_LEN as u8,
            dxfer_len: len,
            dxferp: ptr as *mut libc::c_void,
            cmdp: self.cdb.as_ptr(),
            sbp: self.sense.as_mut_ptr(),
            timeout: self.hdr.timeout,
            flags: (self.flags() & v3_flags).bits(),
            pack_id: self.pack_id(),
            ..Default::default()
        }
    }

    fn from_v3(&mut self, v3: &SgIoHdr) {
        self.hdr.device_status = v3.status as u32;
        self.hdr.transport_status = v3.host_status as u32;
        self.hdr.driver_status = v3.driver_status as u32;
        self.hdr.din_resid = v3.resid;
        self.hdr.info = v3.info;
        self.hdr.duration = v3.duration;
        self.hdr.response_len = v3.sb_len_wr as u32;
    }
}

/// Classify a completed v4 header, `sense` is the response buffer
pub fn completion_of(hdr: &SgIoV4, sense: &[u8]) -> Completion {
    let sense = &sense[..(hdr.response_len as usize).min(sense.len())];
    let category = classify(hdr.device_status, hdr.transport_status, hdr.driver_status, sense);
    Completion {
        category,
        resid: hdr.din_resid,
        info: hdr.info,
        duration: hdr.duration,
        sense: if sense.is_empty() {
            None
        } else {
            decode_sense(sense).ok()
        },
    }
}

fn count_busy(counters: &Counters, errno: Errno) {
    match errno {
        Errno::EBUSY => Counters::inc(&counters.ebusy),
        _ => Counters::inc(&counters.eagain),
    }
}

/// Map an ioctl failure to a typed error
pub fn ioctl_error(pt: &dyn PassThrough, what: &str, errno: Errno) -> Error {
    match errno {
        Errno::ENOMEM => DdError::OutOfMemory(format!("{} - {}", what, errno)).into(),
        Errno::E2BIG => {
            // leave a snapshot of the driver state in the kernel log
            if let Err(err) = set_ctl_flags(pt, CtlFlags::SNAP_DEV, true) {
                log::debug!("device snapshot failed - {}", err);
            }
            DdError::Scsi {
                category: SenseCategory::Other,
                message: format!("{} - {}", what, errno),
            }
            .into()
        }
        _ => DdError::Scsi {
            category: SenseCategory::Other,
            message: format!("{} - {}", what, errno),
        }
        .into(),
    }
}

/// SG_IOSUBMIT, retried while the driver is busy
pub fn submit(shared: &SharedState, pt: &dyn PassThrough, hdr: &mut SgIoV4) -> Result<(), Error> {
    let counters = &shared.counters;
    retry_busy(|| pt.submit(hdr), |errno| count_busy(counters, errno))
        .map_err(|errno| ioctl_error(pt, "SG_IOSUBMIT", errno))
}

/// SG_IORECEIVE for the pack id in `hdr`, waits for the completion
pub fn receive(pt: &dyn PassThrough, hdr: &mut SgIoV4) -> Result<(), Error> {
    retry_busy(|| pt.receive(hdr), |_| ()).map_err(|errno| ioctl_error(pt, "SG_IORECEIVE", errno))
}

/// Blocking SG_IO with a v4 header
pub fn sg_io(shared: &SharedState, pt: &dyn PassThrough, hdr: &mut SgIoV4) -> Result<(), Error> {
    let counters = &shared.counters;
    retry_busy(|| pt.sg_io_v4(hdr), |errno| count_busy(counters, errno))
        .map_err(|errno| ioctl_error(pt, "SG_IO", errno))
}

/// Run `cmd` synchronously through SG_IO, v3 or v4 header
pub fn run_blocking(
    shared: &SharedState,
    pt: &dyn PassThrough,
    cmd: &mut Command,
    v4: bool,
) -> Result<Completion, Error> {
    if v4 {
        sg_io(shared, pt, &mut cmd.hdr)?;
        return Ok(cmd.completion());
    }
    let mut v3 = cmd.to_v3();
    let counters = &shared.counters;
    retry_busy(|| pt.sg_io_v3(&mut v3), |errno| count_busy(counters, errno))
        .map_err(|errno| ioctl_error(pt, "SG_IO (v3)", errno))?;
    cmd.from_v3(&v3);
    Ok(cmd.completion())
}

/// Ask the driver to abort the command matching `hdr`'s pack id
///
/// Returns true if the abort was accepted. A command that already
/// completed (ENODATA) is not an error.
pub fn abort(pt: &dyn PassThrough, hdr: &SgIoV4) -> Result<bool, Error> {
    match pt.abort(hdr) {
        Ok(()) => Ok(true),
        Err(Errno::ENODATA) => Ok(false),
        Err(errno) => Err(ioctl_error(pt, "SG_IOABORT", errno)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::Ordering;

    use sg_pt::cdb::{build_rw_cdb, RwOp};
    use sg_pt::emulate::EmulatedDisk;
    use sg_pt::AlignedBuffer;

    use crate::collection::SharedState;

    #[test]
    fn v3_and_v4_read() -> Result<(), Error> {
        let data: Vec<u8> = (0..512 * 4).map(|i| (i % 253) as u8).collect();
        let disk = EmulatedDisk::with_data(512, data.clone());
        let pt = disk.open_handle();
        let shared = SharedState::for_test(4);

        let mut buf = AlignedBuffer::new(512 * 2)?;
        let cdb = build_rw_cdb(10, RwOp::Read, 1, 2, false, false)?;

        let mut cmd = Command::new(cdb.clone(), SgFlags::empty(), 1);
        cmd.set_din(buf.addr(), buf.len());
        let done = run_blocking(&shared, &*pt, &mut cmd, false)?;
        assert_eq!(done.category, SenseCategory::Clean);
        assert_eq!(buf.as_slice(), &data[512..512 * 3]);

        buf.as_mut_slice().fill(0);
        let mut cmd = Command::new(cdb, SgFlags::empty(), 2);
        cmd.set_din(buf.addr(), buf.len());
        submit(&shared, &*pt, &mut cmd.hdr)?;
        receive(&*pt, &mut cmd.hdr)?;
        assert!(cmd.completion().is_good());
        assert_eq!(buf.as_slice(), &data[512..512 * 3]);
        assert_eq!(shared.counters.ebusy.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[test]
    fn sense_is_classified() -> Result<(), Error> {
        let disk = EmulatedDisk::new(512, 8);
        disk.inject_medium_error(3);
        let pt = disk.open_handle();
        let shared = SharedState::for_test(8);

        let mut buf = AlignedBuffer::new(512 * 4)?;
        let cdb = build_rw_cdb(10, RwOp::Read, 0, 4, false, false)?;
        let mut cmd = Command::new(cdb, SgFlags::empty(), 7);
        cmd.set_din(buf.addr(), buf.len());
        let done = run_blocking(&shared, &*pt, &mut cmd, true)?;
        assert_eq!(done.category, SenseCategory::MediumHard);
        assert!(!done.is_good());
        assert!(done.sense.is_some());

        // already completed, nothing to abort
        assert!(!abort(&*pt, &cmd.hdr)?);
        Ok(())
    }
}
