//! Synchronous helper commands (READ CAPACITY, SYNCHRONIZE CACHE)

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;

use proxmox_io::ReadExt;

use crate::cdb;
use crate::device::PassThrough;
use crate::sense::{classify, decode_sense, SenseCategory, SenseInfo};
use crate::sg_io::{SgIoHdr, DEF_TIMEOUT_MS, SG_DXFER_FROM_DEV, SG_DXFER_NONE};

#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("{0}")]
    Error(#[from] Error),
    #[error("{0}")]
    Sense(#[from] SenseInfo),
}

impl From<std::io::Error> for ScsiError {
    fn from(error: std::io::Error) -> Self {
        Self::Error(error.into())
    }
}

impl From<nix::Error> for ScsiError {
    fn from(error: nix::Error) -> Self {
        Self::Error(error.into())
    }
}

impl ScsiError {
    /// Category to report for this error
    pub fn category(&self) -> SenseCategory {
        match self {
            ScsiError::Sense(sense) => SenseCategory::from_sense(sense),
            ScsiError::Error(_) => SenseCategory::Other,
        }
    }
}

/// Run one raw SCSI command through SG_IO (v3)
pub struct SgRaw<'a> {
    pt: &'a dyn PassThrough,
    buffer: Vec<u8>,
    sense_buffer: [u8; 32],
    timeout: u32,
}

impl<'a> SgRaw<'a> {
    /// Create a new instance with a data-in buffer of `buffer_size` bytes
    pub fn new(pt: &'a dyn PassThrough, buffer_size: usize) -> Self {
        Self {
            pt,
            buffer: vec![0u8; buffer_size],
            sense_buffer: [0u8; 32],
            timeout: DEF_TIMEOUT_MS,
        }
    }

    /// Set the command timeout in seconds (0 means default (60 seconds))
    pub fn set_timeout(&mut self, seconds: u32) {
        self.timeout = if seconds == 0 {
            DEF_TIMEOUT_MS
        } else {
            seconds.saturating_mul(1000)
        };
    }

    /// Run the specified command, returns the data transferred in
    pub fn do_command(&mut self, cmd: &[u8]) -> Result<&[u8], ScsiError> {
        if cmd.is_empty() || cmd.len() > crate::sg_io::SG_MAX_CDB_SIZE {
            return Err(format_err!("no valid SCSI command").into());
        }

        let mut hdr = SgIoHdr {
            cmd_len: cmd.len() as u8,
            cmdp: cmd.as_ptr(),
            mx_sb_len: self.sense_buffer.len() as u8,
            sbp: self.sense_buffer.as_mut_ptr(),
            timeout: self.timeout,
            ..Default::default()
        };
        if !self.buffer.is_empty() {
            hdr.dxfer_direction = SG_DXFER_FROM_DEV;
            hdr.dxfer_len = self.buffer.len() as u32;
            hdr.dxferp = self.buffer.as_mut_ptr() as *mut std::os::raw::c_void;
        } else {
            hdr.dxfer_direction = SG_DXFER_NONE;
        }

        crate::device::retry_busy(|| self.pt.sg_io_v3(&mut hdr), |_| {})
            .map_err(|err| format_err!("SG_IO failed - {}", err))?;

        let sense_len = (hdr.sb_len_wr as usize).min(self.sense_buffer.len());
        let sense = &self.sense_buffer[..sense_len];
        let category = classify(
            hdr.status as u32,
            hdr.host_status as u32,
            hdr.driver_status as u32,
            sense,
        );
        match category {
            SenseCategory::Clean | SenseCategory::Recovered | SenseCategory::ConditionMet => {}
            _ if sense.is_empty() => {
                return Err(format_err!(
                    "scsi command failed: {} (status {:#x}, host {:#x}, driver {:#x})",
                    category,
                    hdr.status,
                    hdr.host_status,
                    hdr.driver_status
                )
                .into());
            }
            _ => {
                let info = decode_sense(sense)
                    .map_err(|err| format_err!("scsi command failed - {}", err))?;
                return Err(ScsiError::Sense(info));
            }
        }

        let resid = hdr.resid.max(0) as usize;
        if resid > self.buffer.len() {
            return Err(format_err!("SG_IO failed - got strange resid (value too big)").into());
        }
        let data_len = self.buffer.len() - resid;

        Ok(&self.buffer[..data_len])
    }
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadCapacity10Data {
    last_lba: u32,
    block_length: u32,
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadCapacity16Data {
    last_lba: u64,
    block_length: u32,
    flags12: u8,
    flags13: u8,
    lowest_aligned_lba: u16,
    reserved: [u8; 16],
}

/// Capacity of a logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// number of logical blocks
    pub num_blocks: u64,
    pub block_length: u32,
}

/// Run `cmd` and copy out its data, one unit attention (left over from a
/// reset or a media change) is retried
fn command_data(pt: &dyn PassThrough, buffer_size: usize, cmd: &[u8]) -> Result<Vec<u8>, ScsiError> {
    let mut sg_raw = SgRaw::new(pt, buffer_size);
    match sg_raw.do_command(cmd) {
        Err(ScsiError::Sense(sense))
            if SenseCategory::from_sense(&sense) == SenseCategory::UnitAttention =>
        {
            log::debug!("unit attention ({}), retrying once", sense);
        }
        res => return res.map(|data| data.to_vec()),
    }
    sg_raw.do_command(cmd).map(|data| data.to_vec())
}

/// READ CAPACITY(10), falling back to READ CAPACITY(16) for large units
pub fn read_capacity(pt: &dyn PassThrough) -> Result<Capacity, Error> {
    let data = command_data(
        pt,
        std::mem::size_of::<ReadCapacity10Data>(),
        &cdb::read_capacity10(),
    )
    .map_err(|err| format_err!("read capacity(10) failed - {}", err))?;

    let capacity = proxmox_lang::try_block!({
        let mut reader = &data[..];
        let page: ReadCapacity10Data = unsafe { reader.read_be_value()? };
        Ok(Capacity {
            num_blocks: page.last_lba as u64 + 1,
            block_length: page.block_length,
        })
    })
    .map_err(|err: Error| format_err!("decode read capacity(10) failed - {}", err))?;

    if capacity.num_blocks <= u32::MAX as u64 {
        return Ok(capacity);
    }

    // last LBA 0xffffffff means the unit is too large for READ CAPACITY(10)
    let alloc_len = std::mem::size_of::<ReadCapacity16Data>();
    let data = command_data(pt, alloc_len, &cdb::read_capacity16(alloc_len as u32))
        .map_err(|err| format_err!("read capacity(16) failed - {}", err))?;

    proxmox_lang::try_block!({
        if data.len() < 12 {
            bail!("got short data len ({})", data.len());
        }
        let mut padded = [0u8; std::mem::size_of::<ReadCapacity16Data>()];
        padded[..data.len()].copy_from_slice(&data);
        let mut reader = &padded[..];
        let page: ReadCapacity16Data = unsafe { reader.read_be_value()? };
        Ok(Capacity {
            num_blocks: page.last_lba + 1,
            block_length: page.block_length,
        })
    })
    .map_err(|err: Error| format_err!("decode read capacity(16) failed - {}", err))
}

/// SYNCHRONIZE CACHE(10) for the whole unit
pub fn synchronize_cache(pt: &dyn PassThrough) -> Result<(), ScsiError> {
    let mut sg_raw = SgRaw::new(pt, 0);
    sg_raw.do_command(&cdb::synchronize_cache10())?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::emulate::EmulatedDisk;
    use crate::sense::SENSE_KEY_UNIT_ATTENTION;

    #[test]
    fn capacity_of_emulated_disk() -> Result<(), Error> {
        let disk = EmulatedDisk::new(512, 1000);
        let pt = disk.open_handle();
        let capacity = read_capacity(&*pt)?;
        assert_eq!(
            capacity,
            Capacity {
                num_blocks: 1000,
                block_length: 512
            }
        );
        synchronize_cache(&*pt).map_err(|err| format_err!("{}", err))?;
        Ok(())
    }

    #[test]
    fn sense_is_reported() -> Result<(), Error> {
        let disk = EmulatedDisk::new(512, 8);
        disk.inject_unit_attentions(1);
        let pt = disk.open_handle();
        match synchronize_cache(&*pt) {
            Err(ScsiError::Sense(sense)) => {
                assert_eq!(sense.sense_key, SENSE_KEY_UNIT_ATTENTION);
            }
            other => panic!("expected unit attention, got {:?}", other),
        }
        synchronize_cache(&*pt).map_err(|err| format_err!("{}", err))?;
        Ok(())
    }

    #[test]
    fn capacity_survives_one_unit_attention() -> Result<(), Error> {
        let disk = EmulatedDisk::new(512, 100);
        let pt = disk.open_handle();

        disk.inject_unit_attentions(1);
        assert_eq!(read_capacity(&*pt)?.num_blocks, 100);

        disk.inject_unit_attentions(2);
        assert!(read_capacity(&*pt).is_err());
        Ok(())
    }
}
