//! Linux SCSI generic driver interface definitions
//!
//! from: include/scsi/sg.h, include/uapi/linux/bsg.h and the sg v4
//! driver (version 4.0.x) uapi header.
//!
//! also see: <http://sg.danny.cz/sg/sg_v40.html>

use std::os::raw::c_void;

use libc::c_int;

/// Interface id of the v3 header ('S')
pub const SG_INTERFACE_ID_V3: c_int = b'S' as c_int;
/// Guard of the v4 header ('Q')
pub const SG_GUARD_V4: i32 = b'Q' as i32;

pub const SG_DXFER_NONE: c_int = -1;
pub const SG_DXFER_TO_DEV: c_int = -2;
pub const SG_DXFER_FROM_DEV: c_int = -3;

/// Largest CDB the driver accepts
pub const SG_MAX_CDB_SIZE: usize = 32;

/// Minimum sg driver version (4.0.00) offering SG_IOSUBMIT and friends
pub const SG_V4_MIN_VERSION: i32 = 40000;

/// Command timeout used for every command (milliseconds)
pub const DEF_TIMEOUT_MS: u32 = 60_000;

// sg_io_hdr::info / sg_io_v4::info bits
pub const SG_INFO_CHECK: u32 = 0x1;
pub const SG_INFO_DIRECT_IO_MASK: u32 = 0x6;
pub const SG_INFO_DIRECT_IO: u32 = 0x2;
pub const SG_INFO_MIXED_IO: u32 = 0x4;

// host (transport) status values, see include/scsi/scsi.h
pub const DID_OK: u32 = 0x00;
pub const DID_NO_CONNECT: u32 = 0x01;
pub const DID_BUS_BUSY: u32 = 0x02;
pub const DID_TIME_OUT: u32 = 0x03;
pub const DID_ABORT: u32 = 0x05;
pub const DID_NEXUS_FAILURE: u32 = 0x11;

// driver status values (low nibble is the "masked" status)
pub const DRIVER_OK: u32 = 0x00;
pub const DRIVER_TIMEOUT: u32 = 0x06;
pub const DRIVER_SENSE: u32 = 0x08;

/// sg v3 header (struct sg_io_hdr)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgIoHdr {
    pub interface_id: c_int,
    pub dxfer_direction: c_int,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: u16,
    pub dxfer_len: u32,
    pub dxferp: *mut c_void,
    pub cmdp: *const u8,
    pub sbp: *mut u8,
    pub timeout: u32,
    pub flags: u32,
    pub pack_id: c_int,
    pub usr_ptr: *mut c_void,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: c_int,
    pub duration: u32,
    pub info: u32,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        Self {
            interface_id: SG_INTERFACE_ID_V3,
            dxfer_direction: SG_DXFER_NONE,
            cmd_len: 0,
            mx_sb_len: 0,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: std::ptr::null_mut(),
            cmdp: std::ptr::null(),
            sbp: std::ptr::null_mut(),
            timeout: DEF_TIMEOUT_MS,
            flags: 0,
            pack_id: -1,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }
}

/// sg v4 header (struct sg_io_v4)
///
/// Buffer addresses are stored as `u64` bit patterns, exactly as the
/// kernel expects them. The struct is plain data and can be moved
/// between threads, the buffers it points to must outlive the command.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SgIoV4 {
    pub guard: i32,
    pub protocol: u32,
    pub subprotocol: u32,

    pub request_len: u32,
    pub request: u64,
    pub request_tag: u64,
    pub request_attr: u32,
    pub request_priority: u32,
    /// used as pack id (or mrq id for a multiple requests control object)
    pub request_extra: u32,
    pub max_response_len: u32,
    pub response: u64,

    pub dout_iovec_count: u32,
    pub dout_xfer_len: u32,
    pub din_iovec_count: u32,
    pub din_xfer_len: u32,
    pub dout_xferp: u64,
    pub din_xferp: u64,

    pub timeout: u32,
    pub flags: u32,
    pub usr_ptr: u64,
    /// byte offset into the data-out buffer when DOUT_OFFSET is given
    pub spare_in: u32,

    pub driver_status: u32,
    pub transport_status: u32,
    pub device_status: u32,
    pub retry_delay: u32,
    pub info: u32,
    pub duration: u32,
    pub response_len: u32,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub generated_tag: u64,
    pub spare_out: u32,

    pub padding: u32,
}

impl SgIoV4 {
    /// Size of one header, used to compute multiple requests array lengths
    pub const SIZE: usize = std::mem::size_of::<SgIoV4>();

    /// Creates a zeroed header with guard and default timeout set
    pub fn new() -> Self {
        Self {
            guard: SG_GUARD_V4,
            timeout: DEF_TIMEOUT_MS,
            ..Default::default()
        }
    }

    /// Pack id carried by this header
    pub fn pack_id(&self) -> i32 {
        self.request_extra as i32
    }

    pub fn set_pack_id(&mut self, pack_id: i32) {
        self.request_extra = pack_id as u32;
    }

    pub fn sg_flags(&self) -> SgFlags {
        SgFlags::from_bits_truncate(self.flags)
    }

    pub fn set_sg_flags(&mut self, flags: SgFlags) {
        self.flags = flags.bits();
    }

    /// Clears the output fields so a header can be submitted again
    pub fn reset_output(&mut self) {
        self.driver_status = 0;
        self.transport_status = 0;
        self.device_status = 0;
        self.retry_delay = 0;
        self.info = 0;
        self.duration = 0;
        self.response_len = 0;
        self.din_resid = 0;
        self.dout_resid = 0;
        self.generated_tag = 0;
        self.spare_out = 0;
    }
}

bitflags::bitflags! {
    /// Request flags (sg_io_v4::flags, the low bits are shared with v3)
    pub struct SgFlags: u32 {
        const DIRECT_IO = 0x1;
        const MMAP_IO = 0x4;
        const YIELD_TAG = 0x8;
        const Q_AT_TAIL = 0x10;
        const Q_AT_HEAD = 0x20;
        /// dout byte offset in sg_io_v4::spare_in
        const DOUT_OFFSET = 0x40;
        /// don't put on wait queue (async only)
        const NO_WAITQ = 0x80;
        /// mrq: complete this request before the next one
        const COMPLETE_B4 = 0x100;
        const SIG_ON_OTHER = 0x200;
        /// receive polls, submit returns immediately
        const IMMED = 0x400;
        /// stop a synchronous mrq on the first error or warning
        const STOP_IF = 0x800;
        /// widens the scope of SG_IOABORT to the whole device
        const DEV_SCOPE = 0x1000;
        /// use the shared reservation (needs SG_SEIM_SHARE_FD)
        const SHARE = 0x2000;
        /// mrq: run this request on the other fd of the share pair
        const DO_ON_OTHER = 0x4000;
        /// no user space transfer, device to kernel transfer still happens
        const NO_DXFER = 0x10000;
        /// keep the shared reservation for another data-out command
        const KEEP_SHARE = 0x20000;
        /// data-in/data-out point at an array of sg_io_v4 requests
        const MULTIPLE_REQS = 0x40000;
    }
}

bitflags::bitflags! {
    /// SG_SEIM_* bits for sg_extended_info::sei_wr_mask and sei_rd_mask
    pub struct SeiMask: u32 {
        const CTL_FLAGS = 0x1;
        const READ_VAL = 0x2;
        const RESERVED_SIZE = 0x4;
        const TOT_FD_THRESH = 0x8;
        const MINOR_INDEX = 0x10;
        const SHARE_FD = 0x20;
        const CHG_SHARE_FD = 0x40;
        const SGAT_ELEM_SZ = 0x80;
    }
}

bitflags::bitflags! {
    /// SG_CTL_FLAGM_* bits for sg_extended_info::ctl_flags
    pub struct CtlFlags: u32 {
        const TIME_IN_NS = 0x1;
        const OTHER_OPENS = 0x2;
        const ORPHANS = 0x4;
        const Q_TAIL = 0x8;
        const IS_SHARE = 0x10;
        const IS_READ_SIDE = 0x20;
        const UNSHARE = 0x40;
        const READ_SIDE_FINI = 0x80;
        const READ_SIDE_ERR = 0x100;
        const NO_DURATION = 0x200;
        const MORE_ASYNC = 0x400;
        const EXCL_WAITQ = 0x800;
        const SNAP_DEV = 0x1000;
    }
}

/// struct sg_extended_info, 96 bytes
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SgExtendedInfo {
    pub sei_wr_mask: u32,
    pub sei_rd_mask: u32,
    pub ctl_flags_wr_mask: u32,
    pub ctl_flags_rd_mask: u32,
    pub ctl_flags: u32,
    pub read_value: u32,
    pub reserved_sz: u32,
    pub tot_fd_thresh: u32,
    pub minor_index: u32,
    pub share_fd: u32,
    pub sgat_elem_sz: u32,
    pub num_reqs: i32,
    pub(crate) pad_to_96: [u32; 12],
}

/// Implements the sg ioctls used by the copy engine.
///
/// The generated functions are unsafe raw wrappers, users should go
/// through `crate::device::SgDevice`.
pub(crate) mod sg_ioctl {
    use nix::{ioctl_read, ioctl_read_bad, ioctl_readwrite, ioctl_readwrite_bad};
    use nix::{ioctl_write_ptr, ioctl_write_ptr_bad};

    use super::{SgExtendedInfo, SgIoHdr, SgIoV4};

    const SG_IOCTL_MAGIC: u8 = 0x22;

    const SG_IO: u32 = 0x2285;
    const SG_SET_RESERVED_SIZE: u32 = 0x2275;
    const SG_GET_RESERVED_SIZE: u32 = 0x2272;
    const SG_SET_FORCE_PACK_ID: u32 = 0x227b;
    const SG_GET_NUM_WAITING: u32 = 0x227d;
    const SG_GET_VERSION_NUM: u32 = 0x2282;

    // _IO(0x12, 104)
    const BLKSSZGET: u32 = 0x1268;

    ioctl_readwrite_bad!(sg_io_v3, SG_IO, SgIoHdr);
    ioctl_readwrite_bad!(sg_io_v4, SG_IO, SgIoV4);
    ioctl_readwrite!(sg_iosubmit, SG_IOCTL_MAGIC, 0x41, SgIoV4);
    ioctl_readwrite!(sg_ioreceive, SG_IOCTL_MAGIC, 0x42, SgIoV4);
    ioctl_write_ptr!(sg_ioabort, SG_IOCTL_MAGIC, 0x43, SgIoV4);
    ioctl_readwrite!(sg_set_get_extended, SG_IOCTL_MAGIC, 0x51, SgExtendedInfo);

    ioctl_write_ptr_bad!(sg_set_reserved_size, SG_SET_RESERVED_SIZE, libc::c_int);
    ioctl_read_bad!(sg_get_reserved_size, SG_GET_RESERVED_SIZE, libc::c_int);
    ioctl_write_ptr_bad!(sg_set_force_pack_id, SG_SET_FORCE_PACK_ID, libc::c_int);
    ioctl_read_bad!(sg_get_num_waiting, SG_GET_NUM_WAITING, libc::c_int);
    ioctl_read_bad!(sg_get_version_num, SG_GET_VERSION_NUM, libc::c_int);

    //#define BLKGETSIZE64 _IOR(0x12,114,size_t)
    ioctl_read!(blkgetsize64, 0x12, 114, u64);
    ioctl_read_bad!(blksszget, BLKSSZGET, libc::c_int);
}
