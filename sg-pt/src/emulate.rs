//! Emulated pass-through disk
//!
//! An in memory logical unit which understands the commands the copy
//! engine issues and mimics the sg v4 driver semantics it depends on:
//! submit/receive with forced pack ids, shared reservations, data-out
//! offsets, multiple requests (ordered, STOP_IF, DO_ON_OTHER) and abort.
//!
//! Every handle gets a made up file descriptor number so share requests
//! (which name the other side by fd) can be resolved.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Error;
use nix::errno::Errno;

use crate::cdb::{self, decode_rw_cdb};
use crate::device::{PassThrough, PassThroughOpener};
use crate::sense::{
    build_fixed_sense, SENSE_KEY_ILLEGAL_REQUEST, SENSE_KEY_MEDIUM_ERROR, SENSE_KEY_MISCOMPARE,
    SENSE_KEY_UNIT_ATTENTION,
};
use crate::sg_io::{
    CtlFlags, SeiMask, SgExtendedInfo, SgFlags, SgIoHdr, SgIoV4, DID_ABORT, DRIVER_SENSE,
    SG_DXFER_FROM_DEV, SG_DXFER_TO_DEV, SG_GUARD_V4, SG_INFO_CHECK, SG_INFO_DIRECT_IO,
    SG_MAX_CDB_SIZE,
};

const SAM_STAT_CHECK_CONDITION: u32 = 0x02;
const DEFAULT_VERSION: i32 = 40045;
const MIN_ELEM_SIZE: u32 = 4096;

lazy_static::lazy_static! {
    static ref HANDLES: Mutex<HashMap<RawFd, Weak<EmulatedHandle>>> = Mutex::new(HashMap::new());
}

// well above anything a test process opens for real
static NEXT_FD: AtomicI32 = AtomicI32::new(10_000);
static NEXT_BATCH: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lookup_handle(fd: RawFd) -> Option<Arc<EmulatedHandle>> {
    let weak = lock(&HANDLES).get(&fd).cloned();
    weak.and_then(|weak| weak.upgrade())
}

/// One traced command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// fd of the handle which executed the command
    pub fd: RawFd,
    pub opcode: u8,
    pub lba: u64,
    pub blocks: u32,
    pub flags: SgFlags,
    pub pack_id: i32,
    pub spare_in: u32,
    /// set for commands which were part of a multiple requests batch
    pub batch: Option<u64>,
}

#[derive(Debug, Default)]
struct Faults {
    medium_error_lba: Option<u64>,
    unit_attentions: u32,
    delay: Option<Duration>,
    hold: bool,
    version: Option<i32>,
}

struct DiskInner {
    block_len: u32,
    num_blocks: u64,
    data: Mutex<Vec<u8>>,
    trace: Mutex<Vec<TraceEntry>>,
    faults: Mutex<Faults>,
    batches: AtomicU64,
}

/// An in memory disk with a fixed block length
#[derive(Clone)]
pub struct EmulatedDisk {
    inner: Arc<DiskInner>,
}

impl EmulatedDisk {
    /// Create a zero filled disk
    pub fn new(block_len: u32, num_blocks: u64) -> Self {
        let size = block_len as usize * num_blocks as usize;
        Self::with_data(block_len, vec![0u8; size])
    }

    /// Create a disk holding `data`, a trailing partial block is dropped
    pub fn with_data(block_len: u32, mut data: Vec<u8>) -> Self {
        let num_blocks = (data.len() / block_len as usize) as u64;
        data.truncate(num_blocks as usize * block_len as usize);
        Self {
            inner: Arc::new(DiskInner {
                block_len,
                num_blocks,
                data: Mutex::new(data),
                trace: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn block_len(&self) -> u32 {
        self.inner.block_len
    }

    pub fn num_blocks(&self) -> u64 {
        self.inner.num_blocks
    }

    /// Copy of the current disk contents
    pub fn data(&self) -> Vec<u8> {
        lock(&self.inner.data).clone()
    }

    /// Commands executed so far, in execution order
    pub fn trace(&self) -> Vec<TraceEntry> {
        lock(&self.inner.trace).clone()
    }

    pub fn clear_trace(&self) {
        lock(&self.inner.trace).clear();
    }

    /// Number of multiple requests batches executed on this disk
    pub fn batch_count(&self) -> u64 {
        self.inner.batches.load(Ordering::SeqCst)
    }

    /// READs touching `lba` fail with MEDIUM ERROR
    pub fn inject_medium_error(&self, lba: u64) {
        lock(&self.inner.faults).medium_error_lba = Some(lba);
    }

    /// The next `count` commands fail with UNIT ATTENTION
    pub fn inject_unit_attentions(&self, count: u32) {
        lock(&self.inner.faults).unit_attentions = count;
    }

    /// Sleep before executing each command
    pub fn set_command_delay(&self, delay: Option<Duration>) {
        lock(&self.inner.faults).delay = delay;
    }

    /// Keep single submitted commands in flight until they are received
    pub fn set_hold_commands(&self, hold: bool) {
        lock(&self.inner.faults).hold = hold;
    }

    /// Driver version reported by SG_GET_VERSION_NUM
    pub fn set_version(&self, version: i32) {
        lock(&self.inner.faults).version = Some(version);
    }

    pub fn open_handle(&self) -> Arc<EmulatedHandle> {
        let fd = NEXT_FD.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(EmulatedHandle {
            fd,
            disk: Arc::clone(&self.inner),
            state: Mutex::new(HandleState::default()),
        });
        lock(&HANDLES).insert(fd, Arc::downgrade(&handle));
        handle
    }

    /// Opener handing out handles onto this disk
    pub fn opener(&self, name: &str) -> EmulatedOpener {
        EmulatedOpener {
            disk: self.clone(),
            name: name.to_string(),
        }
    }
}

pub struct EmulatedOpener {
    disk: EmulatedDisk,
    name: String,
}

impl PassThroughOpener for EmulatedOpener {
    fn open(&self) -> Result<Arc<dyn PassThrough>, Error> {
        Ok(self.disk.open_handle())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, PartialEq, Eq)]
enum QueueState {
    Pending,
    Aborted,
    Done,
}

struct Queued {
    hdr: SgIoV4,
    cdb: Vec<u8>,
    state: QueueState,
}

struct HandleState {
    reservation: Vec<u8>,
    reserved_size: i32,
    force_pack_id: bool,
    partner: Option<RawFd>,
    is_read_side: bool,
    ctl_flags: CtlFlags,
    elem_size: u32,
    fd_threshold: u32,
    queue: VecDeque<Queued>,
}

impl Default for HandleState {
    fn default() -> Self {
        Self {
            reservation: Vec::new(),
            reserved_size: 32 * 1024,
            force_pack_id: false,
            partner: None,
            is_read_side: false,
            ctl_flags: CtlFlags::empty(),
            elem_size: 0,
            fd_threshold: 0,
            queue: VecDeque::new(),
        }
    }
}

/// One open "file descriptor" of an [EmulatedDisk]
pub struct EmulatedHandle {
    fd: RawFd,
    disk: Arc<DiskInner>,
    state: Mutex<HandleState>,
}

impl Drop for EmulatedHandle {
    fn drop(&mut self) {
        lock(&HANDLES).remove(&self.fd);
    }
}

struct Request<'a> {
    cdb: &'a [u8],
    flags: SgFlags,
    din: *mut u8,
    din_len: usize,
    dout: *const u8,
    dout_len: usize,
    dout_offset: usize,
    pack_id: i32,
    spare_in: u32,
    batch: Option<u64>,
}

#[derive(Debug, Default)]
struct Outcome {
    device_status: u32,
    transport_status: u32,
    driver_status: u32,
    sense: Option<[u8; 18]>,
    din_resid: i32,
    info: u32,
}

impl Outcome {
    fn sense(key: u8, asc: u8, ascq: u8) -> Self {
        Self {
            device_status: SAM_STAT_CHECK_CONDITION,
            driver_status: DRIVER_SENSE,
            sense: Some(build_fixed_sense(key, asc, ascq)),
            info: SG_INFO_CHECK,
            ..Default::default()
        }
    }

    fn aborted() -> Self {
        Self {
            transport_status: DID_ABORT,
            info: SG_INFO_CHECK,
            ..Default::default()
        }
    }

    fn is_good(&self) -> bool {
        self.device_status == 0 && self.transport_status == 0 && self.driver_status == 0
    }

    fn apply_v4(&self, hdr: &mut SgIoV4) {
        hdr.reset_output();
        hdr.device_status = self.device_status;
        hdr.transport_status = self.transport_status;
        hdr.driver_status = self.driver_status;
        hdr.din_resid = self.din_resid;
        hdr.info = self.info;
        if let Some(sense) = &self.sense {
            if hdr.response != 0 && hdr.max_response_len > 0 {
                let len = sense.len().min(hdr.max_response_len as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(sense.as_ptr(), hdr.response as *mut u8, len)
                };
                hdr.response_len = len as u32;
            }
        }
    }

    fn apply_v3(&self, hdr: &mut SgIoHdr) {
        hdr.status = self.device_status as u8;
        hdr.masked_status = (self.device_status >> 1) as u8;
        hdr.host_status = self.transport_status as u16;
        hdr.driver_status = self.driver_status as u16;
        hdr.resid = self.din_resid;
        hdr.info = self.info;
        hdr.sb_len_wr = 0;
        if let Some(sense) = &self.sense {
            if !hdr.sbp.is_null() && hdr.mx_sb_len > 0 {
                let len = sense.len().min(hdr.mx_sb_len as usize);
                unsafe { std::ptr::copy_nonoverlapping(sense.as_ptr(), hdr.sbp, len) };
                hdr.sb_len_wr = len as u8;
            }
        }
    }
}

fn cdb_from_v4(hdr: &SgIoV4) -> nix::Result<Vec<u8>> {
    let len = hdr.request_len as usize;
    if hdr.request == 0 || len == 0 || len > SG_MAX_CDB_SIZE {
        return Err(Errno::EINVAL);
    }
    let cdb = unsafe { std::slice::from_raw_parts(hdr.request as *const u8, len) };
    Ok(cdb.to_vec())
}

fn request_from_v4<'a>(hdr: &SgIoV4, cdb: &'a [u8], batch: Option<u64>) -> Request<'a> {
    let flags = hdr.sg_flags();
    Request {
        cdb,
        flags,
        din: hdr.din_xferp as *mut u8,
        din_len: hdr.din_xfer_len as usize,
        dout: hdr.dout_xferp as *const u8,
        dout_len: hdr.dout_xfer_len as usize,
        dout_offset: if flags.contains(SgFlags::DOUT_OFFSET) {
            hdr.spare_in as usize
        } else {
            0
        },
        pack_id: hdr.pack_id(),
        spare_in: hdr.spare_in,
        batch,
    }
}

fn is_clean(hdr: &SgIoV4) -> bool {
    hdr.device_status == 0 && hdr.transport_status == 0 && hdr.driver_status == 0
}

impl EmulatedHandle {
    fn partner(&self) -> Option<Arc<EmulatedHandle>> {
        let fd = lock(&self.state).partner?;
        lookup_handle(fd)
    }

    fn faults_before_command(&self) -> Option<Outcome> {
        let delay = {
            let mut faults = lock(&self.disk.faults);
            if faults.unit_attentions > 0 {
                faults.unit_attentions -= 1;
                return Some(Outcome::sense(SENSE_KEY_UNIT_ATTENTION, 0x29, 0x00));
            }
            faults.delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        None
    }

    fn trace(&self, req: &Request) {
        let (lba, blocks) = match decode_rw_cdb(req.cdb) {
            Some(addr) => (addr.lba, addr.blocks),
            None => (0, 0),
        };
        lock(&self.disk.trace).push(TraceEntry {
            fd: self.fd,
            opcode: req.cdb[0],
            lba,
            blocks,
            flags: req.flags,
            pack_id: req.pack_id,
            spare_in: req.spare_in,
            batch: req.batch,
        });
    }

    fn check_range(&self, lba: u64, blocks: u32) -> Option<Outcome> {
        if lba + blocks as u64 > self.disk.num_blocks {
            Some(Outcome::sense(SENSE_KEY_ILLEGAL_REQUEST, 0x21, 0x00))
        } else {
            None
        }
    }

    fn execute(&self, req: &Request) -> Outcome {
        self.trace(req);

        if let Some(outcome) = self.faults_before_command() {
            return outcome;
        }

        let mut outcome = match req.cdb[0] {
            cdb::READ_6 | cdb::READ_10 | cdb::READ_12 | cdb::READ_16 => self.do_read(req),
            cdb::WRITE_6 | cdb::WRITE_10 | cdb::WRITE_12 | cdb::WRITE_16 | cdb::VERIFY_10 => {
                self.do_write(req)
            }
            cdb::PRE_FETCH_10 | cdb::PRE_FETCH_16 => match decode_rw_cdb(req.cdb) {
                Some(addr) => self.check_range(addr.lba, addr.blocks).unwrap_or_default(),
                None => Outcome::sense(SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00),
            },
            cdb::SYNCHRONIZE_CACHE_10 => Outcome::default(),
            cdb::READ_CAPACITY_10 => {
                let last = (self.disk.num_blocks.saturating_sub(1)).min(u32::MAX as u64) as u32;
                let mut data = Vec::with_capacity(8);
                data.extend(last.to_be_bytes());
                data.extend(self.disk.block_len.to_be_bytes());
                self.data_in(req, &data)
            }
            cdb::SERVICE_ACTION_IN_16 if req.cdb.get(1) == Some(&cdb::SAI_READ_CAPACITY_16) => {
                let mut data = vec![0u8; 32];
                data[..8].copy_from_slice(&self.disk.num_blocks.saturating_sub(1).to_be_bytes());
                data[8..12].copy_from_slice(&self.disk.block_len.to_be_bytes());
                self.data_in(req, &data)
            }
            _ => Outcome::sense(SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00),
        };

        if outcome.is_good() && req.flags.contains(SgFlags::DIRECT_IO) {
            outcome.info |= SG_INFO_DIRECT_IO;
        }
        outcome
    }

    fn data_in(&self, req: &Request, data: &[u8]) -> Outcome {
        let mut outcome = Outcome::default();
        if !req.din.is_null() {
            let len = data.len().min(req.din_len);
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), req.din, len) };
            outcome.din_resid = (req.din_len - len) as i32;
        }
        outcome
    }

    fn do_read(&self, req: &Request) -> Outcome {
        let addr = match decode_rw_cdb(req.cdb) {
            Some(addr) => addr,
            None => return Outcome::sense(SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00),
        };
        if let Some(outcome) = self.check_range(addr.lba, addr.blocks) {
            return outcome;
        }
        if let Some(bad) = lock(&self.disk.faults).medium_error_lba {
            if bad >= addr.lba && bad < addr.lba + addr.blocks as u64 {
                return Outcome::sense(SENSE_KEY_MEDIUM_ERROR, 0x11, 0x00);
            }
        }

        let block_len = self.disk.block_len as usize;
        let start = addr.lba as usize * block_len;
        let len = addr.blocks as usize * block_len;
        let data = lock(&self.disk.data)[start..start + len].to_vec();

        let to_reservation = req.flags.intersects(SgFlags::SHARE | SgFlags::NO_DXFER)
            || req.flags.contains(SgFlags::MMAP_IO);
        if to_reservation {
            let mut state = lock(&self.state);
            if state.reservation.len() < len {
                state.reservation.resize(len, 0);
            }
            state.reservation[..len].copy_from_slice(&data);
        }
        if req.flags.intersects(SgFlags::NO_DXFER | SgFlags::MMAP_IO) {
            return Outcome::default();
        }
        self.data_in(req, &data)
    }

    fn data_out(&self, req: &Request, len: usize) -> Result<Vec<u8>, Outcome> {
        let off = req.dout_offset;
        let bad_length = || Outcome::sense(SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00);

        if req.flags.contains(SgFlags::SHARE) {
            // data comes from the reservation of the read side
            let partner = match self.partner() {
                Some(partner) => partner,
                None => return Err(bad_length()),
            };
            let state = lock(&partner.state);
            return state
                .reservation
                .get(off..off + len)
                .map(|data| data.to_vec())
                .ok_or_else(bad_length);
        }
        if !req.dout.is_null() {
            // the offset is relative to the buffer base, dout_len is the part length
            if len > req.dout_len {
                return Err(bad_length());
            }
            let data = unsafe { std::slice::from_raw_parts(req.dout.add(off), len) };
            return Ok(data.to_vec());
        }
        let state = lock(&self.state);
        state
            .reservation
            .get(off..off + len)
            .map(|data| data.to_vec())
            .ok_or_else(bad_length)
    }

    fn do_write(&self, req: &Request) -> Outcome {
        let addr = match decode_rw_cdb(req.cdb) {
            Some(addr) => addr,
            None => return Outcome::sense(SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00),
        };
        if let Some(outcome) = self.check_range(addr.lba, addr.blocks) {
            return outcome;
        }

        let block_len = self.disk.block_len as usize;
        let start = addr.lba as usize * block_len;
        let len = addr.blocks as usize * block_len;
        let source = match self.data_out(req, len) {
            Ok(source) => source,
            Err(outcome) => return outcome,
        };

        let mut data = lock(&self.disk.data);
        if addr.opcode == cdb::VERIFY_10 {
            if data[start..start + len] != source[..] {
                return Outcome::sense(SENSE_KEY_MISCOMPARE, 0x1d, 0x00);
            }
        } else {
            data[start..start + len].copy_from_slice(&source);
        }
        Outcome::default()
    }

    fn run_v4(&self, hdr: &mut SgIoV4, cdb: &[u8], batch: Option<u64>) {
        let outcome = self.execute(&request_from_v4(hdr, cdb, batch));
        outcome.apply_v4(hdr);
    }

    /// Execute all requests of a multiple requests control object
    ///
    /// Returns the number of completed requests.
    fn run_mrq(&self, ctl: &mut SgIoV4, stop_on_error: bool) -> nix::Result<usize> {
        let size = SgIoV4::SIZE as u32;
        if ctl.dout_xferp == 0 || ctl.dout_xfer_len == 0 || ctl.dout_xfer_len % size != 0 {
            return Err(Errno::EINVAL);
        }
        let count = (ctl.dout_xfer_len / size) as usize;
        if ctl.din_xferp != 0 && (ctl.din_xfer_len / size) < count as u32 {
            return Err(Errno::EINVAL);
        }

        let packed: Option<&[u8]> = if ctl.request != 0 && ctl.request_len > 0 {
            if (ctl.request_len as usize) < count * SG_MAX_CDB_SIZE {
                return Err(Errno::EINVAL);
            }
            Some(unsafe {
                std::slice::from_raw_parts(ctl.request as *const u8, ctl.request_len as usize)
            })
        } else {
            None
        };

        let batch = NEXT_BATCH.fetch_add(1, Ordering::SeqCst);
        self.disk.batches.fetch_add(1, Ordering::SeqCst);

        let requests = ctl.dout_xferp as *const SgIoV4;
        let responses = ctl.din_xferp as *mut SgIoV4;
        let mut completed = 0;

        for i in 0..count {
            let mut sub = unsafe { std::ptr::read(requests.add(i)) };
            let cdb = match packed {
                Some(area) => {
                    let len = sub.request_len as usize;
                    if len == 0 || len > SG_MAX_CDB_SIZE {
                        return Err(Errno::EINVAL);
                    }
                    area[i * SG_MAX_CDB_SIZE..i * SG_MAX_CDB_SIZE + len].to_vec()
                }
                None => cdb_from_v4(&sub)?,
            };

            let flags = sub.sg_flags();
            if flags.contains(SgFlags::DO_ON_OTHER) {
                match self.partner() {
                    Some(other) => other.run_v4(&mut sub, &cdb, Some(batch)),
                    None => return Err(Errno::EINVAL),
                }
            } else {
                self.run_v4(&mut sub, &cdb, Some(batch));
            }

            let good = is_clean(&sub);
            if !responses.is_null() {
                unsafe { std::ptr::write(responses.add(i), sub) };
            }
            completed += 1;

            if stop_on_error && !good {
                break;
            }
        }

        ctl.reset_output();
        ctl.info = completed as u32;
        ctl.din_resid = (count - completed) as i32;
        Ok(completed)
    }

    fn check_guard(hdr: &SgIoV4) -> nix::Result<()> {
        if hdr.guard != SG_GUARD_V4 {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn take_queued(&self, hdr: &SgIoV4) -> Option<Queued> {
        let mut state = lock(&self.state);
        let pos = if state.force_pack_id && hdr.pack_id() != -1 {
            state
                .queue
                .iter()
                .position(|item| item.hdr.pack_id() == hdr.pack_id())
        } else if state.queue.is_empty() {
            None
        } else {
            Some(0)
        };
        pos.and_then(|pos| state.queue.remove(pos))
    }

    fn receive_mrq(&self, ctl: &mut SgIoV4) -> nix::Result<()> {
        let size = SgIoV4::SIZE as u32;
        if ctl.din_xferp == 0 || ctl.din_xfer_len < size {
            return Err(Errno::EINVAL);
        }
        let room = (ctl.din_xfer_len / size) as usize;
        let responses = ctl.din_xferp as *mut SgIoV4;

        let done: Vec<SgIoV4> = {
            let mut state = lock(&self.state);
            let mut done = Vec::new();
            while done.len() < room {
                match state.queue.iter().position(|item| item.state == QueueState::Done) {
                    Some(pos) => {
                        if let Some(item) = state.queue.remove(pos) {
                            done.push(item.hdr);
                        }
                    }
                    None => break,
                }
            }
            done
        };

        if done.is_empty() && !ctl.sg_flags().contains(SgFlags::IMMED) {
            return Err(Errno::EAGAIN);
        }
        for (i, hdr) in done.iter().enumerate() {
            unsafe { std::ptr::write(responses.add(i), *hdr) };
        }
        ctl.reset_output();
        ctl.info = done.len() as u32;
        Ok(())
    }
}

impl PassThrough for EmulatedHandle {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn sg_io_v3(&self, hdr: &mut SgIoHdr) -> nix::Result<()> {
        if hdr.cmdp.is_null() || hdr.cmd_len == 0 || hdr.cmd_len as usize > SG_MAX_CDB_SIZE {
            return Err(Errno::EINVAL);
        }
        let cdb = unsafe { std::slice::from_raw_parts(hdr.cmdp, hdr.cmd_len as usize) }.to_vec();
        let mut flags = SgFlags::from_bits_truncate(hdr.flags);
        // v3 has no SHARE semantics beyond the flag bits we understand
        flags.remove(SgFlags::SHARE | SgFlags::DOUT_OFFSET);

        let (din, din_len, dout, dout_len) = match hdr.dxfer_direction {
            SG_DXFER_FROM_DEV => (hdr.dxferp as *mut u8, hdr.dxfer_len as usize, std::ptr::null(), 0),
            SG_DXFER_TO_DEV => (
                std::ptr::null_mut(),
                0,
                hdr.dxferp as *const u8,
                hdr.dxfer_len as usize,
            ),
            _ => (std::ptr::null_mut(), 0, std::ptr::null(), 0),
        };
        let req = Request {
            cdb: &cdb,
            flags,
            din,
            din_len,
            dout,
            dout_len,
            dout_offset: 0,
            pack_id: hdr.pack_id,
            spare_in: 0,
            batch: None,
        };
        let outcome = self.execute(&req);
        outcome.apply_v3(hdr);
        Ok(())
    }

    fn sg_io_v4(&self, hdr: &mut SgIoV4) -> nix::Result<()> {
        Self::check_guard(hdr)?;
        let flags = hdr.sg_flags();
        if flags.contains(SgFlags::MULTIPLE_REQS) {
            self.run_mrq(hdr, flags.contains(SgFlags::STOP_IF))?;
            return Ok(());
        }
        let cdb = cdb_from_v4(hdr)?;
        self.run_v4(hdr, &cdb, None);
        Ok(())
    }

    fn submit(&self, hdr: &mut SgIoV4) -> nix::Result<()> {
        Self::check_guard(hdr)?;
        let flags = hdr.sg_flags();

        if flags.contains(SgFlags::MULTIPLE_REQS) {
            // execute now and queue every response for SG_IORECEIVE
            let size = SgIoV4::SIZE;
            let count = hdr.dout_xfer_len as usize / size;
            let mut responses = vec![SgIoV4::new(); count];
            let mut ctl = *hdr;
            ctl.din_xferp = responses.as_mut_ptr() as u64;
            ctl.din_xfer_len = (count * size) as u32;
            let completed = self.run_mrq(&mut ctl, false)?;

            let mut state = lock(&self.state);
            for sub in responses.into_iter().take(completed) {
                state.queue.push_back(Queued {
                    hdr: sub,
                    cdb: Vec::new(),
                    state: QueueState::Done,
                });
            }
            hdr.info = completed as u32;
            return Ok(());
        }

        let cdb = cdb_from_v4(hdr)?;
        let hold = lock(&self.disk.faults).hold;

        let mut queued = Queued {
            hdr: *hdr,
            cdb,
            state: QueueState::Pending,
        };
        if !hold {
            let cdb = std::mem::take(&mut queued.cdb);
            self.run_v4(&mut queued.hdr, &cdb, None);
            queued.state = QueueState::Done;
        }
        lock(&self.state).queue.push_back(queued);
        Ok(())
    }

    fn receive(&self, hdr: &mut SgIoV4) -> nix::Result<()> {
        Self::check_guard(hdr)?;
        if hdr.sg_flags().contains(SgFlags::MULTIPLE_REQS) {
            return self.receive_mrq(hdr);
        }

        let mut item = match self.take_queued(hdr) {
            Some(item) => item,
            None => return Err(Errno::EAGAIN),
        };
        match item.state {
            QueueState::Done => {}
            QueueState::Aborted => Outcome::aborted().apply_v4(&mut item.hdr),
            QueueState::Pending => {
                let cdb = std::mem::take(&mut item.cdb);
                self.run_v4(&mut item.hdr, &cdb, None);
            }
        }
        *hdr = item.hdr;
        Ok(())
    }

    fn abort(&self, hdr: &SgIoV4) -> nix::Result<()> {
        Self::check_guard(hdr)?;
        let mut state = lock(&self.state);
        let pending = state.queue.iter_mut().find(|item| {
            item.state == QueueState::Pending && item.hdr.pack_id() == hdr.pack_id()
        });
        match pending {
            Some(item) => {
                item.state = QueueState::Aborted;
                Ok(())
            }
            // already completed (or never seen)
            None => Err(Errno::ENODATA),
        }
    }

    fn num_waiting(&self) -> nix::Result<i32> {
        let state = lock(&self.state);
        let waiting = state
            .queue
            .iter()
            .filter(|item| item.state == QueueState::Done)
            .count();
        Ok(waiting as i32)
    }

    fn set_get_extended(&self, sei: &mut SgExtendedInfo) -> nix::Result<()> {
        let wr = SeiMask::from_bits_truncate(sei.sei_wr_mask);
        let rd = SeiMask::from_bits_truncate(sei.sei_rd_mask);

        if wr.contains(SeiMask::SHARE_FD) || wr.contains(SeiMask::CHG_SHARE_FD) {
            let other_fd = sei.share_fd as RawFd;
            if other_fd == self.fd {
                return Err(Errno::EINVAL);
            }
            let other = lookup_handle(other_fd).ok_or(Errno::EBADF)?;
            {
                let mut state = lock(&self.state);
                if state.partner.is_some() && wr.contains(SeiMask::SHARE_FD) {
                    return Err(Errno::EADDRINUSE);
                }
                state.partner = Some(other_fd);
                state.is_read_side = false;
            }
            let mut other_state = lock(&other.state);
            other_state.partner = Some(self.fd);
            other_state.is_read_side = true;
        }

        if wr.contains(SeiMask::CTL_FLAGS) {
            let mask = CtlFlags::from_bits_truncate(sei.ctl_flags_wr_mask);
            let value = CtlFlags::from_bits_truncate(sei.ctl_flags);
            if mask.contains(CtlFlags::UNSHARE) && value.contains(CtlFlags::UNSHARE) {
                let partner = lock(&self.state).partner.take();
                if let Some(other) = partner.and_then(lookup_handle) {
                    lock(&other.state).partner = None;
                }
            }
            let settable = mask - (CtlFlags::UNSHARE | CtlFlags::IS_SHARE | CtlFlags::IS_READ_SIDE);
            let mut state = lock(&self.state);
            state.ctl_flags = (state.ctl_flags - settable) | (value & settable);
        }

        let mut state = lock(&self.state);

        if wr.contains(SeiMask::RESERVED_SIZE) {
            state.reserved_size = sei.reserved_sz as i32;
        }
        if wr.contains(SeiMask::TOT_FD_THRESH) {
            state.fd_threshold = sei.tot_fd_thresh;
        }
        if wr.contains(SeiMask::SGAT_ELEM_SZ) {
            let size = sei.sgat_elem_sz;
            if size < MIN_ELEM_SIZE || !size.is_power_of_two() {
                return Err(Errno::EINVAL);
            }
            state.elem_size = size;
        }

        if rd.contains(SeiMask::CTL_FLAGS) {
            let mut flags = state.ctl_flags;
            if state.partner.is_some() {
                flags |= CtlFlags::IS_SHARE;
                if state.is_read_side {
                    flags |= CtlFlags::IS_READ_SIDE;
                }
            }
            sei.ctl_flags = (flags & CtlFlags::from_bits_truncate(sei.ctl_flags_rd_mask)).bits();
        }
        if rd.contains(SeiMask::RESERVED_SIZE) {
            sei.reserved_sz = state.reserved_size as u32;
        }
        if rd.contains(SeiMask::TOT_FD_THRESH) {
            sei.tot_fd_thresh = state.fd_threshold;
        }
        if rd.contains(SeiMask::SGAT_ELEM_SZ) {
            sei.sgat_elem_sz = state.elem_size;
        }
        if rd.contains(SeiMask::SHARE_FD) {
            sei.share_fd = state.partner.map(|fd| fd as u32).unwrap_or(u32::MAX);
        }
        if rd.contains(SeiMask::MINOR_INDEX) {
            sei.minor_index = 0;
        }
        Ok(())
    }

    fn set_reserved_size(&self, size: i32) -> nix::Result<()> {
        if size < 0 {
            return Err(Errno::EINVAL);
        }
        lock(&self.state).reserved_size = size;
        Ok(())
    }

    fn reserved_size(&self) -> nix::Result<i32> {
        Ok(lock(&self.state).reserved_size)
    }

    fn set_force_pack_id(&self, on: bool) -> nix::Result<()> {
        lock(&self.state).force_pack_id = on;
        Ok(())
    }

    fn version_num(&self) -> nix::Result<i32> {
        Ok(lock(&self.disk.faults).version.unwrap_or(DEFAULT_VERSION))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::cdb::{build_rw_cdb, RwOp};
    use crate::device::{share, unshare};
    use crate::sense::{classify, SenseCategory};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn v4(cdb: &[u8], pack_id: i32) -> SgIoV4 {
        let mut hdr = SgIoV4::new();
        hdr.request = cdb.as_ptr() as u64;
        hdr.request_len = cdb.len() as u32;
        hdr.set_pack_id(pack_id);
        hdr
    }

    fn category(hdr: &SgIoV4, sense: &[u8]) -> SenseCategory {
        classify(
            hdr.device_status,
            hdr.transport_status,
            hdr.driver_status,
            &sense[..hdr.response_len as usize],
        )
    }

    #[test]
    fn read_write_roundtrip() -> Result<(), Error> {
        let src = EmulatedDisk::with_data(512, pattern(512 * 16));
        let dst = EmulatedDisk::new(512, 16);
        let in_pt = src.open_handle();
        let out_pt = dst.open_handle();

        let mut buffer = vec![0u8; 512 * 4];
        let cdb = build_rw_cdb(10, RwOp::Read, 4, 4, false, false)?;
        let mut hdr = v4(&cdb, 7);
        hdr.din_xferp = buffer.as_mut_ptr() as u64;
        hdr.din_xfer_len = buffer.len() as u32;
        in_pt.sg_io_v4(&mut hdr)?;
        assert!(is_clean(&hdr));
        assert_eq!(&buffer[..], &src.data()[512 * 4..512 * 8]);

        let cdb = build_rw_cdb(16, RwOp::Write, 0, 4, true, false)?;
        let mut hdr = v4(&cdb, 8);
        hdr.dout_xferp = buffer.as_ptr() as u64;
        hdr.dout_xfer_len = buffer.len() as u32;
        out_pt.submit(&mut hdr)?;
        assert_eq!(out_pt.num_waiting()?, 1);
        let mut rcv = SgIoV4::new();
        rcv.set_pack_id(8);
        out_pt.set_force_pack_id(true)?;
        out_pt.receive(&mut rcv)?;
        assert!(is_clean(&rcv));
        assert_eq!(&dst.data()[..512 * 4], &buffer[..]);
        Ok(())
    }

    #[test]
    fn shared_reservation_with_offset() -> Result<(), Error> {
        let src = EmulatedDisk::with_data(512, pattern(512 * 8));
        let dst = EmulatedDisk::new(512, 8);
        let in_pt = src.open_handle();
        let out_pt = dst.open_handle();
        share(&*out_pt, &*in_pt)?;

        let cdb = build_rw_cdb(10, RwOp::Read, 0, 8, false, false)?;
        let mut hdr = v4(&cdb, 1);
        hdr.set_sg_flags(SgFlags::SHARE | SgFlags::NO_DXFER);
        in_pt.sg_io_v4(&mut hdr)?;

        // first half keeps the share, second half starts at an offset
        let cdb = build_rw_cdb(10, RwOp::Write, 0, 2, false, false)?;
        let mut hdr = v4(&cdb, 2);
        hdr.set_sg_flags(SgFlags::SHARE | SgFlags::NO_DXFER | SgFlags::KEEP_SHARE);
        out_pt.sg_io_v4(&mut hdr)?;
        assert!(is_clean(&hdr));

        let cdb = build_rw_cdb(10, RwOp::Write, 2, 6, false, false)?;
        let mut hdr = v4(&cdb, 3);
        hdr.set_sg_flags(SgFlags::SHARE | SgFlags::NO_DXFER | SgFlags::DOUT_OFFSET);
        hdr.spare_in = 512 * 2;
        out_pt.sg_io_v4(&mut hdr)?;
        assert!(is_clean(&hdr));

        assert_eq!(dst.data(), src.data());

        let trace = dst.trace();
        assert_eq!(trace.len(), 2);
        assert!(trace[0].flags.contains(SgFlags::KEEP_SHARE));
        assert_eq!(trace[1].spare_in, 1024);

        unshare(&*in_pt)?;
        let mut hdr = v4(&cdb, 4);
        hdr.set_sg_flags(SgFlags::SHARE | SgFlags::NO_DXFER);
        out_pt.sg_io_v4(&mut hdr)?;
        assert!(!is_clean(&hdr));
        Ok(())
    }

    #[test]
    fn verify_and_medium_error() -> Result<(), Error> {
        let disk = EmulatedDisk::with_data(512, pattern(512 * 4));
        disk.inject_medium_error(3);
        let pt = disk.open_handle();
        let mut sense = [0u8; 32];

        let mut data = disk.data();
        let cdb = build_rw_cdb(10, RwOp::Verify, 0, 4, false, false)?;
        let mut hdr = v4(&cdb, 1);
        hdr.dout_xferp = data.as_ptr() as u64;
        hdr.dout_xfer_len = data.len() as u32;
        hdr.response = sense.as_mut_ptr() as u64;
        hdr.max_response_len = sense.len() as u32;
        pt.sg_io_v4(&mut hdr)?;
        assert_eq!(category(&hdr, &sense), SenseCategory::Clean);

        data[700] ^= 0xff;
        let mut hdr = v4(&cdb, 2);
        hdr.dout_xferp = data.as_ptr() as u64;
        hdr.dout_xfer_len = data.len() as u32;
        hdr.response = sense.as_mut_ptr() as u64;
        hdr.max_response_len = sense.len() as u32;
        pt.sg_io_v4(&mut hdr)?;
        assert_eq!(category(&hdr, &sense), SenseCategory::Miscompare);

        let mut buffer = vec![0u8; 512 * 4];
        let cdb = build_rw_cdb(10, RwOp::Read, 0, 4, false, false)?;
        let mut hdr = v4(&cdb, 3);
        hdr.din_xferp = buffer.as_mut_ptr() as u64;
        hdr.din_xfer_len = buffer.len() as u32;
        hdr.response = sense.as_mut_ptr() as u64;
        hdr.max_response_len = sense.len() as u32;
        pt.sg_io_v4(&mut hdr)?;
        assert_eq!(category(&hdr, &sense), SenseCategory::MediumHard);
        Ok(())
    }

    #[test]
    fn abort_pending_and_completed() -> Result<(), Error> {
        let disk = EmulatedDisk::new(512, 4);
        let pt = disk.open_handle();
        pt.set_force_pack_id(true)?;
        let cdb = cdb::synchronize_cache10();

        let mut hdr = v4(&cdb, 11);
        pt.submit(&mut hdr)?;
        // completed at submit time
        assert_eq!(pt.abort(&hdr), Err(Errno::ENODATA));
        pt.receive(&mut hdr)?;
        assert!(is_clean(&hdr));

        disk.set_hold_commands(true);
        let mut hdr = v4(&cdb, 12);
        pt.submit(&mut hdr)?;
        assert_eq!(pt.num_waiting()?, 0);
        pt.abort(&hdr)?;
        pt.receive(&mut hdr)?;
        assert_eq!(hdr.transport_status, DID_ABORT);
        assert_eq!(category(&hdr, &[]), SenseCategory::AbortedCommand);
        Ok(())
    }

    #[test]
    fn multiple_requests_stop_and_do_on_other() -> Result<(), Error> {
        let src = EmulatedDisk::with_data(512, pattern(512 * 8));
        let dst = EmulatedDisk::new(512, 8);
        let in_pt = src.open_handle();
        let out_pt = dst.open_handle();
        share(&*out_pt, &*in_pt)?;

        let mut cdbs = vec![0u8; 2 * SG_MAX_CDB_SIZE];
        let read = build_rw_cdb(10, RwOp::Read, 0, 8, false, false)?;
        let write = build_rw_cdb(10, RwOp::Write, 0, 8, false, false)?;
        cdbs[..10].copy_from_slice(&read);
        cdbs[SG_MAX_CDB_SIZE..SG_MAX_CDB_SIZE + 10].copy_from_slice(&write);

        let mut reqs = [SgIoV4::new(), SgIoV4::new()];
        reqs[0].request_len = 10;
        reqs[0].set_pack_id(1);
        reqs[0].set_sg_flags(SgFlags::SHARE | SgFlags::NO_DXFER);
        reqs[1].request_len = 10;
        reqs[1].set_pack_id(2);
        reqs[1].set_sg_flags(SgFlags::SHARE | SgFlags::NO_DXFER | SgFlags::DO_ON_OTHER);

        let mut ctl = SgIoV4::new();
        ctl.set_sg_flags(SgFlags::MULTIPLE_REQS | SgFlags::STOP_IF);
        ctl.request = cdbs.as_ptr() as u64;
        ctl.request_len = cdbs.len() as u32;
        ctl.dout_xferp = reqs.as_mut_ptr() as u64;
        ctl.dout_xfer_len = (2 * SgIoV4::SIZE) as u32;
        ctl.din_xferp = reqs.as_mut_ptr() as u64;
        ctl.din_xfer_len = (2 * SgIoV4::SIZE) as u32;
        in_pt.sg_io_v4(&mut ctl)?;

        assert_eq!(ctl.info, 2);
        assert_eq!(ctl.din_resid, 0);
        assert_eq!(dst.data(), src.data());
        assert_eq!(src.batch_count(), 1);
        assert_eq!(dst.trace()[0].fd, out_pt.raw_fd());

        // STOP_IF ends the batch at the first failing request
        src.inject_unit_attentions(1);
        let mut reqs = [SgIoV4::new(), SgIoV4::new()];
        for (i, req) in reqs.iter_mut().enumerate() {
            req.request_len = 10;
            req.set_pack_id(10 + i as i32);
        }
        ctl.set_sg_flags(SgFlags::MULTIPLE_REQS | SgFlags::STOP_IF);
        ctl.dout_xferp = reqs.as_mut_ptr() as u64;
        ctl.din_xferp = reqs.as_mut_ptr() as u64;
        cdbs[SG_MAX_CDB_SIZE..SG_MAX_CDB_SIZE + 10].copy_from_slice(&read);
        in_pt.sg_io_v4(&mut ctl)?;
        assert_eq!(ctl.info, 1);
        assert_eq!(ctl.din_resid, 1);
        assert_eq!(reqs[0].device_status, SAM_STAT_CHECK_CONDITION);
        Ok(())
    }

    #[test]
    fn async_multiple_requests() -> Result<(), Error> {
        let disk = EmulatedDisk::with_data(512, pattern(512 * 4));
        let pt = disk.open_handle();
        let read = build_rw_cdb(10, RwOp::Read, 0, 1, false, false)?;
        let mut buffers = vec![vec![0u8; 512]; 4];

        let mut reqs: Vec<SgIoV4> = buffers
            .iter_mut()
            .enumerate()
            .map(|(i, buffer)| {
                let mut req = v4(&read, i as i32);
                req.din_xferp = buffer.as_mut_ptr() as u64;
                req.din_xfer_len = 512;
                req
            })
            .collect();

        let mut ctl = SgIoV4::new();
        ctl.set_sg_flags(SgFlags::MULTIPLE_REQS);
        ctl.dout_xferp = reqs.as_mut_ptr() as u64;
        ctl.dout_xfer_len = (reqs.len() * SgIoV4::SIZE) as u32;
        pt.submit(&mut ctl)?;
        assert_eq!(pt.num_waiting()?, 4);

        let mut out = vec![SgIoV4::new(); 4];
        let mut rcv = SgIoV4::new();
        rcv.set_sg_flags(SgFlags::MULTIPLE_REQS | SgFlags::IMMED);
        rcv.din_xferp = out.as_mut_ptr() as u64;
        rcv.din_xfer_len = (2 * SgIoV4::SIZE) as u32;
        pt.receive(&mut rcv)?;
        assert_eq!(rcv.info, 2);
        rcv.din_xfer_len = (4 * SgIoV4::SIZE) as u32;
        pt.receive(&mut rcv)?;
        assert_eq!(rcv.info, 2);
        pt.receive(&mut rcv)?;
        assert_eq!(rcv.info, 0);
        assert_eq!(&buffers[0][..], &disk.data()[..512]);
        Ok(())
    }

    #[test]
    fn extended_info() -> Result<(), Error> {
        let disk = EmulatedDisk::new(512, 4);
        let a = disk.open_handle();
        let b = disk.open_handle();
        share(&*b, &*a)?;

        let flags = crate::device::get_ctl_flags(&*a, CtlFlags::IS_SHARE | CtlFlags::IS_READ_SIDE)?;
        assert_eq!(flags, CtlFlags::IS_SHARE | CtlFlags::IS_READ_SIDE);
        let flags = crate::device::get_ctl_flags(&*b, CtlFlags::IS_SHARE | CtlFlags::IS_READ_SIDE)?;
        assert_eq!(flags, CtlFlags::IS_SHARE);

        crate::device::set_ctl_flags(&*a, CtlFlags::NO_DURATION, true)?;
        let flags = crate::device::get_ctl_flags(&*a, CtlFlags::NO_DURATION)?;
        assert_eq!(flags, CtlFlags::NO_DURATION);

        assert_eq!(crate::device::set_elem_size(&*a, 1000), Err(Errno::EINVAL));
        crate::device::set_elem_size(&*a, 8192)?;

        let fd = b.raw_fd();
        drop(b);
        assert!(lookup_handle(fd).is_none());
        Ok(())
    }
}
