//! Process wide copy state
//!
//! A [Collection] is built once from the parsed [Options]: operands are
//! cross checked, endpoints opened and the transfer plan (v3/v4, buffer
//! sharing, multiple requests, write ordering) is fixed. Workers only
//! get a shared reference to it.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{format_err, Error};

use sg_pt::cdb::max_transfer_blocks;
use sg_pt::device::{set_ctl_flags, set_elem_size, set_fd_threshold, share};
use sg_pt::sg_io::SG_V4_MIN_VERSION;
use sg_pt::{CtlFlags, FileType, OpenMode, PassThrough, PassThroughOpener};

use crate::distributor::Distributor;
use crate::endpoint::{open_input, open_output, Endpoint, PtEndpoint};
use crate::error::{contradict_bail, syntax_bail, DdError, EXIT_INTERRUPTED};
use crate::options::{DdFlags, MrqSide, Options};
use crate::stats::{Counters, Stats, StatsContext};

/// How multiple requests batches are submitted and harvested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrqMode {
    /// one SG_IO ioctl which returns once all requests completed
    Blocking,
    /// SG_IOSUBMIT, then poll SG_GET_NUM_WAITING and receive
    Submit,
    /// SG_IOSUBMIT without wait queue, receive with IMMED
    Waitless,
}

/// Fixed multiple requests plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrqPlan {
    pub nmrqs: usize,
    pub mode: MrqMode,
    /// READs are deferred (pass-through input)
    pub reads: bool,
    /// WRITEs are deferred (pass-through output)
    pub writes: bool,
    /// both halves in one batch on the input fd with shared reservation
    pub svb: bool,
    pub pack_cmds: bool,
}

impl MrqPlan {
    /// Batch where READ and WRITE items go to different fds
    pub fn is_split(&self) -> bool {
        self.reads && self.writes && !self.svb
    }
}

/// Per side transfer settings
#[derive(Debug, Clone, Copy)]
pub struct SidePlan {
    pub flags: DdFlags,
    /// use SG_IOSUBMIT/SG_IORECEIVE (pass-through only)
    pub v4: bool,
    pub cdb_size: usize,
    pub fua: bool,
    pub dpo: bool,
}

/// Everything the workers need to know about how to move data
#[derive(Debug, Clone, Copy)]
pub struct Plan {
    pub bs: usize,
    pub bpt: u32,
    pub total: u64,
    pub input: SidePlan,
    pub output: SidePlan,
    /// READ and WRITE use one kernel reservation (both sides pass-through)
    pub share: bool,
    pub swait: bool,
    pub ofsplit: u32,
    /// writes must enter the output section in block order
    pub ordered: bool,
    pub mrq: Option<MrqPlan>,
    pub coe: bool,
    pub verify: bool,
    pub prefetch: bool,
    pub nanosecond: bool,
}

/// State shared by all workers
pub struct SharedState {
    pub distributor: Distributor,
    pub in_rem_count: AtomicI64,
    pub out_rem_count: AtomicI64,
    /// next output block allowed into the ordered output section
    pub out_blk: AtomicU64,
    in_stop: AtomicBool,
    out_stop: AtomicBool,
    exit_status: AtomicI32,
    pub mono_pack_id: AtomicI32,
    pub mono_swait_id: AtomicI32,
    pub mono_mrq_id: AtomicI32,
    pub in_mutex: Mutex<()>,
    pub out_mutex: Mutex<()>,
    pub out2_mutex: Mutex<()>,
    pub out_sync_cv: Condvar,
    pub counters: Counters,
    pub start: Instant,
}

/// Lock a mutex, a poisoned lock is recovered
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedState {
    fn new(total: u64, seek: u64) -> Self {
        Self {
            distributor: Distributor::new(),
            in_rem_count: AtomicI64::new(total as i64),
            out_rem_count: AtomicI64::new(total as i64),
            out_blk: AtomicU64::new(seek),
            in_stop: AtomicBool::new(false),
            out_stop: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            mono_pack_id: AtomicI32::new(1),
            mono_swait_id: AtomicI32::new(1),
            mono_mrq_id: AtomicI32::new(1),
            in_mutex: Mutex::new(()),
            out_mutex: Mutex::new(()),
            out2_mutex: Mutex::new(()),
            out_sync_cv: Condvar::new(),
            counters: Counters::default(),
            start: Instant::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(total: u64) -> Self {
        Self::new(total, 0)
    }

    pub fn in_stop(&self) -> bool {
        self.in_stop.load(Ordering::SeqCst)
    }

    pub fn out_stop(&self) -> bool {
        self.out_stop.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.in_stop() || self.out_stop()
    }

    pub fn set_in_stop(&self) {
        self.in_stop.store(true, Ordering::SeqCst);
    }

    pub fn set_out_stop(&self) {
        self.out_stop.store(true, Ordering::SeqCst);
        self.notify_out();
    }

    /// Wake all workers waiting for their turn in the output section
    pub fn notify_out(&self) {
        // taking the lock orders the wakeup after a waiter's check
        let _guard = lock(&self.out_mutex);
        self.out_sync_cv.notify_all();
    }

    /// Keep the numerically largest exit status seen
    pub fn record_exit_status(&self, status: i32) {
        self.exit_status.fetch_max(status, Ordering::SeqCst);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    /// Stop both halves because of a failure
    pub fn fail(&self, status: i32) {
        self.record_exit_status(status);
        self.set_in_stop();
        self.set_out_stop();
    }

    /// SIGINT handling, stops both halves and wakes every waiter
    pub fn request_interrupt(&self) {
        self.fail(EXIT_INTERRUPTED);
    }

    pub fn sub_in_rem(&self, blocks: i64) {
        self.in_rem_count.fetch_sub(blocks, Ordering::SeqCst);
    }

    pub fn sub_out_rem(&self, blocks: i64) {
        self.out_rem_count.fetch_sub(blocks, Ordering::SeqCst);
    }

    pub fn next_pack_id(&self) -> i32 {
        self.mono_pack_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// The configured copy
pub struct Collection {
    pub opts: Options,
    pub plan: Plan,
    pub input: Endpoint,
    pub output: Endpoint,
    pub out2: Option<Endpoint>,
    pub ofreg: Option<File>,
    pub shared: SharedState,
}

fn detect(path: Option<&Path>) -> Result<FileType, Error> {
    match path {
        None => Ok(FileType::Stream),
        Some(path) => FileType::detect(path).map_err(|err| DdError::File(err).into()),
    }
}

fn file_error(err: Error) -> Error {
    match err.downcast::<DdError>() {
        Ok(err) => err.into(),
        Err(err) => DdError::File(err).into(),
    }
}

/// Cross checks which only need the endpoint types
fn check_operands(opts: &Options, in_type: FileType, out_type: FileType) -> Result<(), Error> {
    let any = opts.any_flags();

    if in_type == FileType::Tape || out_type == FileType::Tape {
        return Err(DdError::File(format_err!("scsi tape devices are not supported")).into());
    }
    if opts.ofsplit > 0 && opts.ofsplit >= opts.bpt {
        contradict_bail!("ofsplit={} must be less than bpt={}", opts.ofsplit, opts.bpt);
    }
    if opts.in_flags.contains(DdFlags::MMAP) && opts.out_flags.contains(DdFlags::MMAP) {
        contradict_bail!("mmap can only be used on one side");
    }
    for flags in [opts.in_flags, opts.out_flags] {
        if flags.contains(DdFlags::MMAP | DdFlags::DIO) {
            contradict_bail!("mmap and dio can not be combined on one side");
        }
    }
    if opts.out_flags.contains(DdFlags::APPEND) {
        if opts.seek > 0 {
            contradict_bail!("oflag=append conflicts with seek={}", opts.seek);
        }
        if opts.verify {
            contradict_bail!("oflag=append conflicts with --verify");
        }
    }
    if opts.verify && out_type != FileType::PassThrough {
        contradict_bail!("--verify needs a pass-through output");
    }
    if opts.prefetch && !opts.verify {
        contradict_bail!("--prefetch only works together with --verify");
    }

    let both_pt = in_type == FileType::PassThrough && out_type == FileType::PassThrough;
    let mrq = &opts.mrq;
    if mrq.enabled() {
        if in_type != FileType::PassThrough && out_type != FileType::PassThrough {
            contradict_bail!("mrq= needs at least one pass-through endpoint");
        }
        if opts.out2.is_some() || opts.ofreg.is_some() {
            contradict_bail!("mrq= can not be combined with of2= or ofreg=");
        }
        if any.contains(DdFlags::SWAIT) {
            contradict_bail!("mrq= can not be combined with swait");
        }
        if opts.prefetch {
            contradict_bail!("mrq= can not be combined with --prefetch");
        }
        if any.intersects(DdFlags::MMAP) {
            contradict_bail!("mrq= can not be combined with mmap");
        }
        if any.contains(DdFlags::SAME_FDS | DdFlags::MRQ_IMMED) {
            contradict_bail!("same_fds can not be combined with mrq_immed");
        }
        match mrq.side {
            MrqSide::In if in_type != FileType::PassThrough => {
                contradict_bail!("mrq=i,N needs a pass-through input")
            }
            MrqSide::In if both_pt => {
                contradict_bail!("mrq=i,N is not supported between two pass-through devices")
            }
            MrqSide::In if out_type != FileType::Null => {
                contradict_bail!("mrq=i,N needs of=/dev/null")
            }
            MrqSide::Out if out_type != FileType::PassThrough => {
                contradict_bail!("mrq=o,N needs a pass-through output")
            }
            MrqSide::Both
                if in_type == FileType::PassThrough && !both_pt && out_type != FileType::Null =>
            {
                contradict_bail!("deferred READs need of=/dev/null or a pass-through output")
            }
            _ => {}
        }
        if both_pt && mrq.side == MrqSide::Both {
            if opts.ofsplit > 0 && mrq.nmrqs % 3 != 0 {
                contradict_bail!("with ofsplit, mrq={} must be a multiple of 3", mrq.nmrqs);
            }
            if opts.ofsplit == 0 && mrq.nmrqs % 2 != 0 {
                contradict_bail!("mrq={} must be even when copying between pass-through devices", mrq.nmrqs);
            }
        }
    }
    if any.contains(DdFlags::SWAIT) && (opts.out2.is_some() || opts.ofreg.is_some()) {
        contradict_bail!("swait can not be combined with of2= or ofreg=");
    }
    Ok(())
}

/// Every segment must fit into one CDB and into the reserved buffer
fn check_transfer_sizes(opts: &Options, in_type: FileType, out_type: FileType) -> Result<(), Error> {
    for (side, cdb_size, kind) in [("i", opts.cdbsz_in, in_type), ("o", opts.cdbsz_out, out_type)] {
        if kind != FileType::PassThrough {
            continue;
        }
        match max_transfer_blocks(cdb_size) {
            Some(max) if opts.bpt > max => contradict_bail!(
                "bpt={} exceeds the {} blocks a {} byte cdb can transfer ({} side)",
                opts.bpt,
                max,
                cdb_size,
                side
            ),
            Some(_) => {}
            None => syntax_bail!("cdbsz={} not supported, expect 6, 10, 12 or 16", cdb_size),
        }
        if i32::try_from(opts.bs as u64 * opts.bpt as u64).is_err() {
            contradict_bail!(
                "bs={} times bpt={} is too large for the reserved buffer",
                opts.bs,
                opts.bpt
            );
        }
    }
    Ok(())
}

/// Exit status 15 for open failures, keep typed errors
fn open_err<T>(res: Result<T, Error>) -> Result<T, Error> {
    res.map_err(file_error)
}

fn side_v4(flags: DdFlags, version: i32, name: &str, needs_v4: bool) -> Result<bool, Error> {
    let capable = version >= SG_V4_MIN_VERSION;
    if flags.contains(DdFlags::V4) && !capable {
        return Err(DdError::File(format_err!(
            "{}: sg driver version {} does not support the v4 interface",
            name,
            version
        ))
        .into());
    }
    if needs_v4 && !capable {
        return Err(DdError::File(format_err!(
            "{}: sg driver version {} too old for multiple requests",
            name,
            version
        ))
        .into());
    }
    if needs_v4 && flags.contains(DdFlags::V3) {
        contradict_bail!("{}: multiple requests need the v4 interface, not v3", name);
    }
    Ok(capable && !flags.contains(DdFlags::V3))
}

fn side_plan(flags: DdFlags, v4: bool, cdb_size: usize) -> SidePlan {
    SidePlan {
        flags,
        v4,
        cdb_size,
        fua: flags.contains(DdFlags::FUA),
        dpo: flags.contains(DdFlags::DPO),
    }
}

impl Collection {
    /// Validate operands and open all endpoints
    pub fn new(opts: Options) -> Result<Self, Error> {
        Self::with_pass_through(opts, None, None)
    }

    /// Like [Collection::new], with pass-through endpoints supplied by the
    /// caller instead of opened from `if=`/`of=`
    pub fn with_pass_through(
        mut opts: Options,
        input: Option<Arc<dyn PassThroughOpener>>,
        output: Option<Arc<dyn PassThroughOpener>>,
    ) -> Result<Self, Error> {
        let in_type = match input {
            Some(_) => FileType::PassThrough,
            None => detect(opts.infile.as_deref())?,
        };
        let out_type = match (&output, &opts.outfile) {
            (Some(_), _) => FileType::PassThrough,
            (None, None) => FileType::Null,
            (None, Some(path)) => detect(Some(path.as_path()))?,
        };

        check_operands(&opts, in_type, out_type)?;

        if opts.verify && opts.cdbsz_out != 10 {
            log::warn!("--verify needs 10 byte cdbs on the output, using cdbsz=10");
            opts.cdbsz_out = 10;
        }
        for (side, flags, kind) in [
            ("i", &mut opts.in_flags, in_type),
            ("o", &mut opts.out_flags, out_type),
        ] {
            if kind != FileType::PassThrough && flags.intersects(DdFlags::MMAP | DdFlags::NOXFER) {
                log::warn!("{}flag=mmap/noxfer only apply to pass-through devices, ignored", side);
                flags.remove(DdFlags::MMAP | DdFlags::MMAP_KEEP | DdFlags::NOXFER);
            }
        }
        check_transfer_sizes(&opts, in_type, out_type)?;

        let same_fds_in = opts.in_flags.contains(DdFlags::SAME_FDS);
        let input = match input {
            Some(opener) => Endpoint::PassThrough(open_err(PtEndpoint::probe(opener, same_fds_in))?),
            None => open_err(open_input(
                opts.infile.as_deref(),
                in_type,
                opts.in_flags,
                opts.skip,
                opts.bs,
            ))?,
        };
        let output = match output {
            Some(opener) => Endpoint::PassThrough(open_err(PtEndpoint::probe(
                opener,
                opts.out_flags.contains(DdFlags::SAME_FDS),
            ))?),
            None => open_err(open_output(
                opts.outfile.as_deref(),
                out_type,
                opts.out_flags,
                opts.seek,
            ))?,
        };

        let out2 = match &opts.out2 {
            None => None,
            Some(path) => {
                let kind = detect(Some(path.as_path()))?;
                if kind == FileType::PassThrough || kind == FileType::Tape {
                    contradict_bail!("of2= must be a regular file, block device or pipe");
                }
                Some(open_err(open_output(
                    Some(path.as_path()),
                    kind,
                    DdFlags::empty(),
                    opts.seek,
                ))?)
            }
        };
        let ofreg = match &opts.ofreg {
            None => None,
            Some(path) => {
                let mode = OpenMode {
                    create: true,
                    ..Default::default()
                };
                let file = open_err(mode.open(path))?;
                Some(file)
            }
        };

        let plan = Self::make_plan(&opts, &input, &output, out2.as_ref(), ofreg.is_some())?;
        let shared = SharedState::new(plan.total, opts.seek);

        log::debug!(
            "copy {} blocks of {} bytes from {} ({}) to {} ({}), plan {:?}",
            plan.total,
            plan.bs,
            input.name(),
            input.file_type(),
            output.name(),
            output.file_type(),
            plan
        );

        Ok(Self {
            opts,
            plan,
            input,
            output,
            out2,
            ofreg,
            shared,
        })
    }

    fn make_plan(
        opts: &Options,
        input: &Endpoint,
        output: &Endpoint,
        out2: Option<&Endpoint>,
        has_ofreg: bool,
    ) -> Result<Plan, Error> {
        let any = opts.any_flags();
        let mrq_on = opts.mrq.enabled();

        let in_v4 = match input.as_pass_through() {
            Some(pt) => side_v4(
                opts.in_flags,
                pt.version,
                input.name(),
                mrq_on && opts.mrq.side != MrqSide::Out,
            )?,
            None => false,
        };
        let out_v4 = match output.as_pass_through() {
            Some(pt) => side_v4(
                opts.out_flags,
                pt.version,
                output.name(),
                mrq_on && opts.mrq.side != MrqSide::In,
            )?,
            None => false,
        };

        let both_pt = input.is_pass_through() && output.is_pass_through();
        let unbalanced = mrq_on && opts.mrq.side != MrqSide::Both;
        if both_pt && unbalanced && !opts.noshare {
            log::info!("unbalanced mrq between pass-through devices, buffer sharing disabled");
        }
        let share = both_pt && in_v4 && out_v4 && !opts.noshare && !unbalanced;

        if share && opts.out_flags.contains(DdFlags::MMAP) {
            contradict_bail!("oflag=mmap can not be used while sharing the reservation");
        }
        if share && any.contains(DdFlags::SAME_FDS) {
            contradict_bail!("same_fds can not be combined with buffer sharing, use noshare=1");
        }
        if opts.in_flags.contains(DdFlags::NOXFER)
            && !share
            && !output.is_null()
        {
            contradict_bail!("iflag=noxfer needs a null output or a shared reservation");
        }

        let mut swait = any.contains(DdFlags::SWAIT);
        if swait && !share {
            log::warn!("swait needs a shared reservation between pass-through devices, ignored");
            swait = false;
        }

        let mrq = if mrq_on {
            let reads = input.is_pass_through() && opts.mrq.side != MrqSide::Out;
            let writes = output.is_pass_through() && opts.mrq.side != MrqSide::In;
            let svb_requested = any.contains(DdFlags::MRQ_SVB);
            let balanced = reads && writes;
            if svb_requested && !(share && balanced) {
                contradict_bail!("mrq_svb needs a balanced mrq with buffer sharing");
            }
            let mode = if any.contains(DdFlags::MRQ_IMMED) {
                if any.contains(DdFlags::NO_WAITQ) {
                    MrqMode::Waitless
                } else {
                    MrqMode::Submit
                }
            } else {
                MrqMode::Blocking
            };
            Some(MrqPlan {
                nmrqs: opts.mrq.nmrqs,
                mode,
                reads,
                writes,
                svb: balanced && share,
                pack_cmds: opts.mrq.pack_cmds,
            })
        } else {
            None
        };

        let total = Self::derive_count(opts, input, output)?;

        let out2_sequential = out2.map(|e| e.is_sequential()).unwrap_or(false);
        let ordered = mrq.is_none()
            && (has_ofreg || output.is_null() || output.is_sequential() || out2_sequential);

        let nanosecond = opts.time == 2 || std::env::var_os("SG3_UTILS_LINUX_NANO").is_some();

        Ok(Plan {
            bs: opts.bs,
            bpt: opts.bpt,
            total,
            input: side_plan(opts.in_flags, in_v4, opts.cdbsz_in),
            output: side_plan(opts.out_flags, out_v4, opts.cdbsz_out),
            share,
            swait,
            ofsplit: opts.ofsplit,
            ordered,
            mrq,
            coe: opts.coe,
            verify: opts.verify,
            prefetch: opts.prefetch,
            nanosecond,
        })
    }

    fn derive_count(opts: &Options, input: &Endpoint, output: &Endpoint) -> Result<u64, Error> {
        for endpoint in [input, output] {
            if let Some(PtEndpoint {
                block_length: Some(len),
                ..
            }) = endpoint.as_pass_through()
            {
                if *len as usize != opts.bs {
                    log::warn!(
                        "{}: logical block size {} differs from bs={}",
                        endpoint.name(),
                        len,
                        opts.bs
                    );
                }
            }
        }

        if let Some(count) = opts.count {
            return Ok(count);
        }

        let in_avail = open_err(input.num_blocks(opts.bs))?
            .map(|blocks| blocks.saturating_sub(opts.skip));
        // regular output files grow as needed
        let out_blocks = match output {
            Endpoint::File(file) if file.kind == FileType::Regular => None,
            _ if opts.out_flags.contains(DdFlags::APPEND) => None,
            _ => open_err(output.num_blocks(opts.bs))?,
        };
        let out_avail = out_blocks.map(|blocks| blocks.saturating_sub(opts.seek));

        match (in_avail, out_avail) {
            (Some(a), Some(b)) => Ok(a.min(b)),
            (Some(a), None) => Ok(a),
            (None, Some(b)) => Ok(b),
            (None, None) => syntax_bail!("count= not given and it can not be derived from the endpoints"),
        }
    }

    /// Open and configure one pass-through handle for a worker
    pub fn prepare_handle(&self, endpoint: &PtEndpoint, side_flags: DdFlags, v4: bool) -> Result<Arc<dyn PassThrough>, Error> {
        let pt = endpoint.handle()?;
        let name = endpoint.opener.name();
        let plan = &self.plan;

        if !side_flags.contains(DdFlags::DEFRES) {
            let size = plan.bs * plan.bpt as usize;
            let wanted = i32::try_from(size).map_err(|_| {
                DdError::OutOfMemory(format!("{}: reserved buffer of {} bytes too large", name, size))
            })?;
            pt.set_reserved_size(wanted)
                .map_err(|err| format_err!("{}: SG_SET_RESERVED_SIZE failed - {}", name, err))?;
            let got = pt.reserved_size().unwrap_or(0);
            if (got as usize) < size {
                log::warn!("{}: reserved size only {} bytes, wanted {}", name, got, size);
            }
        }

        if !v4 {
            return Ok(pt);
        }

        pt.set_force_pack_id(true)
            .map_err(|err| format_err!("{}: SG_SET_FORCE_PACK_ID failed - {}", name, err))?;

        let mut ctl = CtlFlags::empty();
        if side_flags.contains(DdFlags::NO_DURATION) {
            ctl |= CtlFlags::NO_DURATION;
        }
        if side_flags.contains(DdFlags::MASYNC) {
            ctl |= CtlFlags::MORE_ASYNC;
        }
        if side_flags.contains(DdFlags::WQ_EXCL) {
            ctl |= CtlFlags::EXCL_WAITQ;
        }
        if plan.nanosecond {
            ctl |= CtlFlags::TIME_IN_NS;
        }
        if !ctl.is_empty() {
            set_ctl_flags(&*pt, ctl, true)
                .map_err(|err| format_err!("{}: setting ctl flags {:?} failed - {}", name, ctl, err))?;
        }

        if self.opts.elem_size > 0 {
            set_elem_size(&*pt, self.opts.elem_size)
                .map_err(|err| format_err!("{}: setting element size failed - {}", name, err))?;
        }

        if let Some(mrq) = &plan.mrq {
            let bytes = plan.bs as u64 * plan.bpt as u64 * mrq.nmrqs as u64;
            if let Err(err) = set_fd_threshold(&*pt, bytes.min(u32::MAX as u64) as u32) {
                log::warn!("{}: raising the fd threshold failed - {}", name, err);
            }
        }

        Ok(pt)
    }

    /// Share the input handle's reservation with the output handle
    pub fn share_pair(&self, input: &dyn PassThrough, output: &dyn PassThrough) -> Result<(), Error> {
        share(output, input).map_err(|err| {
            format_err!(
                "sharing reservation of {} with {} failed - {}",
                self.input.name(),
                self.output.name(),
                err
            )
        })
    }

    /// SYNCHRONIZE CACHE (pass-through) or fsync the outputs
    pub fn sync_outputs(&self) -> Result<(), Error> {
        for endpoint in std::iter::once(&self.output).chain(self.out2.iter()) {
            match endpoint {
                Endpoint::Null => {}
                Endpoint::File(file) => file.sync()?,
                Endpoint::PassThrough(pt) => {
                    let handle = pt.handle()?;
                    sg_pt::synchronize_cache(&*handle).map_err(|err| {
                        format_err!("{}: SYNCHRONIZE CACHE failed - {}", endpoint.name(), err)
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Current statistics
    pub fn stats(&self) -> Stats {
        Stats::capture(
            &self.shared.counters,
            StatsContext {
                in_remaining: self.shared.in_rem_count.load(Ordering::SeqCst),
                out_remaining: self.shared.out_rem_count.load(Ordering::SeqCst),
                has_out2: self.out2.is_some(),
                verify: self.plan.verify,
                block_size: self.plan.bs,
                elapsed: self.shared.start.elapsed(),
                time: self.opts.time,
                exit_status: self.shared.exit_status(),
            },
        )
    }

    /// Log a progress line (SIGUSR1/SIGUSR2)
    pub fn log_progress(&self) {
        let stats = self.stats();
        log::info!(
            "progress: {}+{} records in, {}+{} records out, remaining in={} out={}, {:.3} secs",
            stats.records_in_full,
            stats.records_in_partial,
            stats.records_out_full,
            stats.records_out_partial,
            stats.in_remaining,
            stats.out_remaining,
            stats.elapsed_secs
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use sg_pt::emulate::EmulatedDisk;

    use crate::error::{EXIT_CONTRADICT, EXIT_FILE_ERROR, EXIT_SYNTAX};
    use crate::options::{Invocation, MrqOptions};

    fn opts(args: &[&str]) -> Options {
        match Options::parse_args(args) {
            Ok(Invocation::Run(opts)) => *opts,
            other => panic!("unexpected parse result {:?}", other),
        }
    }

    fn emulated(disk: &EmulatedDisk, name: &str) -> Option<Arc<dyn PassThroughOpener>> {
        Some(Arc::new(disk.opener(name)))
    }

    fn exit_code(res: Result<Collection, Error>) -> i32 {
        match res {
            Ok(_) => 0,
            Err(err) => DdError::exit_code_of(&err),
        }
    }

    #[test]
    fn count_from_capacities() -> Result<(), Error> {
        let src = EmulatedDisk::new(512, 1000);
        let dst = EmulatedDisk::new(512, 800);
        let coll = Collection::with_pass_through(
            opts(&["skip=100", "seek=50"]),
            emulated(&src, "src"),
            emulated(&dst, "dst"),
        )?;
        assert_eq!(coll.plan.total, 750);
        assert!(coll.plan.share);
        assert!(!coll.plan.ordered);
        assert_eq!(coll.shared.out_blk.load(Ordering::SeqCst), 50);

        let coll = Collection::with_pass_through(opts(&[]), emulated(&src, "src"), None)?;
        assert_eq!(coll.plan.total, 1000);
        assert!(coll.plan.ordered);
        assert!(coll.output.is_null());
        Ok(())
    }

    #[test]
    fn contradictions() {
        let src = EmulatedDisk::new(512, 64);
        let dst = EmulatedDisk::new(512, 64);
        let run = |args: &[&str]| {
            exit_code(Collection::with_pass_through(
                opts(args),
                emulated(&src, "src"),
                emulated(&dst, "dst"),
            ))
        };

        assert_eq!(run(&["bpt=8", "ofsplit=8"]), EXIT_CONTRADICT);
        assert_eq!(run(&["iflag=mmap", "oflag=mmap"]), EXIT_CONTRADICT);
        assert_eq!(run(&["oflag=mmap"]), EXIT_CONTRADICT);
        assert_eq!(run(&["mrq=5"]), EXIT_CONTRADICT);
        assert_eq!(run(&["bpt=8", "ofsplit=4", "mrq=4"]), EXIT_CONTRADICT);
        assert_eq!(run(&["mrq=i,4"]), EXIT_CONTRADICT);
        assert_eq!(run(&["oflag=append", "seek=1"]), EXIT_CONTRADICT);
        assert_eq!(run(&["--prefetch"]), EXIT_CONTRADICT);
        assert_eq!(run(&["iflag=same_fds"]), EXIT_CONTRADICT);
        assert_eq!(run(&["mrq=4", "--verify", "--prefetch"]), EXIT_CONTRADICT);
        assert_eq!(run(&["mrq=4", "iflag=swait"]), EXIT_CONTRADICT);
        assert_eq!(run(&["mrq=o,4", "oflag=mrq_svb"]), EXIT_CONTRADICT);
        assert_eq!(run(&["bpt=70000"]), EXIT_CONTRADICT);
        assert_eq!(run(&["bpt=300", "cdbsz=6"]), EXIT_CONTRADICT);
        assert_eq!(run(&["bs=4096", "bpt=1048576", "cdbsz=16"]), EXIT_CONTRADICT);

        assert_eq!(run(&["bpt=8", "ofsplit=4", "mrq=6"]), 0);
        assert_eq!(run(&["mrq=4", "oflag=mrq_svb"]), 0);
        assert_eq!(run(&["iflag=same_fds", "noshare=1"]), 0);
        assert_eq!(run(&["bpt=70000", "cdbsz=16"]), 0);
    }

    #[test]
    fn plans() -> Result<(), Error> {
        let src = EmulatedDisk::new(512, 64);
        let dst = EmulatedDisk::new(512, 64);

        let coll = Collection::with_pass_through(
            opts(&["mrq=4", "--verify", "cdbsz=16"]),
            emulated(&src, "src"),
            emulated(&dst, "dst"),
        )?;
        let mrq = coll.plan.mrq.expect("mrq plan");
        assert!(mrq.reads && mrq.writes && mrq.svb && !mrq.is_split());
        assert_eq!(mrq.mode, MrqMode::Blocking);
        assert_eq!(coll.plan.output.cdb_size, 10);
        assert_eq!(coll.plan.input.cdb_size, 16);

        let coll = Collection::with_pass_through(
            opts(&["mrq=o,4", "oflag=mrq_immed"]),
            emulated(&src, "src"),
            emulated(&dst, "dst"),
        )?;
        let mrq = coll.plan.mrq.expect("mrq plan");
        assert!(!mrq.reads && mrq.writes);
        assert!(!coll.plan.share);
        assert_eq!(mrq.mode, MrqMode::Submit);

        let coll = Collection::with_pass_through(
            opts(&["noshare=1", "mrq=2", "iflag=mrq_immed,no_waitq"]),
            emulated(&src, "src"),
            emulated(&dst, "dst"),
        )?;
        let mrq = coll.plan.mrq.expect("mrq plan");
        assert!(mrq.is_split());
        assert_eq!(mrq.mode, MrqMode::Waitless);
        assert_eq!(coll.opts.mrq, MrqOptions { nmrqs: 2, ..Default::default() });

        src.set_version(30536);
        let coll = Collection::with_pass_through(
            opts(&["iflag=swait"]),
            emulated(&src, "src"),
            emulated(&dst, "dst"),
        )?;
        assert!(!coll.plan.input.v4 && coll.plan.output.v4);
        assert!(!coll.plan.share && !coll.plan.swait);

        let res = Collection::with_pass_through(
            opts(&["iflag=v4"]),
            emulated(&src, "src"),
            emulated(&dst, "dst"),
        );
        assert_eq!(exit_code(res), EXIT_FILE_ERROR);
        Ok(())
    }

    #[test]
    fn missing_count() {
        // neither /dev/null as input nor the null sink have a size
        let res = Collection::new(opts(&["if=/dev/null"]));
        assert_eq!(exit_code(res), EXIT_SYNTAX);

        let res = Collection::new(opts(&["if=/dev/null", "count=0"]));
        assert_eq!(exit_code(res), 0);
    }
}
