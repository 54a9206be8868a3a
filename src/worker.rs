//! Per thread copy loop
//!
//! Every worker repeatedly takes the next segment from the distributor,
//! READs it while holding the input mutex and WRITEs it while holding the
//! output mutex. Both locks only cover the submission, completions are
//! harvested without them.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use anyhow::{bail, format_err, Error};

use sg_pt::cdb::{build_prefetch_cdb, build_rw_cdb, RwOp};
use sg_pt::device::unshare;
use sg_pt::sg_io::{SG_INFO_DIRECT_IO, SG_INFO_DIRECT_IO_MASK};
use sg_pt::{AlignedBuffer, PassThrough, ReservationMap, SenseCategory, SgFlags};

use crate::adapter::{self, Command, Completion, MAX_RETRIES};
use crate::collection::{lock, Collection};
use crate::distributor::Segment;
use crate::endpoint::Endpoint;
use crate::error::DdError;
use crate::options::DdFlags;
use crate::stats::Counters;

/// What to do after a command completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Done,
    Retry,
    /// medium error with coe, continue with a zeroed segment
    ZeroFill,
    /// exit status recorded, both halves stopped
    Failed,
}

/// A segment after its READ half
struct ReadDone {
    seg: Segment,
    bytes: usize,
    /// data sits in the shared reservation of the input handle
    shared_data: bool,
    zero_filled: bool,
}

impl ReadDone {
    fn is_short(&self, bs: usize) -> bool {
        self.bytes < self.seg.blocks as usize * bs
    }
}

/// `(block offset, blocks)` of the WRITE commands for one segment
pub(crate) fn split_parts(blocks: u32, ofsplit: u32) -> Vec<(u32, u32)> {
    if ofsplit > 0 && blocks > ofsplit {
        vec![(0, ofsplit), (ofsplit, blocks - ofsplit)]
    } else {
        vec![(0, blocks)]
    }
}

pub struct Worker<'a> {
    pub(crate) id: usize,
    pub(crate) coll: &'a Collection,
    pub(crate) in_pt: Option<Arc<dyn PassThrough>>,
    pub(crate) out_pt: Option<Arc<dyn PassThrough>>,
    in_map: Option<ReservationMap>,
    out_map: Option<ReservationMap>,
    buffer: AlignedBuffer,
    submitted: u64,
}

fn map_reservation(
    pt: &Option<Arc<dyn PassThrough>>,
    flags: DdFlags,
    len: usize,
) -> Result<Option<ReservationMap>, Error> {
    match pt {
        Some(pt) if flags.contains(DdFlags::MMAP) => Ok(Some(
            pt.map_reservation(len, flags.contains(DdFlags::MMAP_KEEP))?,
        )),
        _ => Ok(None),
    }
}

impl<'a> Worker<'a> {
    /// Open and configure this worker's handles
    pub fn new(id: usize, coll: &'a Collection) -> Result<Self, Error> {
        let plan = &coll.plan;
        let len = plan.bs * plan.bpt as usize;
        let buffer = AlignedBuffer::new(len)
            .map_err(|err| DdError::OutOfMemory(format!("worker {} buffer - {}", id, err)))?;

        let in_pt = match coll.input.as_pass_through() {
            Some(endpoint) => Some(coll.prepare_handle(endpoint, plan.input.flags, plan.input.v4)?),
            None => None,
        };
        let out_pt = match coll.output.as_pass_through() {
            Some(endpoint) => {
                Some(coll.prepare_handle(endpoint, plan.output.flags, plan.output.v4)?)
            }
            None => None,
        };
        if plan.share {
            if let (Some(input), Some(output)) = (&in_pt, &out_pt) {
                coll.share_pair(&**input, &**output)?;
            }
        }

        let in_map = map_reservation(&in_pt, plan.input.flags, len)?;
        let out_map = map_reservation(&out_pt, plan.output.flags, len)?;

        log::debug!("worker {}: ready", id);

        Ok(Self {
            id,
            coll,
            in_pt,
            out_pt,
            in_map,
            out_map,
            buffer,
            submitted: 0,
        })
    }

    /// Copy segments until the distributor runs dry or a stop flag is set
    pub fn run(mut self) -> Result<(), Error> {
        let coll = self.coll;
        let plan = &coll.plan;
        let res = if plan.mrq.is_some() {
            crate::mrq::run(&mut self)
        } else if plan.swait {
            self.run_swait()
        } else {
            self.run_plain()
        };
        if let Err(err) = &res {
            // wake everybody before the error travels up to the join
            coll.shared.fail(DdError::exit_code_of(err));
        }
        self.finish();
        res
    }

    fn finish(&self) {
        let coll = self.coll;
        let unshare_wanted =
            coll.opts.unshare && !coll.opts.any_flags().contains(DdFlags::NO_UNSHARE);
        if coll.plan.share && unshare_wanted {
            if let Some(pt) = &self.in_pt {
                if let Err(err) = unshare(&**pt) {
                    log::warn!("worker {}: unshare failed - {}", self.id, err);
                }
            }
        }
        log::debug!("worker {}: finished after {} submissions", self.id, self.submitted);
    }

    fn run_plain(&mut self) -> Result<(), Error> {
        let bs = self.coll.plan.bs;
        while let Some(done) = self.read_half()? {
            self.write_half(&done)?;
            if done.is_short(bs) {
                break;
            }
        }
        Ok(())
    }

    fn user_copy(&self) -> bool {
        self.coll.ofreg.is_some() || self.coll.out2.is_some()
    }

    pub(crate) fn read_flags(&self) -> SgFlags {
        let plan = &self.coll.plan;
        let side = &plan.input;
        let mut flags = SgFlags::empty();
        if side.flags.contains(DdFlags::DIO) {
            flags |= SgFlags::DIRECT_IO;
        }
        if self.in_map.is_some() {
            flags |= SgFlags::MMAP_IO;
        }
        if side.flags.contains(DdFlags::NOXFER) {
            flags |= SgFlags::NO_DXFER;
        }
        if side.flags.contains(DdFlags::QHEAD) {
            flags |= SgFlags::Q_AT_HEAD;
        }
        if side.flags.contains(DdFlags::QTAIL) {
            flags |= SgFlags::Q_AT_TAIL;
        }
        if side.v4 && side.flags.contains(DdFlags::NO_WAITQ) {
            flags |= SgFlags::NO_WAITQ;
        }
        if plan.share {
            flags |= SgFlags::SHARE;
            if !self.user_copy() {
                flags |= SgFlags::NO_DXFER;
            }
        }
        flags
    }

    pub(crate) fn write_flags(&self) -> SgFlags {
        let side = &self.coll.plan.output;
        let mut flags = SgFlags::empty();
        if side.flags.contains(DdFlags::DIO) {
            flags |= SgFlags::DIRECT_IO;
        }
        if side.flags.contains(DdFlags::QHEAD) {
            flags |= SgFlags::Q_AT_HEAD;
        }
        if side.flags.contains(DdFlags::QTAIL) {
            flags |= SgFlags::Q_AT_TAIL;
        }
        if side.v4 && side.flags.contains(DdFlags::NO_WAITQ) {
            flags |= SgFlags::NO_WAITQ;
        }
        flags
    }

    /// Decide how to go on after a completion, updating the counters
    pub(crate) fn verdict(
        &self,
        what: &str,
        lba: u64,
        done: &Completion,
        dio: bool,
        zero_fill: bool,
        retries: &mut u32,
    ) -> Verdict {
        let coll = self.coll;
        let shared = &coll.shared;
        let counters = &shared.counters;

        if done.is_good() {
            if done.category == SenseCategory::Recovered {
                log::info!("{} at lba {}: {}", what, lba, done.describe());
            }
            if done.resid > 0 {
                Counters::add(&counters.resid_sum, done.resid as u64);
            }
            if dio && (done.info & SG_INFO_DIRECT_IO_MASK) != SG_INFO_DIRECT_IO {
                Counters::inc(&counters.dio_incomplete);
            }
            return Verdict::Done;
        }

        if done.category.is_retryable() && *retries < MAX_RETRIES {
            *retries += 1;
            Counters::inc(&counters.retries);
            log::debug!("{} at lba {}: {}, retrying", what, lba, done.describe());
            return Verdict::Retry;
        }

        if done.category == SenseCategory::MediumHard && zero_fill && coll.plan.coe {
            log::warn!(
                "{} at lba {}: {}, continuing with zeros",
                what,
                lba,
                done.describe()
            );
            return Verdict::ZeroFill;
        }

        if done.category == SenseCategory::Miscompare {
            Counters::inc(&counters.miscompares);
        }
        log::error!("{} at lba {} failed: {}", what, lba, done.describe());
        shared.fail(done.category.exit_code());
        Verdict::Failed
    }

    /// Count one submission, every `ae=`-th command gets aborted
    pub(crate) fn maybe_abort(&mut self, pt: &dyn PassThrough, cmd: &Command) -> Result<(), Error> {
        self.submitted += 1;
        let aen = self.coll.opts.aen as u64;
        if aen == 0 || self.submitted % aen != 0 {
            return Ok(());
        }
        let counters = &self.coll.shared.counters;
        Counters::inc(&counters.abort_req);
        if adapter::abort(pt, &cmd.hdr)? {
            Counters::inc(&counters.abort_success);
            log::debug!("worker {}: aborted pack id {}", self.id, cmd.pack_id());
        }
        Ok(())
    }

    /// Submit and wait for `cmd`, `guard` is released right after the
    /// submission (before the blocking SG_IO on v3 handles)
    fn execute(
        &mut self,
        pt: &dyn PassThrough,
        cmd: &mut Command,
        v4: bool,
        guard: MutexGuard<'_, ()>,
    ) -> Result<Completion, Error> {
        let coll = self.coll;
        let shared = &coll.shared;
        if !v4 {
            drop(guard);
            return adapter::run_blocking(shared, pt, cmd, false);
        }
        adapter::submit(shared, pt, &mut cmd.hdr)?;
        drop(guard);
        self.maybe_abort(pt, cmd)?;
        adapter::receive(pt, &mut cmd.hdr)?;
        Ok(cmd.completion())
    }

    fn account_read(&self, seg: Segment, bytes: usize) -> ReadDone {
        let shared = &self.coll.shared;
        let bs = self.coll.plan.bs;
        let full = (bytes / bs) as u64;
        let partial = bytes % bs != 0;

        Counters::add(&shared.counters.in_full, full);
        if partial {
            Counters::inc(&shared.counters.in_partial);
        }
        shared.sub_in_rem(full as i64 + partial as i64);

        let done = ReadDone {
            seg,
            bytes,
            shared_data: false,
            zero_filled: false,
        };
        if done.is_short(bs) {
            log::debug!(
                "worker {}: short read at block {}, {} of {} bytes",
                self.id,
                seg.iblk,
                bytes,
                seg.blocks as usize * bs
            );
            shared.set_in_stop();
        }
        done
    }

    pub(crate) fn account_write(&self, full: u64, partial: bool) {
        let shared = &self.coll.shared;
        Counters::add(&shared.counters.out_full, full);
        if partial {
            Counters::inc(&shared.counters.out_partial);
        }
        shared.sub_out_rem(full as i64 + partial as i64);
    }

    fn read_half(&mut self) -> Result<Option<ReadDone>, Error> {
        let coll = self.coll;
        let plan = &coll.plan;
        let shared = &coll.shared;

        let guard = lock(&shared.in_mutex);
        if shared.stopped() {
            return Ok(None);
        }
        let seg = match shared
            .distributor
            .next(plan.bpt, plan.total, coll.opts.skip, coll.opts.seek)
        {
            Some(seg) => seg,
            None => return Ok(None),
        };
        log::trace!("worker {}: segment {:?}", self.id, seg);

        match &coll.input {
            Endpoint::PassThrough(_) => self.pt_read(seg, guard),
            Endpoint::File(file) => {
                let len = seg.blocks as usize * plan.bs;
                let res = file.read_at(
                    &mut self.buffer.as_mut_slice()[..len],
                    seg.iblk * plan.bs as u64,
                );
                drop(guard);
                let bytes = res.map_err(DdError::File)?;
                Ok(Some(self.account_read(seg, bytes)))
            }
            Endpoint::Null => {
                drop(guard);
                Ok(Some(self.account_read(seg, 0)))
            }
        }
    }

    fn pt_read(&mut self, seg: Segment, guard: MutexGuard<'_, ()>) -> Result<Option<ReadDone>, Error> {
        let coll = self.coll;
        let plan = &coll.plan;
        let shared = &coll.shared;
        let pt = match &self.in_pt {
            Some(pt) => Arc::clone(pt),
            None => bail!("worker {}: no input handle", self.id),
        };

        let len = seg.blocks as usize * plan.bs;
        let side = &plan.input;
        let cdb = build_rw_cdb(side.cdb_size, RwOp::Read, seg.iblk, seg.blocks, side.fua, side.dpo)?;
        let flags = self.read_flags();
        let dio = flags.contains(SgFlags::DIRECT_IO);

        let mut held = Some(guard);
        let mut retries = 0;
        loop {
            let guard = match held.take() {
                Some(guard) => guard,
                None => lock(&shared.in_mutex),
            };
            let mut cmd = Command::new(cdb.clone(), flags, shared.next_pack_id());
            if !flags.intersects(SgFlags::NO_DXFER | SgFlags::MMAP_IO) {
                cmd.set_din(self.buffer.addr(), len);
            }
            let done = self.execute(&*pt, &mut cmd, side.v4, guard)?;

            match self.verdict("READ", seg.iblk, &done, dio, true, &mut retries) {
                Verdict::Retry => continue,
                Verdict::Failed => return Ok(None),
                Verdict::ZeroFill => {
                    self.buffer.as_mut_slice()[..len].fill(0);
                    let mut read = self.account_read(seg, len);
                    read.zero_filled = true;
                    return Ok(Some(read));
                }
                Verdict::Done => {
                    let mut read = self.account_read(seg, len);
                    read.shared_data = plan.share;
                    return Ok(Some(read));
                }
            }
        }
    }

    /// Data of a finished READ half in user memory
    fn user_data(&self, done: &ReadDone) -> &[u8] {
        match &self.in_map {
            Some(map) if !done.zero_filled => &map.as_slice()[..done.bytes],
            _ => &self.buffer.as_slice()[..done.bytes],
        }
    }

    fn user_addr(&self, done: &ReadDone) -> u64 {
        match &self.in_map {
            Some(map) if !done.zero_filled => map.as_slice().as_ptr() as u64,
            _ => self.buffer.addr(),
        }
    }

    fn write_half(&mut self, done: &ReadDone) -> Result<(), Error> {
        let coll = self.coll;
        let plan = &coll.plan;
        let shared = &coll.shared;
        let bs = plan.bs;

        if done.bytes == 0 {
            return Ok(());
        }
        let seg = done.seg;
        let full = (done.bytes / bs) as u64;
        let partial = done.bytes % bs != 0;

        let mut guard = lock(&shared.out_mutex);
        if plan.ordered {
            while shared.out_blk.load(Ordering::SeqCst) != seg.oblk && !shared.out_stop() {
                guard = shared
                    .out_sync_cv
                    .wait(guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        if shared.out_stop() {
            return Ok(());
        }

        if let Some(ofreg) = &coll.ofreg {
            let mut file = ofreg;
            file.write_all(self.user_data(done))
                .map_err(|err| DdError::File(format_err!("ofreg write failed - {}", err)))?;
        }
        if let Some(Endpoint::File(out2)) = &coll.out2 {
            let _out2_guard = lock(&shared.out2_mutex);
            out2.write_at(self.user_data(done), seg.oblk * bs as u64)
                .map_err(DdError::File)?;
            Counters::add(&shared.counters.out2_full, full);
            if partial {
                Counters::inc(&shared.counters.out2_partial);
            }
        }
        if plan.ordered {
            shared
                .out_blk
                .store(seg.oblk + seg.blocks as u64, Ordering::SeqCst);
            shared.out_sync_cv.notify_all();
        }

        let res = match &coll.output {
            Endpoint::Null => {
                drop(guard);
                self.account_write(full, partial);
                Ok(())
            }
            Endpoint::File(file) => {
                let res = file.write_at(self.user_data(done), seg.oblk * bs as u64);
                drop(guard);
                match res {
                    Ok(()) => {
                        self.account_write(full, partial);
                        Ok(())
                    }
                    Err(err) => Err(DdError::File(err).into()),
                }
            }
            Endpoint::PassThrough(_) => self.pt_write(done, guard, 0),
        };

        if plan.ordered && done.is_short(bs) {
            shared.set_out_stop();
        }
        res
    }

    fn prefetch(&self, pt: &dyn PassThrough, lba: u64, blocks: u32) {
        let shared = &self.coll.shared;
        let cdb = match build_prefetch_cdb(10, lba, blocks) {
            Ok(cdb) => cdb,
            Err(err) => {
                log::warn!("PRE-FETCH at lba {}: {}", lba, err);
                return;
            }
        };
        let mut cmd = Command::new(cdb, SgFlags::empty(), shared.next_pack_id());
        match adapter::run_blocking(shared, pt, &mut cmd, self.coll.plan.output.v4) {
            Ok(done) if done.is_good() => {}
            Ok(done) => log::warn!("PRE-FETCH at lba {}: {}", lba, done.describe()),
            Err(err) => log::warn!("PRE-FETCH at lba {} failed - {}", lba, err),
        }
    }

    /// WRITE (or VERIFY) one segment to the pass-through output, starting
    /// with the split part `first_part`
    fn pt_write(
        &mut self,
        done: &ReadDone,
        guard: MutexGuard<'_, ()>,
        first_part: usize,
    ) -> Result<(), Error> {
        let coll = self.coll;
        let plan = &coll.plan;
        let shared = &coll.shared;
        let side = &plan.output;
        let pt = match &self.out_pt {
            Some(pt) => Arc::clone(pt),
            None => bail!("worker {}: no output handle", self.id),
        };

        let bs = plan.bs;
        let seg = done.seg;
        let wblocks = ((done.bytes + bs - 1) / bs) as u32;
        let len = wblocks as usize * bs;
        let use_share = done.shared_data && !done.zero_filled;

        let mut flags = self.write_flags();
        let mut data_addr = 0;
        if use_share {
            flags |= SgFlags::SHARE;
        } else {
            if done.bytes < len {
                // last block of the input was partial
                self.buffer.as_mut_slice()[done.bytes..len].fill(0);
            }
            if let Some(map) = self.out_map.as_mut() {
                let src = match &self.in_map {
                    Some(in_map) if !done.zero_filled => &in_map.as_slice()[..len],
                    _ => &self.buffer.as_slice()[..len],
                };
                map.as_mut_slice()[..len].copy_from_slice(src);
                flags |= SgFlags::MMAP_IO;
            } else {
                data_addr = self.user_addr(done);
            }
        }

        if plan.prefetch && first_part == 0 {
            self.prefetch(&*pt, seg.oblk, wblocks);
        }

        let (op, what) = if plan.verify {
            (RwOp::Verify, "VERIFY")
        } else {
            (RwOp::Write, "WRITE")
        };
        let dio = flags.contains(SgFlags::DIRECT_IO);
        let parts = split_parts(wblocks, plan.ofsplit);
        let mut held = Some(guard);

        for (i, &(offset, blocks)) in parts.iter().enumerate().skip(first_part) {
            let mut part_flags = flags;
            if use_share && i == 0 && parts.len() > 1 {
                part_flags |= SgFlags::KEEP_SHARE;
            }
            let lba = seg.oblk + offset as u64;
            let cdb = build_rw_cdb(side.cdb_size, op, lba, blocks, side.fua, side.dpo)?;
            let offset_bytes = offset as usize * bs;
            let part_len = blocks as usize * bs;

            let mut retries = 0;
            loop {
                let guard = match held.take() {
                    Some(guard) => guard,
                    None => lock(&shared.out_mutex),
                };
                let mut cmd = Command::new(cdb.clone(), part_flags, shared.next_pack_id());
                if data_addr != 0 {
                    if side.v4 {
                        cmd.set_dout(data_addr, part_len);
                        if offset > 0 {
                            cmd.set_dout_offset(offset_bytes as u32);
                        }
                    } else {
                        cmd.set_dout(data_addr + offset_bytes as u64, part_len);
                    }
                } else if offset > 0 {
                    // offset into the shared reservation or the mapped buffer
                    cmd.set_dout_offset(offset_bytes as u32);
                }
                let completion = self.execute(&*pt, &mut cmd, side.v4, guard)?;

                match self.verdict(what, lba, &completion, dio, false, &mut retries) {
                    Verdict::Retry => continue,
                    Verdict::Failed => return Ok(()),
                    Verdict::Done | Verdict::ZeroFill => break,
                }
            }
        }

        self.account_write((done.bytes / bs) as u64, done.bytes % bs != 0);
        Ok(())
    }

    fn run_swait(&mut self) -> Result<(), Error> {
        while self.swait_segment()? {}
        Ok(())
    }

    /// READ and WRITE of one segment submitted back to back, the WRITE
    /// picks up the shared reservation once the READ finished
    fn swait_segment(&mut self) -> Result<bool, Error> {
        let coll = self.coll;
        let plan = &coll.plan;
        let shared = &coll.shared;
        let (in_pt, out_pt) = match (&self.in_pt, &self.out_pt) {
            (Some(input), Some(output)) => (Arc::clone(input), Arc::clone(output)),
            _ => bail!("worker {}: swait needs two pass-through handles", self.id),
        };

        let mut held = Some(lock(&shared.in_mutex));
        if shared.stopped() {
            return Ok(false);
        }
        let seg = match shared
            .distributor
            .next(plan.bpt, plan.total, coll.opts.skip, coll.opts.seek)
        {
            Some(seg) => seg,
            None => return Ok(false),
        };

        let len = seg.blocks as usize * plan.bs;
        let parts = split_parts(seg.blocks, plan.ofsplit);
        let (op, what) = if plan.verify {
            (RwOp::Verify, "VERIFY")
        } else {
            (RwOp::Write, "WRITE")
        };
        let read_cdb = build_rw_cdb(
            plan.input.cdb_size,
            RwOp::Read,
            seg.iblk,
            seg.blocks,
            plan.input.fua,
            plan.input.dpo,
        )?;
        let write_cdb = build_rw_cdb(
            plan.output.cdb_size,
            op,
            seg.oblk,
            parts[0].1,
            plan.output.fua,
            plan.output.dpo,
        )?;
        let read_flags = self.read_flags();
        let mut write_flags = self.write_flags() | SgFlags::SHARE;
        if parts.len() > 1 {
            write_flags |= SgFlags::KEEP_SHARE;
        }

        let mut retries = 0;
        loop {
            let guard = match held.take() {
                Some(guard) => guard,
                None => lock(&shared.in_mutex),
            };
            let id = shared.mono_swait_id.fetch_add(1, Ordering::SeqCst);
            let mut read = Command::new(read_cdb.clone(), read_flags, 2 * id);
            let mut write = Command::new(write_cdb.clone(), write_flags, 2 * id + 1);

            adapter::submit(shared, &*in_pt, &mut read.hdr)?;
            if let Err(err) = adapter::submit(shared, &*out_pt, &mut write.hdr) {
                if let Err(cleanup) = adapter::receive(&*in_pt, &mut read.hdr) {
                    log::warn!(
                        "worker {}: collecting READ pack id {} failed - {}",
                        self.id,
                        read.pack_id(),
                        cleanup
                    );
                }
                return Err(err);
            }
            drop(guard);
            self.maybe_abort(&*in_pt, &read)?;

            adapter::receive(&*in_pt, &mut read.hdr)?;
            adapter::receive(&*out_pt, &mut write.hdr)?;
            let read_done = read.completion();
            let write_done = write.completion();

            let dio = read_flags.contains(SgFlags::DIRECT_IO);
            match self.verdict("READ", seg.iblk, &read_done, dio, true, &mut retries) {
                // the WRITE of this pair carried stale data, redo both
                Verdict::Retry => continue,
                Verdict::Failed => return Ok(false),
                Verdict::ZeroFill => {
                    self.buffer.as_mut_slice()[..len].fill(0);
                    let mut done = self.account_read(seg, len);
                    done.zero_filled = true;
                    let guard = lock(&shared.out_mutex);
                    self.pt_write(&done, guard, 0)?;
                    return Ok(!shared.stopped());
                }
                Verdict::Done => {}
            }

            let mut done = self.account_read(seg, len);
            done.shared_data = true;

            let dio = write_flags.contains(SgFlags::DIRECT_IO);
            let mut write_retries = 0;
            let next_part = match self.verdict(what, seg.oblk, &write_done, dio, false, &mut write_retries) {
                Verdict::Done | Verdict::ZeroFill => 1,
                Verdict::Retry => 0,
                Verdict::Failed => return Ok(false),
            };
            if next_part < parts.len() {
                let guard = lock(&shared.out_mutex);
                self.pt_write(&done, guard, next_part)?;
            } else {
                self.account_write(seg.blocks as u64, false);
            }
            return Ok(!shared.stopped());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_split() {
        assert_eq!(split_parts(128, 0), vec![(0, 128)]);
        assert_eq!(split_parts(16, 4), vec![(0, 4), (4, 12)]);
        // a short last segment may not need a second part
        assert_eq!(split_parts(3, 4), vec![(0, 3)]);
        assert_eq!(split_parts(4, 4), vec![(0, 4)]);
    }
}
