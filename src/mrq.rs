//! Multiple requests batching
//!
//! With `mrq=N` a worker queues READ and WRITE requests of several
//! segments and hands them to the driver in one control object. The
//! batch either runs on one fd (shared variable blocking, or a single
//! pass-through side) or is split into a READ batch on the input fd
//! followed by a WRITE batch on the output fd.
//!
//! Requests that come back with a unit attention or were aborted, and
//! the requests a stopped batch never issued, are issued again in a
//! follow-up batch (for a shared reservation together with the READ of
//! their segment). Any other failure stops the copy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use nix::errno::Errno;
use rand::Rng;

use sg_pt::cdb::{build_rw_cdb, RwOp};
use sg_pt::sg_io::SG_MAX_CDB_SIZE;
use sg_pt::{AlignedBuffer, PassThrough, SenseCategory, SgFlags, SgIoV4};

use crate::adapter::{self, ioctl_error, Command, MAX_RETRIES};
use crate::collection::{lock, MrqMode, MrqPlan};
use crate::distributor::Segment;
use crate::endpoint::Endpoint;
use crate::error::DdError;
use crate::stats::Counters;
use crate::worker::{split_parts, Verdict, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Read,
    Write,
}

impl ItemKind {
    fn as_str(self) -> &'static str {
        match self {
            ItemKind::Read => "READ",
            ItemKind::Write => "WRITE",
        }
    }
}

/// One request of a batch
struct Item {
    cmd: Command,
    /// index into [Batch::segs]
    seg: usize,
    kind: ItemKind,
    lba: u64,
    /// payload bytes, the last WRITE of a short segment ends in a partial block
    bytes: usize,
    /// completed and accounted, a reissue only recreates side effects
    settled: bool,
}

/// Outcome of settling one issued batch
#[derive(Default)]
struct Redo {
    /// segments with requests to issue again
    segs: Vec<usize>,
    /// category of the last retryable failure
    category: Option<SenseCategory>,
}

struct SegState {
    seg: Segment,
    read_ok: bool,
}

/// Move the requests flagged to run on the other fd into their own array
///
/// The order within both arrays is kept, the moved requests lose the
/// DO_ON_OTHER flag.
fn split_def_arr(items: Vec<Item>) -> (Vec<Item>, Vec<Item>) {
    let (mut other, this): (Vec<Item>, Vec<Item>) = items
        .into_iter()
        .partition(|item| item.cmd.flags().contains(SgFlags::DO_ON_OTHER));
    for item in other.iter_mut() {
        let flags = item.cmd.flags() - SgFlags::DO_ON_OTHER;
        item.cmd.hdr.set_sg_flags(flags);
    }
    (this, other)
}

struct Batch {
    segs: Vec<SegState>,
    items: Vec<Item>,
    /// one data buffer per queued segment, reused across batches
    pool: Vec<AlignedBuffer>,
    /// batches issued by this worker
    issued: u64,
}

pub(crate) fn run(worker: &mut Worker<'_>) -> Result<(), Error> {
    let mrq = match worker.coll.plan.mrq {
        Some(mrq) => mrq,
        None => bail!("worker {}: multiple requests not configured", worker.id),
    };
    let mut batch = Batch {
        segs: Vec::new(),
        items: Vec::new(),
        pool: Vec::new(),
        issued: 0,
    };

    while batch.queue_segment(worker, &mrq)? {
        if batch.items.len() >= mrq.nmrqs {
            batch.flush(worker, &mrq)?;
        }
    }
    batch.flush(worker, &mrq)
}

/// READ one segment with a single command (input side not batched)
fn read_single(worker: &Worker<'_>, seg: Segment, buf: &mut AlignedBuffer) -> Result<bool, Error> {
    let coll = worker.coll;
    let plan = &coll.plan;
    let shared = &coll.shared;
    let pt = match &worker.in_pt {
        Some(pt) => Arc::clone(pt),
        None => bail!("worker {}: no input handle", worker.id),
    };
    let side = &plan.input;
    let len = seg.blocks as usize * plan.bs;
    let cdb = build_rw_cdb(side.cdb_size, RwOp::Read, seg.iblk, seg.blocks, side.fua, side.dpo)?;
    let flags = worker.read_flags();

    let mut retries = 0;
    loop {
        let mut cmd = Command::new(cdb.clone(), flags, shared.next_pack_id());
        cmd.set_din(buf.addr(), len);
        let done = adapter::run_blocking(shared, &*pt, &mut cmd, side.v4)?;
        let dio = flags.contains(SgFlags::DIRECT_IO);
        match worker.verdict("READ", seg.iblk, &done, dio, true, &mut retries) {
            Verdict::Retry => continue,
            Verdict::Failed => return Ok(false),
            Verdict::ZeroFill => {
                buf.as_mut_slice()[..len].fill(0);
                return Ok(true);
            }
            Verdict::Done => return Ok(true),
        }
    }
}

/// Abort the batch `mrq_id` from a helper thread while `op` runs
fn with_abort<T>(
    pt: &dyn PassThrough,
    counters: &Counters,
    mrq_id: i32,
    enabled: bool,
    op: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    if !enabled {
        return op();
    }
    std::thread::scope(|s| {
        let aborter = s.spawn(move || {
            let delay = rand::thread_rng().gen_range(5..=500);
            std::thread::sleep(Duration::from_micros(delay));

            let mut hdr = SgIoV4::new();
            hdr.set_sg_flags(SgFlags::MULTIPLE_REQS);
            hdr.set_pack_id(mrq_id);
            Counters::inc(&counters.mrq_abort_req);
            match adapter::abort(pt, &hdr) {
                Ok(true) => Counters::inc(&counters.mrq_abort_success),
                Ok(false) => log::debug!("mrq {} already completed, nothing to abort", mrq_id),
                Err(err) => log::warn!("aborting mrq {} failed - {}", mrq_id, err),
            }
        });
        let res = op();
        if aborter.join().is_err() {
            log::warn!("mrq abort thread paniced");
        }
        res
    })
}

impl Batch {
    fn buffer(&mut self, idx: usize, len: usize) -> Result<&mut AlignedBuffer, Error> {
        while self.pool.len() <= idx {
            let buf = AlignedBuffer::new(len)
                .map_err(|err| DdError::OutOfMemory(format!("mrq buffer - {}", err)))?;
            self.pool.push(buf);
        }
        Ok(&mut self.pool[idx])
    }

    /// Take the next segment and queue its requests, returns false once
    /// there is nothing more to queue
    fn queue_segment(&mut self, worker: &mut Worker<'_>, mrq: &MrqPlan) -> Result<bool, Error> {
        let coll = worker.coll;
        let plan = &coll.plan;
        let shared = &coll.shared;
        let bs = plan.bs;

        let guard = lock(&shared.in_mutex);
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
        let idx = self.segs.len();
        let len = seg.blocks as usize * bs;
        let buf_addr = if mrq.svb {
            0
        } else {
            self.buffer(idx, bs * plan.bpt as usize)?.addr()
        };

        let mut bytes = len;
        if mrq.reads {
            drop(guard);
            let side = &plan.input;
            let flags = worker.read_flags();
            let cdb = build_rw_cdb(side.cdb_size, RwOp::Read, seg.iblk, seg.blocks, side.fua, side.dpo)?;
            let mut cmd = Command::new(cdb, flags, shared.next_pack_id());
            if !flags.intersects(SgFlags::NO_DXFER | SgFlags::MMAP_IO) {
                cmd.set_din(buf_addr, len);
            }
            self.items.push(Item {
                cmd,
                seg: idx,
                kind: ItemKind::Read,
                lba: seg.iblk,
                bytes: len,
                settled: false,
            });
        } else {
            // READ half right away, only the WRITEs are deferred
            let ok = match &coll.input {
                Endpoint::File(file) => {
                    let res = file.read_at(&mut self.pool[idx].as_mut_slice()[..len], seg.iblk * bs as u64);
                    drop(guard);
                    bytes = res.map_err(DdError::File)?;
                    true
                }
                Endpoint::PassThrough(_) => {
                    drop(guard);
                    read_single(worker, seg, &mut self.pool[idx])?
                }
                Endpoint::Null => {
                    drop(guard);
                    bytes = 0;
                    true
                }
            };
            if !ok {
                return Ok(false);
            }

            let full = (bytes / bs) as u64;
            let partial = bytes % bs != 0;
            Counters::add(&shared.counters.in_full, full);
            if partial {
                Counters::inc(&shared.counters.in_partial);
            }
            shared.sub_in_rem(full as i64 + partial as i64);
            if bytes < len {
                log::debug!("worker {}: short read at block {}, {} bytes", worker.id, seg.iblk, bytes);
                shared.set_in_stop();
            }
            if bytes == 0 {
                return Ok(false);
            }
            let padded = (full as usize + partial as usize) * bs;
            self.pool[idx].as_mut_slice()[bytes..padded].fill(0);
        }

        if mrq.writes {
            let side = &plan.output;
            let op = if plan.verify { RwOp::Verify } else { RwOp::Write };
            let wblocks = ((bytes + bs - 1) / bs) as u32;
            let parts = split_parts(wblocks, plan.ofsplit);

            let mut flags = worker.write_flags();
            if mrq.svb {
                flags |= SgFlags::SHARE | SgFlags::DO_ON_OTHER;
            } else if mrq.is_split() {
                flags |= SgFlags::DO_ON_OTHER;
            }
            for (i, &(offset, blocks)) in parts.iter().enumerate() {
                let mut part_flags = flags;
                if mrq.svb && i == 0 && parts.len() > 1 {
                    part_flags |= SgFlags::KEEP_SHARE;
                }
                let lba = seg.oblk + offset as u64;
                let cdb = build_rw_cdb(side.cdb_size, op, lba, blocks, side.fua, side.dpo)?;
                let mut cmd = Command::new(cdb, part_flags, shared.next_pack_id());
                let offset_bytes = offset as usize * bs;
                if !mrq.svb {
                    cmd.set_dout(buf_addr, blocks as usize * bs);
                }
                if offset > 0 {
                    cmd.set_dout_offset(offset_bytes as u32);
                }
                self.items.push(Item {
                    cmd,
                    seg: idx,
                    kind: ItemKind::Write,
                    lba,
                    bytes: (bytes - offset_bytes).min(blocks as usize * bs),
                    settled: false,
                });
            }
        }

        self.segs.push(SegState {
            seg,
            read_ok: !mrq.reads,
        });
        Ok(bytes == len)
    }

    /// Issue everything queued and settle the counters
    fn flush(&mut self, worker: &mut Worker<'_>, mrq: &MrqPlan) -> Result<(), Error> {
        let shared = &worker.coll.shared;
        let items = std::mem::take(&mut self.items);

        if !items.is_empty() && !shared.out_stop() {
            let in_pt = worker.in_pt.clone();
            let out_pt = worker.out_pt.clone();

            if mrq.is_split() {
                let (reads, mut writes) = split_def_arr(items);
                let in_pt = match &in_pt {
                    Some(pt) => pt,
                    None => bail!("worker {}: no input handle", worker.id),
                };
                self.issue(worker, mrq, &**in_pt, reads)?;

                writes.retain(|item| self.segs[item.seg].read_ok);
                if !writes.is_empty() && !shared.out_stop() {
                    let out_pt = match &out_pt {
                        Some(pt) => pt,
                        None => bail!("worker {}: no output handle", worker.id),
                    };
                    self.issue(worker, mrq, &**out_pt, writes)?;
                }
            } else {
                let pt = match (mrq.reads, &in_pt, &out_pt) {
                    (true, Some(pt), _) => pt,
                    (false, _, Some(pt)) => pt,
                    _ => bail!("worker {}: no handle for the batch", worker.id),
                };
                self.issue(worker, mrq, &**pt, items)?;
            }
        }

        self.segs.clear();
        Ok(())
    }

    /// Submit `items` on `pt` until every request settled, reissuing the
    /// segments with retryable failures
    fn issue(
        &mut self,
        worker: &Worker<'_>,
        mrq: &MrqPlan,
        pt: &dyn PassThrough,
        mut items: Vec<Item>,
    ) -> Result<(), Error> {
        let shared = &worker.coll.shared;
        let mut rounds = 0;
        loop {
            let issued = self.submit(worker, mrq, pt, &mut items)?;
            let redo = self.settle(worker, mrq, &mut items, issued);
            if redo.segs.is_empty() || shared.stopped() {
                return Ok(());
            }

            rounds += 1;
            if rounds > MAX_RETRIES {
                let category = redo.category.unwrap_or(SenseCategory::Other);
                log::error!(
                    "worker {}: mrq requests still failing after {} retries: {}",
                    worker.id,
                    MAX_RETRIES,
                    category
                );
                shared.fail(category.exit_code());
                return Ok(());
            }

            items.retain(|item| redo.segs.contains(&item.seg));
            for item in items.iter_mut() {
                item.cmd.rearm(shared.next_pack_id());
            }
            log::debug!(
                "worker {}: reissuing {} requests of {} segments",
                worker.id,
                items.len(),
                redo.segs.len()
            );
        }
    }

    /// Hand `items` to the driver, returns how many of them were issued
    fn submit(
        &mut self,
        worker: &Worker<'_>,
        mrq: &MrqPlan,
        pt: &dyn PassThrough,
        items: &mut [Item],
    ) -> Result<usize, Error> {
        let coll = worker.coll;
        let shared = &coll.shared;
        let counters = &shared.counters;
        let count = items.len();

        let mut arr: Vec<SgIoV4> = items.iter().map(|item| item.cmd.hdr).collect();
        let mut packed = Vec::new();
        if mrq.pack_cmds {
            packed = vec![0u8; count * SG_MAX_CDB_SIZE];
            for (i, item) in items.iter().enumerate() {
                let cdb = item.cmd.cdb();
                let start = i * SG_MAX_CDB_SIZE;
                packed[start..start + cdb.len()].copy_from_slice(cdb);
                arr[i].request = 0;
            }
        }

        let mrq_id = shared
            .mono_mrq_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut flags = SgFlags::MULTIPLE_REQS;
        match mrq.mode {
            MrqMode::Blocking => flags |= SgFlags::STOP_IF,
            MrqMode::Submit => {}
            MrqMode::Waitless => flags |= SgFlags::NO_WAITQ,
        }
        if mrq.svb {
            flags |= SgFlags::SHARE;
        }

        let mut ctl = SgIoV4::new();
        ctl.set_sg_flags(flags);
        ctl.set_pack_id(mrq_id);
        ctl.dout_xferp = arr.as_ptr() as u64;
        ctl.dout_xfer_len = (count * SgIoV4::SIZE) as u32;
        if !packed.is_empty() {
            ctl.request = packed.as_ptr() as u64;
            ctl.request_len = packed.len() as u32;
        }

        self.issued += 1;
        Counters::inc(&counters.mrq_batches);
        let maen = coll.opts.maen as u64;
        let abort = maen > 0 && self.issued % maen == 0;
        log::trace!(
            "worker {}: mrq {} with {} requests ({:?})",
            worker.id,
            mrq_id,
            count,
            mrq.mode
        );

        match mrq.mode {
            MrqMode::Blocking => {
                ctl.din_xferp = arr.as_mut_ptr() as u64;
                ctl.din_xfer_len = ctl.dout_xfer_len;
                with_abort(pt, counters, mrq_id, abort, || {
                    adapter::sg_io(shared, pt, &mut ctl)
                })?;
                let issued = (ctl.info as usize).min(count);
                for (item, response) in items.iter_mut().zip(arr.iter()).take(issued) {
                    item.cmd.hdr = *response;
                }
                Ok(issued)
            }
            MrqMode::Submit | MrqMode::Waitless => {
                with_abort(pt, counters, mrq_id, abort, || {
                    adapter::submit(shared, pt, &mut ctl)
                })?;
                harvest(worker, mrq, pt, mrq_id, items)?;
                Ok(count)
            }
        }
    }

    /// Account the completed requests
    ///
    /// Unit attentions, aborted requests and requests the driver did not
    /// get to are collected for a reissue, any other failure stops the
    /// copy.
    fn settle(&mut self, worker: &Worker<'_>, mrq: &MrqPlan, items: &mut [Item], issued: usize) -> Redo {
        let coll = worker.coll;
        let shared = &coll.shared;
        let counters = &shared.counters;
        let bs = coll.plan.bs;
        let mut redo = Redo::default();

        for (i, item) in items.iter_mut().enumerate() {
            if item.settled {
                continue;
            }
            if i >= issued {
                log::debug!(
                    "mrq {} at lba {} not issued",
                    item.kind.as_str(),
                    item.lba
                );
                if !redo.segs.contains(&item.seg) {
                    redo.segs.push(item.seg);
                }
                continue;
            }
            let done = item.cmd.completion();
            if !done.is_good() {
                if done.category.is_retryable() {
                    Counters::inc(&counters.retries);
                    log::debug!(
                        "mrq {} at lba {}: {}, retrying",
                        item.kind.as_str(),
                        item.lba,
                        done.describe()
                    );
                    redo.category = Some(done.category);
                    if !redo.segs.contains(&item.seg) {
                        redo.segs.push(item.seg);
                    }
                    continue;
                }
                if done.category == SenseCategory::Miscompare {
                    Counters::inc(&counters.miscompares);
                }
                log::error!(
                    "mrq {} at lba {} failed: {}",
                    item.kind.as_str(),
                    item.lba,
                    done.describe()
                );
                shared.fail(done.category.exit_code());
                continue;
            }
            if done.category == SenseCategory::Recovered {
                log::info!("mrq {} at lba {}: {}", item.kind.as_str(), item.lba, done.describe());
            }
            if done.resid > 0 {
                Counters::add(&counters.resid_sum, done.resid as u64);
            }

            item.settled = true;
            let full = (item.bytes / bs) as u64;
            let partial = item.bytes % bs != 0;
            match item.kind {
                ItemKind::Read => {
                    self.segs[item.seg].read_ok = true;
                    Counters::add(&counters.in_full, full);
                    shared.sub_in_rem(full as i64);
                    if !mrq.writes {
                        // null sink, nothing left to do for this segment
                        worker.account_write(full, false);
                    }
                }
                ItemKind::Write => worker.account_write(full, partial),
            }
        }
        log::trace!(
            "worker {}: settled {} of {} requests for segments starting at {:?}",
            worker.id,
            issued,
            items.len(),
            self.segs.first().map(|state| state.seg.index)
        );
        redo
    }
}

/// Collect the responses of an asynchronously submitted batch
fn harvest(
    worker: &Worker<'_>,
    mrq: &MrqPlan,
    pt: &dyn PassThrough,
    mrq_id: i32,
    items: &mut [Item],
) -> Result<(), Error> {
    let counters = &worker.coll.shared.counters;
    let mut received = vec![false; items.len()];
    let mut outstanding = items.len();
    let mut responses = vec![SgIoV4::new(); items.len()];

    while outstanding > 0 {
        if mrq.mode == MrqMode::Submit {
            // wait until at least half of the outstanding requests are done
            let want = (outstanding + 1) / 2;
            loop {
                Counters::inc(&counters.num_waiting_calls);
                let waiting = pt
                    .num_waiting()
                    .map_err(|errno| ioctl_error(pt, "SG_GET_NUM_WAITING", errno))?;
                if waiting.max(0) as usize >= want {
                    break;
                }
                std::thread::sleep(Duration::from_micros(10));
            }
        }

        let mut ctl = SgIoV4::new();
        let mut flags = SgFlags::MULTIPLE_REQS;
        if mrq.mode == MrqMode::Waitless {
            flags |= SgFlags::IMMED;
        }
        ctl.set_sg_flags(flags);
        ctl.set_pack_id(mrq_id);
        ctl.din_xferp = responses.as_mut_ptr() as u64;
        ctl.din_xfer_len = (outstanding * SgIoV4::SIZE) as u32;

        match pt.receive(&mut ctl) {
            Ok(()) => {}
            Err(Errno::EAGAIN) => {
                std::thread::yield_now();
                continue;
            }
            Err(errno) => return Err(ioctl_error(pt, "SG_IORECEIVE (mrq)", errno)),
        }

        let count = (ctl.info as usize).min(outstanding);
        if count == 0 {
            std::thread::yield_now();
            continue;
        }
        for response in &responses[..count] {
            let pos = (0..items.len())
                .find(|&i| !received[i] && items[i].cmd.pack_id() == response.pack_id());
            match pos {
                Some(i) => {
                    items[i].cmd.hdr = *response;
                    received[i] = true;
                    outstanding -= 1;
                }
                None => log::warn!("mrq {}: unexpected response with pack id {}", mrq_id, response.pack_id()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(pack_id: i32, kind: ItemKind, flags: SgFlags) -> Item {
        Item {
            cmd: Command::new(vec![0u8; 10], flags, pack_id),
            seg: 0,
            kind,
            lba: 0,
            bytes: 512,
            settled: false,
        }
    }

    #[test]
    fn deferred_writes_are_moved() {
        let items = vec![
            item(1, ItemKind::Read, SgFlags::empty()),
            item(2, ItemKind::Write, SgFlags::DO_ON_OTHER),
            item(3, ItemKind::Read, SgFlags::empty()),
            item(4, ItemKind::Write, SgFlags::DO_ON_OTHER | SgFlags::DOUT_OFFSET),
        ];
        let (this, other) = split_def_arr(items);

        let ids: Vec<i32> = this.iter().map(|item| item.cmd.pack_id()).collect();
        assert_eq!(ids, vec![1, 3]);
        let ids: Vec<i32> = other.iter().map(|item| item.cmd.pack_id()).collect();
        assert_eq!(ids, vec![2, 4]);

        assert!(other
            .iter()
            .all(|item| !item.cmd.flags().contains(SgFlags::DO_ON_OTHER)));
        assert!(other[1].cmd.flags().contains(SgFlags::DOUT_OFFSET));
        assert!(other.iter().all(|item| item.kind == ItemKind::Write));
    }
}
