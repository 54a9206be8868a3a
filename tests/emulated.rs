use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};

use sg_pt::cdb::{READ_10, WRITE_10};
use sg_pt::emulate::{EmulatedDisk, TraceEntry};
use sg_pt::SgFlags;

use sgh_dd::collection::Collection;
use sgh_dd::error::DdError;
use sgh_dd::stats::Stats;
use sgh_dd::{Invocation, Options};

const BS: u32 = 512;

fn opts(args: &[&str]) -> Result<Options, Error> {
    match Options::parse_args(args)? {
        Invocation::Run(opts) => Ok(*opts),
        _ => bail!("expected a copy invocation"),
    }
}

fn pattern(blocks: u64) -> Vec<u8> {
    (0..blocks * BS as u64).map(|i| (i % 251) as u8).collect()
}

fn disks(blocks: u64) -> (EmulatedDisk, EmulatedDisk) {
    (
        EmulatedDisk::with_data(BS, pattern(blocks)),
        EmulatedDisk::new(BS, blocks),
    )
}

fn collection(src: &EmulatedDisk, dst: &EmulatedDisk, args: &[&str]) -> Result<Collection, Error> {
    Collection::with_pass_through(
        opts(args)?,
        Some(Arc::new(src.opener("src"))),
        Some(Arc::new(dst.opener("dst"))),
    )
}

fn copy(src: &EmulatedDisk, dst: &EmulatedDisk, args: &[&str]) -> Result<Stats, Error> {
    let coll = collection(src, dst, args)?;
    sgh_dd::run(&coll)
}

fn opcode(disk: &EmulatedDisk, opcode: u8) -> Vec<TraceEntry> {
    disk.trace().into_iter().filter(|t| t.opcode == opcode).collect()
}

/// Every WRITE handed out with its READ is the odd pack id right after it
fn assert_paired(reads: &[TraceEntry], writes: &[&TraceEntry]) {
    assert!(!writes.is_empty());
    for write in writes {
        assert_eq!(write.pack_id % 2, 1, "{:?}", write);
        assert!(write.flags.contains(SgFlags::SHARE), "{:?}", write);
        let read = reads.iter().find(|r| r.pack_id == write.pack_id - 1);
        match read {
            Some(read) => assert_eq!(read.lba, write.lba),
            None => panic!("no READ for {:?}", write),
        }
    }
}

#[test]
fn shared_copy() -> Result<(), Error> {
    let (src, dst) = disks(1024);
    let stats = copy(&src, &dst, &["bpt=32", "thr=4"])?;

    assert_eq!(stats.exit_status, 0);
    assert_eq!(stats.records_in_full, 1024);
    assert_eq!(stats.records_out_full, 1024);
    assert_eq!(stats.in_remaining, 0);
    assert_eq!(stats.out_remaining, 0);
    assert!(src.data() == dst.data());

    let writes: Vec<_> = dst.trace().into_iter().filter(|t| t.opcode == WRITE_10).collect();
    assert_eq!(writes.len(), 1024 / 32);
    assert!(writes.iter().all(|t| t.flags.contains(SgFlags::SHARE)));
    Ok(())
}

#[test]
fn unshared_and_v3_copies() -> Result<(), Error> {
    for args in [
        &["bpt=16", "thr=3", "noshare=1"][..],
        &["bpt=16", "thr=3", "iflag=v3", "oflag=v3"][..],
        &["bpt=16", "thr=2", "iflag=dio", "oflag=dio", "noshare=1"][..],
    ] {
        let (src, dst) = disks(300);
        let stats = copy(&src, &dst, args)?;
        assert_eq!(stats.exit_status, 0, "{:?}", args);
        assert_eq!(stats.records_out_full, 300, "{:?}", args);
        assert!(src.data() == dst.data(), "{:?}", args);
        assert!(dst.trace().iter().all(|t| !t.flags.contains(SgFlags::SHARE)));
    }
    Ok(())
}

#[test]
fn verify_detects_miscompare() -> Result<(), Error> {
    let data = pattern(256);
    let src = EmulatedDisk::with_data(BS, data.clone());
    let dst = EmulatedDisk::with_data(BS, data.clone());
    let stats = copy(&src, &dst, &["bpt=16", "thr=2", "--verify"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(stats.verify);
    assert_eq!(stats.miscompares, 0);
    assert!(stats.to_string().contains("256+0 records verified"));

    let mut other = data;
    other[100 * BS as usize + 7] ^= 0xff;
    let dst = EmulatedDisk::with_data(BS, other);
    let stats = copy(&src, &dst, &["bpt=16", "thr=2", "--verify"])?;
    assert_eq!(stats.exit_status, 14);
    assert!(stats.miscompares >= 1);
    Ok(())
}

#[test]
fn split_writes_reuse_the_reservation() -> Result<(), Error> {
    let (src, dst) = disks(64);
    let stats = copy(&src, &dst, &["bpt=16", "ofsplit=4", "thr=1"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());

    let writes: Vec<_> = dst.trace().into_iter().filter(|t| t.opcode == WRITE_10).collect();
    assert_eq!(writes.len(), 8);
    let (first, second) = (&writes[0], &writes[1]);
    assert_eq!((first.lba, first.blocks), (0, 4));
    assert!(first.flags.contains(SgFlags::KEEP_SHARE));
    assert_eq!((second.lba, second.blocks), (4, 12));
    assert!(second.flags.contains(SgFlags::DOUT_OFFSET));
    assert_eq!(second.spare_in, 4 * BS);
    Ok(())
}

#[test]
fn swait_pairs_read_and_write() -> Result<(), Error> {
    let (src, dst) = disks(256);
    let stats = copy(&src, &dst, &["bpt=16", "thr=2", "iflag=swait"])?;
    assert_eq!(stats.exit_status, 0);
    assert_eq!(stats.records_out_full, 256);
    assert!(src.data() == dst.data());

    let reads = opcode(&src, READ_10);
    let writes = opcode(&dst, WRITE_10);
    assert_eq!(writes.len(), 256 / 16);
    assert!(reads.iter().all(|r| r.pack_id % 2 == 0));
    assert_paired(&reads, &writes.iter().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn swait_with_split_writes() -> Result<(), Error> {
    let (src, dst) = disks(128);
    let stats = copy(&src, &dst, &["bpt=16", "ofsplit=4", "thr=2", "oflag=swait"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());

    let reads = opcode(&src, READ_10);
    let writes = opcode(&dst, WRITE_10);
    assert_eq!(writes.len(), 2 * 128 / 16);

    let (first, rest): (Vec<_>, Vec<_>) = writes
        .iter()
        .partition(|w| w.flags.contains(SgFlags::KEEP_SHARE));
    assert_eq!(first.len(), 128 / 16);
    assert!(first.iter().all(|w| w.blocks == 4));
    assert_paired(&reads, &first);
    for write in rest {
        assert!(write.flags.contains(SgFlags::DOUT_OFFSET), "{:?}", write);
        assert_eq!(write.spare_in, 4 * BS);
        assert_eq!(write.blocks, 12);
    }
    Ok(())
}

#[test]
fn swait_zero_fills_with_coe() -> Result<(), Error> {
    let (src, dst) = disks(128);
    src.inject_medium_error(40);
    let stats = copy(&src, &dst, &["bpt=16", "thr=1", "coe=1", "iflag=swait"])?;
    assert_eq!(stats.exit_status, 0);

    let bs = BS as usize;
    let (want, got) = (src.data(), dst.data());
    assert!(got[32 * bs..48 * bs].iter().all(|b| *b == 0));
    assert!(got[..32 * bs] == want[..32 * bs]);
    assert!(got[48 * bs..] == want[48 * bs..]);
    Ok(())
}

#[test]
fn mrq_shared_variable_blocking() -> Result<(), Error> {
    let (src, dst) = disks(256);
    let stats = copy(&src, &dst, &["bpt=8", "mrq=8", "thr=1"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());

    // four segments, a READ and a WRITE each, per batch
    assert_eq!(stats.mrq_batches, 8);
    assert_eq!(src.batch_count(), 8);
    assert!(dst.trace().iter().all(|t| t.batch.is_some()));
    Ok(())
}

#[test]
fn mrq_shared_with_split_writes() -> Result<(), Error> {
    let (src, dst) = disks(64);
    let stats = copy(&src, &dst, &["bpt=16", "mrq=6", "ofsplit=4", "thr=1"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());

    // a READ and two WRITEs per segment, two segments per batch
    assert_eq!(stats.mrq_batches, 2);
    let writes = opcode(&dst, WRITE_10);
    assert_eq!(writes.len(), 8);
    assert!(writes.iter().all(|w| w.batch.is_some()));
    for pair in writes.chunks(2) {
        let (first, second) = (&pair[0], &pair[1]);
        assert!(first.flags.contains(SgFlags::KEEP_SHARE));
        assert_eq!(first.blocks, 4);
        assert!(second.flags.contains(SgFlags::DOUT_OFFSET));
        assert_eq!(second.spare_in, 4 * BS);
        assert_eq!((second.lba, second.blocks), (first.lba + 4, 12));
        assert_eq!(first.batch, second.batch);
    }

    let (src, dst) = disks(64);
    match collection(&src, &dst, &["bpt=16", "mrq=4", "ofsplit=4", "thr=1"]) {
        Err(err) => assert_eq!(DdError::exit_code_of(&err), 31),
        Ok(_) => bail!("mrq=4 with ofsplit was accepted"),
    }
    Ok(())
}

#[test]
fn mrq_unit_attentions_are_reissued() -> Result<(), Error> {
    let (src, dst) = disks(256);
    let coll = collection(&src, &dst, &["bpt=8", "mrq=8", "thr=1"])?;
    src.inject_unit_attentions(2);
    let stats = sgh_dd::run(&coll)?;
    assert_eq!(stats.exit_status, 0);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.records_out_full, 256);
    assert!(src.data() == dst.data());
    Ok(())
}

#[test]
fn mrq_split_batches() -> Result<(), Error> {
    let (src, dst) = disks(256);
    let stats = copy(&src, &dst, &["bpt=8", "mrq=8", "thr=1", "noshare=1"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());
    assert_eq!(src.batch_count(), 8);
    assert_eq!(dst.batch_count(), 8);
    assert!(src
        .trace()
        .iter()
        .filter(|t| t.opcode == READ_10)
        .all(|t| t.batch.is_some()));
    Ok(())
}

#[test]
fn mrq_submit_and_poll() -> Result<(), Error> {
    let (src, dst) = disks(256);
    let stats = copy(&src, &dst, &["bpt=8", "mrq=8", "thr=2", "iflag=mrq_immed"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());
    assert!(stats.num_waiting_calls > 0);

    let (src, dst) = disks(256);
    let stats = copy(
        &src,
        &dst,
        &["bpt=8", "mrq=8", "thr=2", "iflag=mrq_immed,no_waitq"],
    )?;
    assert_eq!(stats.exit_status, 0);
    assert!(src.data() == dst.data());
    Ok(())
}

#[test]
fn mrq_reads_to_null() -> Result<(), Error> {
    let src = EmulatedDisk::with_data(BS, pattern(64));
    let coll = Collection::with_pass_through(
        opts(&["of=/dev/null", "bpt=8", "mrq=4", "thr=1"])?,
        Some(Arc::new(src.opener("src"))),
        None,
    )?;
    let stats = sgh_dd::run(&coll)?;
    assert_eq!(stats.exit_status, 0);
    assert_eq!(stats.mrq_batches, 2);
    assert_eq!(stats.records_in_full, 64);
    assert_eq!(stats.records_out_full, 64);
    Ok(())
}

#[test]
fn mrq_writes_from_file() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("input");
    let data = pattern(128);
    std::fs::write(&path, &data)?;

    let dst = EmulatedDisk::new(BS, 128);
    let input = format!("if={}", path.display());
    let coll = Collection::with_pass_through(
        opts(&[input.as_str(), "bpt=16", "mrq=o,4", "thr=2"])?,
        None,
        Some(Arc::new(dst.opener("dst"))),
    )?;
    let stats = sgh_dd::run(&coll)?;
    assert_eq!(stats.exit_status, 0);
    assert_eq!(stats.records_out_full, 128);
    assert!(dst.data() == data);
    assert!(dst.batch_count() >= 2);
    Ok(())
}

#[test]
fn medium_error_with_and_without_coe() -> Result<(), Error> {
    let (src, dst) = disks(128);
    src.inject_medium_error(40);
    let stats = copy(&src, &dst, &["bpt=16", "thr=2", "coe=1", "noshare=1"])?;
    assert_eq!(stats.exit_status, 0);

    let bs = BS as usize;
    let (want, got) = (src.data(), dst.data());
    assert!(got[32 * bs..48 * bs].iter().all(|b| *b == 0));
    assert!(got[..32 * bs] == want[..32 * bs]);
    assert!(got[48 * bs..] == want[48 * bs..]);

    let (src, dst) = disks(128);
    src.inject_medium_error(40);
    let stats = copy(&src, &dst, &["bpt=16", "thr=2"])?;
    assert_eq!(stats.exit_status, 3);
    assert!(stats.out_remaining > 0);
    Ok(())
}

#[test]
fn unit_attentions_are_retried() -> Result<(), Error> {
    let (src, dst) = disks(128);
    let coll = collection(&src, &dst, &["bpt=16", "thr=1"])?;
    src.inject_unit_attentions(3);
    let stats = sgh_dd::run(&coll)?;
    assert_eq!(stats.exit_status, 0);
    assert_eq!(stats.retries, 3);
    assert!(src.data() == dst.data());
    Ok(())
}

#[test]
fn aborted_commands_are_resubmitted() -> Result<(), Error> {
    let (src, dst) = disks(128);
    src.set_hold_commands(true);
    dst.set_hold_commands(true);
    let stats = copy(&src, &dst, &["bpt=8", "thr=2", "ae=2", "noshare=1"])?;
    assert_eq!(stats.exit_status, 0);
    assert!(stats.abort_requests > 0);
    assert!(stats.abort_successes > 0);
    assert!(src.data() == dst.data());
    Ok(())
}

#[test]
fn interrupt_stops_the_copy() -> Result<(), Error> {
    let (src, dst) = disks(2048);
    src.set_command_delay(Some(Duration::from_millis(5)));
    let coll = collection(&src, &dst, &["bpt=8", "thr=2"])?;

    let stats = std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(30));
            coll.shared.request_interrupt();
        });
        sgh_dd::run(&coll)
    })?;
    assert_eq!(stats.exit_status, 130);
    assert!(stats.out_remaining > 0);
    assert!(stats.records_out_full < 2048);
    Ok(())
}
