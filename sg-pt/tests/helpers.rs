use anyhow::Error;

use sg_pt::cdb::{build_rw_cdb, RwOp, SYNCHRONIZE_CACHE_10};
use sg_pt::emulate::EmulatedDisk;
use sg_pt::{
    read_capacity, synchronize_cache, AlignedBuffer, PassThrough, PassThroughOpener, SenseCategory,
    SgIoV4,
};

#[test]
fn capacity_and_cache_sync() -> Result<(), Error> {
    let disk = EmulatedDisk::new(4096, 1000);
    let pt = disk.opener("emulated").open()?;

    let capacity = read_capacity(&*pt)?;
    assert_eq!(capacity.num_blocks, 1000);
    assert_eq!(capacity.block_length, 4096);

    synchronize_cache(&*pt)?;
    assert!(disk
        .trace()
        .iter()
        .any(|t| t.opcode == SYNCHRONIZE_CACHE_10));
    Ok(())
}

#[test]
fn write_beyond_capacity_is_rejected() -> Result<(), Error> {
    let disk = EmulatedDisk::new(512, 8);
    let pt = disk.opener("emulated").open()?;

    let buffer = AlignedBuffer::new(512 * 2)?;
    let cdb = build_rw_cdb(10, RwOp::Write, 7, 2, false, false)?;
    let mut sense = [0u8; 32];
    let mut hdr = SgIoV4::new();
    hdr.request = cdb.as_ptr() as u64;
    hdr.request_len = cdb.len() as u32;
    hdr.response = sense.as_mut_ptr() as u64;
    hdr.max_response_len = sense.len() as u32;
    hdr.dout_xferp = buffer.addr();
    hdr.dout_xfer_len = buffer.len() as u32;
    pt.sg_io_v4(&mut hdr)?;

    let category = sg_pt::classify(
        hdr.device_status,
        hdr.transport_status,
        hdr.driver_status,
        &sense[..hdr.response_len as usize],
    );
    assert_ne!(category, SenseCategory::Clean);
    Ok(())
}
