//! SCSI command descriptor block builder
//!
//! Lays out READ/WRITE/VERIFY(6/10/12/16), PRE-FETCH(10/16),
//! SYNCHRONIZE CACHE(10) and READ CAPACITY(10/16) exactly as
//! defined by T10 SBC.

use anyhow::{bail, Error};

pub const READ_6: u8 = 0x08;
pub const READ_10: u8 = 0x28;
pub const READ_12: u8 = 0xa8;
pub const READ_16: u8 = 0x88;
pub const WRITE_6: u8 = 0x0a;
pub const WRITE_10: u8 = 0x2a;
pub const WRITE_12: u8 = 0xaa;
pub const WRITE_16: u8 = 0x8a;
pub const VERIFY_10: u8 = 0x2f;
pub const PRE_FETCH_10: u8 = 0x34;
pub const PRE_FETCH_16: u8 = 0x90;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
pub const SAI_READ_CAPACITY_16: u8 = 0x10;

const MAX_LBA_6: u64 = 0x1f_ffff;

/// Data transfer command family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwOp {
    Read,
    Write,
    /// VERIFY with BYTCHK=1, data goes out like a WRITE
    Verify,
}

impl RwOp {
    fn opcode(self, cdb_size: usize) -> Option<u8> {
        let index = match cdb_size {
            6 => 0,
            10 => 1,
            12 => 2,
            16 => 3,
            _ => return None,
        };
        match self {
            RwOp::Read => Some([READ_6, READ_10, READ_12, READ_16][index]),
            RwOp::Write => Some([WRITE_6, WRITE_10, WRITE_12, WRITE_16][index]),
            RwOp::Verify if cdb_size == 10 => Some(VERIFY_10),
            RwOp::Verify => None,
        }
    }
}

/// Largest transfer length a READ/WRITE CDB of `cdb_size` bytes can carry
pub fn max_transfer_blocks(cdb_size: usize) -> Option<u32> {
    match cdb_size {
        6 => Some(256),
        10 => Some(0xffff),
        12 | 16 => Some(u32::MAX),
        _ => None,
    }
}

/// Build a READ, WRITE or VERIFY CDB
///
/// `fua` and `dpo` are ignored for VERIFY, which always sets BYTCHK=1.
pub fn build_rw_cdb(
    cdb_size: usize,
    op: RwOp,
    start_block: u64,
    blocks: u32,
    fua: bool,
    dpo: bool,
) -> Result<Vec<u8>, Error> {
    let opcode = match op.opcode(cdb_size) {
        Some(opcode) => opcode,
        None if op == RwOp::Verify => {
            bail!("VERIFY is only supported with 10 byte cdbs, not {}", cdb_size)
        }
        None => bail!("unsupported cdb size {} (expect 6, 10, 12 or 16)", cdb_size),
    };

    let mut byte1 = 0u8;
    if op == RwOp::Verify {
        byte1 |= 0x02; // BYTCHK=1
    } else {
        if dpo {
            byte1 |= 0x10;
        }
        if fua {
            byte1 |= 0x08;
        }
    }

    let mut cmd = Vec::with_capacity(cdb_size);
    cmd.push(opcode);

    match cdb_size {
        6 => {
            if blocks > 256 {
                bail!("for 6 byte commands, maximum number of blocks is 256");
            }
            if blocks > 0 && (start_block + blocks as u64 - 1) & !MAX_LBA_6 != 0 {
                bail!("for 6 byte commands, can't address blocks beyond {}", MAX_LBA_6);
            }
            if start_block & !MAX_LBA_6 != 0 {
                bail!("for 6 byte commands, can't address blocks beyond {}", MAX_LBA_6);
            }
            if dpo || fua {
                bail!("for 6 byte commands, neither dpo nor fua bits supported");
            }
            cmd.extend(&(start_block as u32).to_be_bytes()[1..]);
            cmd.push(if blocks == 256 { 0 } else { blocks as u8 });
            cmd.push(0); // control
        }
        10 => {
            if blocks > 0xffff {
                bail!("for 10 byte commands, maximum number of blocks is {}", 0xffff);
            }
            if start_block > u32::MAX as u64 {
                bail!("for 10 byte commands, can't address blocks beyond {}", u32::MAX);
            }
            cmd.push(byte1);
            cmd.extend((start_block as u32).to_be_bytes());
            cmd.push(0); // group number
            cmd.extend((blocks as u16).to_be_bytes());
            cmd.push(0); // control
        }
        12 => {
            if start_block > u32::MAX as u64 {
                bail!("for 12 byte commands, can't address blocks beyond {}", u32::MAX);
            }
            cmd.push(byte1);
            cmd.extend((start_block as u32).to_be_bytes());
            cmd.extend(blocks.to_be_bytes());
            cmd.push(0); // group number
            cmd.push(0); // control
        }
        _ => {
            cmd.push(byte1);
            cmd.extend(start_block.to_be_bytes());
            cmd.extend(blocks.to_be_bytes());
            cmd.push(0); // group number
            cmd.push(0); // control
        }
    }

    Ok(cmd)
}

/// Build a PRE-FETCH(10) or PRE-FETCH(16) CDB with IMMED set
///
/// Uses the VERIFY layout and patches the opcode, the IMMED bit sits
/// where BYTCHK does.
pub fn build_prefetch_cdb(cdb_size: usize, start_block: u64, blocks: u32) -> Result<Vec<u8>, Error> {
    let mut cmd = match cdb_size {
        10 => build_rw_cdb(10, RwOp::Verify, start_block, blocks, false, false)?,
        // VERIFY(16) shares the WRITE(16) layout
        16 => build_rw_cdb(16, RwOp::Write, start_block, blocks, false, false)?,
        _ => bail!("PRE-FETCH needs a 10 or 16 byte cdb, not {}", cdb_size),
    };
    cmd[0] = if cdb_size == 16 { PRE_FETCH_16 } else { PRE_FETCH_10 };
    cmd[1] = 0x02; // IMMED
    Ok(cmd)
}

/// SYNCHRONIZE CACHE(10) for the whole medium
pub fn synchronize_cache10() -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.push(SYNCHRONIZE_CACHE_10);
    cmd.extend([0, 0, 0, 0, 0, 0, 0, 0, 0]);
    cmd
}

/// READ CAPACITY(10)
pub fn read_capacity10() -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.push(READ_CAPACITY_10);
    cmd.extend([0, 0, 0, 0, 0, 0, 0, 0, 0]);
    cmd
}

/// READ CAPACITY(16)
pub fn read_capacity16(allocation_len: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.push(SERVICE_ACTION_IN_16);
    cmd.push(SAI_READ_CAPACITY_16);
    cmd.extend([0u8; 8]); // obsolete LBA
    cmd.extend(allocation_len.to_be_bytes());
    cmd.push(0); // PMI
    cmd.push(0); // control
    cmd
}

/// Decoded LBA/length of a data transfer CDB built by this module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdbAddress {
    pub opcode: u8,
    pub lba: u64,
    pub blocks: u32,
}

/// Decode opcode, LBA and transfer length of a READ/WRITE/VERIFY/PRE-FETCH CDB
pub fn decode_rw_cdb(cdb: &[u8]) -> Option<CdbAddress> {
    let opcode = *cdb.first()?;
    let (lba, blocks) = match (opcode, cdb.len()) {
        (READ_6 | WRITE_6, 6) => {
            let lba = u32::from_be_bytes([0, cdb[1] & 0x1f, cdb[2], cdb[3]]) as u64;
            let blocks = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            (lba, blocks)
        }
        (READ_10 | WRITE_10 | VERIFY_10 | PRE_FETCH_10, 10) => {
            let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
            let blocks = u16::from_be_bytes([cdb[7], cdb[8]]) as u32;
            (lba, blocks)
        }
        (READ_12 | WRITE_12, 12) => {
            let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
            let blocks = u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]);
            (lba, blocks)
        }
        (READ_16 | WRITE_16 | PRE_FETCH_16, 16) => {
            let mut lba = [0u8; 8];
            lba.copy_from_slice(&cdb[2..10]);
            let blocks = u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]);
            (u64::from_be_bytes(lba), blocks)
        }
        _ => return None,
    };
    Some(CdbAddress { opcode, lba, blocks })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transfer_limits_match_builder() -> Result<(), Error> {
        for size in [6, 10, 12] {
            let max = max_transfer_blocks(size).unwrap();
            build_rw_cdb(size, RwOp::Read, 0, max, false, false)?;
            if max < u32::MAX {
                assert!(build_rw_cdb(size, RwOp::Read, 0, max + 1, false, false).is_err());
            }
        }
        assert_eq!(max_transfer_blocks(16), Some(u32::MAX));
        assert_eq!(max_transfer_blocks(8), None);
        Ok(())
    }

    #[test]
    fn rw_cdb_oracle() -> Result<(), Error> {
        let table: &[(usize, RwOp, u64, u32, bool, bool, &[u8])] = &[
            (6, RwOp::Read, 0x12345, 8, false, false, &[0x08, 0x01, 0x23, 0x45, 0x08, 0x00]),
            (6, RwOp::Write, 0x1f_ff00, 256, false, false, &[0x0a, 0x1f, 0xff, 0x00, 0x00, 0x00]),
            (
                10,
                RwOp::Read,
                0x0102_0304,
                0x80,
                false,
                false,
                &[0x28, 0x00, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x80, 0x00],
            ),
            (
                10,
                RwOp::Write,
                0x10,
                0xffff,
                true,
                true,
                &[0x2a, 0x18, 0x00, 0x00, 0x00, 0x10, 0x00, 0xff, 0xff, 0x00],
            ),
            (
                10,
                RwOp::Verify,
                100,
                16,
                true,
                true,
                &[0x2f, 0x02, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x10, 0x00],
            ),
            (
                12,
                RwOp::Read,
                0xdead_beef,
                0x0001_0000,
                true,
                false,
                &[0xa8, 0x08, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
            ),
            (
                16,
                RwOp::Write,
                0x0102_0304_0506_0708,
                0x1000,
                false,
                true,
                &[
                    0x8a, 0x10, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0x10,
                    0x00, 0x00, 0x00,
                ],
            ),
            (
                16,
                RwOp::Read,
                7,
                1,
                false,
                false,
                &[
                    0x88, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00,
                    0x01, 0x00, 0x00,
                ],
            ),
        ];

        for (size, op, lba, blocks, fua, dpo, expected) in table {
            let cdb = build_rw_cdb(*size, *op, *lba, *blocks, *fua, *dpo)?;
            assert_eq!(&cdb[..], *expected, "cdb mismatch for {:?}/{}", op, size);
            let addr = decode_rw_cdb(&cdb).unwrap();
            assert_eq!((addr.lba, addr.blocks), (*lba, *blocks));
        }
        Ok(())
    }

    #[test]
    fn six_byte_limits() {
        assert!(build_rw_cdb(6, RwOp::Read, 0, 257, false, false).is_err());
        assert!(build_rw_cdb(6, RwOp::Read, 0x1f_ffff, 2, false, false).is_err());
        assert!(build_rw_cdb(6, RwOp::Read, 0x20_0000, 1, false, false).is_err());
        assert!(build_rw_cdb(6, RwOp::Write, 0, 1, true, false).is_err());
        assert!(build_rw_cdb(6, RwOp::Write, 0, 1, false, true).is_err());
        assert!(build_rw_cdb(6, RwOp::Read, 0x1f_ffff, 1, false, false).is_ok());
    }

    #[test]
    fn verify_only_ten_bytes() {
        for size in [6, 12, 16] {
            assert!(build_rw_cdb(size, RwOp::Verify, 0, 1, false, false).is_err());
        }
        assert!(build_rw_cdb(8, RwOp::Read, 0, 1, false, false).is_err());
        assert!(build_rw_cdb(10, RwOp::Read, 0, 0x1_0000, false, false).is_err());
    }

    #[test]
    fn prefetch_cdbs() -> Result<(), Error> {
        let cdb = build_prefetch_cdb(10, 0x200, 32)?;
        assert_eq!(cdb, [0x34, 0x02, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x20, 0x00]);

        let cdb = build_prefetch_cdb(16, 0x200, 32)?;
        assert_eq!(
            cdb,
            [0x90, 0x02, 0, 0, 0, 0, 0, 0, 0x02, 0x00, 0, 0, 0, 0x20, 0, 0]
        );
        assert!(build_prefetch_cdb(12, 0, 1).is_err());
        Ok(())
    }

    #[test]
    fn fixed_cdbs() {
        assert_eq!(synchronize_cache10(), [0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(read_capacity10(), [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            read_capacity16(32),
            [0x9e, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x20, 0, 0]
        );
    }
}
