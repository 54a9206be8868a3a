//! Linux SCSI generic pass-through support for the sgh_dd copy engine

pub mod buffer;
pub mod cdb;
pub mod commands;
pub mod device;
pub mod emulate;
pub mod file_type;
pub mod sense;
pub mod sg_io;

pub use buffer::AlignedBuffer;
pub use commands::{read_capacity, synchronize_cache, Capacity, ScsiError, SgRaw};
pub use device::{OpenMode, PassThrough, PassThroughOpener, ReservationMap, SgDevice, SgDeviceOpener};
pub use file_type::FileType;
pub use sense::{classify, SenseCategory, SenseInfo};
pub use sg_io::{CtlFlags, SeiMask, SgFlags, SgIoHdr, SgIoV4};
