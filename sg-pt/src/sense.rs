//! SCSI sense data decoding and completion classification
//!
//! The numeric category values are the ones the sg3_utils tools use as
//! exit status, so they can be passed straight to `std::process::exit`.

use anyhow::{bail, Error};
use endian_trait::Endian;
use serde::Serialize;

use proxmox_io::ReadExt;

use crate::sg_io::{
    DID_ABORT, DID_BUS_BUSY, DID_NEXUS_FAILURE, DID_NO_CONNECT, DID_TIME_OUT, DRIVER_SENSE,
    DRIVER_TIMEOUT,
};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseInfo {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl std::fmt::Display for SenseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sense_text = SENSE_KEY_DESCRIPTIONS
            .get(self.sense_key as usize)
            .map(|s| String::from(*s))
            .unwrap_or_else(|| format!("Invalid sense {:02X}", self.sense_key));

        if self.asc == 0 && self.ascq == 0 {
            write!(f, "{}", sense_text)
        } else {
            let additional_sense_text = get_asc_ascq_string(self.asc, self.ascq);
            write!(f, "{}, {}", sense_text, additional_sense_text)
        }
    }
}

//  SENSE KEYS
pub const SENSE_KEY_NO_SENSE: u8 = 0x00;
pub const SENSE_KEY_RECOVERED_ERROR: u8 = 0x01;
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_UNIT_ATTENTION: u8 = 0x06;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;
pub const SENSE_KEY_BLANK_CHECK: u8 = 0x08;
pub const SENSE_KEY_COPY_ABORTED: u8 = 0x0a;
pub const SENSE_KEY_ABORTED_COMMAND: u8 = 0x0b;
pub const SENSE_KEY_VOLUME_OVERFLOW: u8 = 0x0d;
pub const SENSE_KEY_MISCOMPARE: u8 = 0x0e;

// SAM STAT (already masked with 0x7e)
const SAM_STAT_CHECK_CONDITION: u32 = 0x02;
const SAM_STAT_CONDITION_MET: u32 = 0x04;
const SAM_STAT_BUSY: u32 = 0x08;
const SAM_STAT_RESERVATION_CONFLICT: u32 = 0x18;
const SAM_STAT_COMMAND_TERMINATED: u32 = 0x22;

/// Sense Key Descriptions
pub const SENSE_KEY_DESCRIPTIONS: [&str; 16] = [
    "No Sense",
    "Recovered Error",
    "Not Ready",
    "Medium Error",
    "Hardware Error",
    "Illegal Request",
    "Unit Attention",
    "Data Protect",
    "Blank Check",
    "Vendor specific",
    "Copy Aborted",
    "Aborted Command",
    "Equal",
    "Volume Overflow",
    "Miscompare",
    "Completed",
];

// The subset of the T10 ASC/ASCQ list a copy run is likely to report.
const ASC_ASCQ_TEXT: &[(u8, u8, &str)] = &[
    (0x00, 0x00, "No additional sense information"),
    (0x04, 0x00, "Logical unit not ready, cause not reportable"),
    (0x04, 0x01, "Logical unit is in process of becoming ready"),
    (0x04, 0x02, "Logical unit not ready, initializing command required"),
    (0x0c, 0x00, "Write error"),
    (0x10, 0x01, "Logical block guard check failed"),
    (0x10, 0x02, "Logical block application tag check failed"),
    (0x10, 0x03, "Logical block reference tag check failed"),
    (0x11, 0x00, "Unrecovered read error"),
    (0x1d, 0x00, "Miscompare during verify operation"),
    (0x20, 0x00, "Invalid command operation code"),
    (0x21, 0x00, "Logical block address out of range"),
    (0x24, 0x00, "Invalid field in cdb"),
    (0x25, 0x00, "Logical unit not supported"),
    (0x27, 0x00, "Write protected"),
    (0x28, 0x00, "Not ready to ready change, medium may have changed"),
    (0x29, 0x00, "Power on, reset, or bus device reset occurred"),
    (0x2a, 0x01, "Mode parameters changed"),
    (0x2a, 0x09, "Capacity data has changed"),
    (0x3a, 0x00, "Medium not present"),
    (0x44, 0x00, "Internal target failure"),
    (0x47, 0x00, "Scsi parity error"),
    (0x4e, 0x00, "Overlapped commands attempted"),
];

/// Get the string associated with ASC/ASCQ values
pub fn get_asc_ascq_string(asc: u8, ascq: u8) -> String {
    ASC_ASCQ_TEXT
        .iter()
        .find(|(a, q, _)| *a == asc && *q == ascq)
        .map(|(_, _, text)| String::from(*text))
        .unwrap_or_else(|| format!("ASC={:02x}x, ASCQ={:02x}x", asc, ascq))
}

#[repr(C, packed)]
#[derive(Endian, Debug)]
pub struct RequestSenseFixed {
    pub response_code: u8,
    obsolete: u8,
    pub flags2: u8,
    pub information: [u8; 4],
    pub additional_sense_len: u8,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian, Debug)]
struct RequestSenseDescriptor {
    response_code: u8,
    sense_key: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved: [u8; 3],
    additional_sense_len: u8,
}

/// Decode fixed (0x70/0x71) or descriptor (0x72/0x73) format sense
///
/// Deferred errors are decoded like current ones. Short sense buffers
/// are zero padded, the driver often writes less than a full fixed
/// format record.
pub fn decode_sense(sense: &[u8]) -> Result<SenseInfo, Error> {
    if sense.is_empty() {
        bail!("got no sense data");
    }

    let mut padded = [0u8; 32];
    let len = sense.len().min(padded.len());
    padded[..len].copy_from_slice(&sense[..len]);

    let code = padded[0] & 0x7f;
    let mut reader = &padded[..];

    let info = match code {
        0x70 | 0x71 => {
            let sense: RequestSenseFixed = unsafe { reader.read_be_value()? };
            SenseInfo {
                sense_key: sense.flags2 & 0xf,
                asc: sense.additional_sense_code,
                ascq: sense.additional_sense_code_qualifier,
            }
        }
        0x72 | 0x73 => {
            let sense: RequestSenseDescriptor = unsafe { reader.read_be_value()? };
            SenseInfo {
                sense_key: sense.sense_key & 0xf,
                asc: sense.additional_sense_code,
                ascq: sense.additional_sense_code_qualifier,
            }
        }
        unknown => bail!("invalid sense response code {:x}", unknown),
    };

    Ok(info)
}

/// Build fixed format sense data (used by the emulated device)
pub fn build_fixed_sense(sense_key: u8, asc: u8, ascq: u8) -> [u8; 18] {
    let mut sense = [0u8; 18];
    sense[0] = 0x70;
    sense[2] = sense_key & 0xf;
    sense[7] = 10; // additional sense length
    sense[12] = asc;
    sense[13] = ascq;
    sense
}

/// Result category of a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(i32)]
pub enum SenseCategory {
    Clean = 0,
    NotReady = 2,
    /// medium, hardware or blank check
    MediumHard = 3,
    IllegalRequest = 5,
    UnitAttention = 6,
    DataProtect = 7,
    InvalidOp = 9,
    CopyAborted = 10,
    AbortedCommand = 11,
    Miscompare = 14,
    NoSense = 20,
    Recovered = 21,
    ResConflict = 24,
    ConditionMet = 25,
    Busy = 26,
    Timeout = 33,
    Protection = 40,
    LbaOutOfRange = 42,
    /// sense data present but not understood
    Sense = 98,
    Other = 99,
}

impl SenseCategory {
    /// Map decoded sense data to a category
    pub fn from_sense(sense: &SenseInfo) -> Self {
        match sense.sense_key {
            SENSE_KEY_NO_SENSE => SenseCategory::NoSense,
            SENSE_KEY_RECOVERED_ERROR => SenseCategory::Recovered,
            SENSE_KEY_NOT_READY => SenseCategory::NotReady,
            SENSE_KEY_MEDIUM_ERROR | SENSE_KEY_HARDWARE_ERROR | SENSE_KEY_BLANK_CHECK => {
                SenseCategory::MediumHard
            }
            SENSE_KEY_UNIT_ATTENTION => SenseCategory::UnitAttention,
            SENSE_KEY_DATA_PROTECT => SenseCategory::DataProtect,
            SENSE_KEY_ILLEGAL_REQUEST => match (sense.asc, sense.ascq) {
                (0x20, 0x00) => SenseCategory::InvalidOp,
                (0x21, 0x00) => SenseCategory::LbaOutOfRange,
                _ => SenseCategory::IllegalRequest,
            },
            SENSE_KEY_ABORTED_COMMAND => {
                if sense.asc == 0x10 {
                    SenseCategory::Protection
                } else {
                    SenseCategory::AbortedCommand
                }
            }
            SENSE_KEY_COPY_ABORTED => SenseCategory::CopyAborted,
            SENSE_KEY_MISCOMPARE => SenseCategory::Miscompare,
            _ => SenseCategory::Sense,
        }
    }

    /// Process exit status for this category
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// Unit attention and aborted command are retried with the same addresses
    pub fn is_retryable(self) -> bool {
        matches!(self, SenseCategory::UnitAttention | SenseCategory::AbortedCommand)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SenseCategory::Clean => "clean",
            SenseCategory::NotReady => "not ready",
            SenseCategory::MediumHard => "medium or hardware error",
            SenseCategory::IllegalRequest => "illegal request",
            SenseCategory::UnitAttention => "unit attention",
            SenseCategory::DataProtect => "data protect",
            SenseCategory::InvalidOp => "invalid opcode",
            SenseCategory::CopyAborted => "copy aborted",
            SenseCategory::AbortedCommand => "aborted command",
            SenseCategory::Miscompare => "miscompare",
            SenseCategory::NoSense => "no sense",
            SenseCategory::Recovered => "recovered error",
            SenseCategory::ResConflict => "reservation conflict",
            SenseCategory::ConditionMet => "condition met",
            SenseCategory::Busy => "busy",
            SenseCategory::Timeout => "timeout",
            SenseCategory::Protection => "protection information error",
            SenseCategory::LbaOutOfRange => "lba out of range",
            SenseCategory::Sense => "unexpected sense",
            SenseCategory::Other => "other error",
        }
    }
}

impl std::fmt::Display for SenseCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a completion from its status triple and sense bytes
pub fn classify(
    device_status: u32,
    transport_status: u32,
    driver_status: u32,
    sense: &[u8],
) -> SenseCategory {
    let scsi_status = device_status & 0x7e;
    let masked_driver_status = driver_status & 0xf;

    if scsi_status == 0 && transport_status == 0 && masked_driver_status == 0 {
        return SenseCategory::Clean;
    }

    if scsi_status == SAM_STAT_CHECK_CONDITION
        || scsi_status == SAM_STAT_COMMAND_TERMINATED
        || masked_driver_status == DRIVER_SENSE
    {
        return match decode_sense(sense) {
            Ok(info) => SenseCategory::from_sense(&info),
            Err(_) => SenseCategory::Sense,
        };
    }

    match transport_status {
        0 => {}
        DID_NO_CONNECT | DID_BUS_BUSY | DID_TIME_OUT => return SenseCategory::Timeout,
        DID_NEXUS_FAILURE => return SenseCategory::ResConflict,
        DID_ABORT => return SenseCategory::AbortedCommand,
        _ => return SenseCategory::Other,
    }

    match scsi_status {
        SAM_STAT_CONDITION_MET => return SenseCategory::ConditionMet,
        SAM_STAT_BUSY => return SenseCategory::Busy,
        SAM_STAT_RESERVATION_CONFLICT => return SenseCategory::ResConflict,
        _ => {}
    }

    if masked_driver_status == DRIVER_TIMEOUT {
        return SenseCategory::Timeout;
    }

    SenseCategory::Other
}
