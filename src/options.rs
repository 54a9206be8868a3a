//! dd style operand parsing
//!
//! Operands are `name=value` pairs, per side behaviour is selected with
//! comma separated `iflag=`/`oflag=` token lists. Everything here is
//! pure parsing, cross checks which need the endpoint types live in
//! [crate::collection].

use std::path::PathBuf;

use anyhow::Error;

use crate::error::syntax_bail;

pub const DEF_BLOCK_SIZE: usize = 512;
pub const DEF_BLOCKS_PER_TRANSFER: u32 = 128;
/// blocks per transfer default once bs reaches 2048
pub const DEF_BLOCKS_PER_2048_TRANSFER: u32 = 32;
pub const DEF_THREADS: usize = 4;
pub const MAX_THREADS: usize = 1024;
pub const DEF_CDB_SIZE: usize = 10;

bitflags::bitflags! {
    /// Tokens accepted by `iflag=` and `oflag=`
    #[derive(Default)]
    pub struct DdFlags: u32 {
        const APPEND = 1 << 0;
        const COE = 1 << 1;
        /// keep the driver's default reservation size
        const DEFRES = 1 << 2;
        const DIO = 1 << 3;
        const DIRECT = 1 << 4;
        const DPO = 1 << 5;
        const DSYNC = 1 << 6;
        const EXCL = 1 << 7;
        const FUA = 1 << 8;
        const MASYNC = 1 << 9;
        const MMAP = 1 << 10;
        /// `mmap` given twice, the mapping is not unmapped on close
        const MMAP_KEEP = 1 << 11;
        const MRQ_IMMED = 1 << 12;
        const MRQ_SVB = 1 << 13;
        const NO_DURATION = 1 << 14;
        const NOSHARE = 1 << 15;
        const NO_UNSHARE = 1 << 16;
        const NO_WAITQ = 1 << 17;
        const NOXFER = 1 << 18;
        const QHEAD = 1 << 19;
        const QTAIL = 1 << 20;
        const SAME_FDS = 1 << 21;
        const SWAIT = 1 << 22;
        const V3 = 1 << 23;
        const V4 = 1 << 24;
        const WQ_EXCL = 1 << 25;
    }
}

impl DdFlags {
    fn parse_list(list: &str, side: &str) -> Result<Self, Error> {
        let mut flags = DdFlags::empty();
        for token in list.split(',').filter(|t| !t.is_empty()) {
            let flag = match token {
                "append" => DdFlags::APPEND,
                "coe" => DdFlags::COE,
                "defres" => DdFlags::DEFRES,
                "dio" => DdFlags::DIO,
                "direct" => DdFlags::DIRECT,
                "dpo" => DdFlags::DPO,
                "dsync" => DdFlags::DSYNC,
                "excl" => DdFlags::EXCL,
                "fua" => DdFlags::FUA,
                "masync" => DdFlags::MASYNC,
                "mmap" if flags.contains(DdFlags::MMAP) => DdFlags::MMAP_KEEP,
                "mmap" => DdFlags::MMAP,
                "mrq_immed" => DdFlags::MRQ_IMMED,
                "mrq_svb" => DdFlags::MRQ_SVB,
                "nodur" => DdFlags::NO_DURATION,
                "noshare" => DdFlags::NOSHARE,
                "no_unshare" => DdFlags::NO_UNSHARE,
                "no_waitq" => DdFlags::NO_WAITQ,
                "noxfer" => DdFlags::NOXFER,
                "null" => DdFlags::empty(),
                "qhead" => DdFlags::QHEAD,
                "qtail" => DdFlags::QTAIL,
                "same_fds" => DdFlags::SAME_FDS,
                "swait" => DdFlags::SWAIT,
                "v3" => DdFlags::V3,
                "v4" => DdFlags::V4,
                "wq_excl" => DdFlags::WQ_EXCL,
                other => syntax_bail!("unrecognised flag '{}' in {}flag=", other, side),
            };
            flags |= flag;
        }
        if flags.contains(DdFlags::V3 | DdFlags::V4) {
            syntax_bail!("{}flag= can not contain both v3 and v4", side);
        }
        Ok(flags)
    }
}

/// Which side of the copy a multiple requests batch covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MrqSide {
    #[default]
    Both,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MrqOptions {
    /// commands per batch, 0 disables multiple requests
    pub nmrqs: usize,
    pub side: MrqSide,
    /// copy all CDBs into one area referenced by the control object
    pub pack_cmds: bool,
}

impl MrqOptions {
    fn parse(value: &str) -> Result<Self, Error> {
        let mut parts = value.split(',').peekable();
        let side = match parts.peek().copied() {
            Some("i") | Some("I") => MrqSide::In,
            Some("o") | Some("O") => MrqSide::Out,
            _ => MrqSide::Both,
        };
        if side != MrqSide::Both {
            parts.next();
        }
        let nmrqs = match parts.next() {
            Some(num) => parse_num(num)? as usize,
            None => syntax_bail!("mrq= needs a number of requests"),
        };
        let pack_cmds = match parts.next() {
            None => false,
            Some("C") | Some("c") => true,
            Some(other) => syntax_bail!("unexpected '{}' in mrq=, expect C", other),
        };
        if parts.next().is_some() {
            syntax_bail!("too many fields in mrq={}", value);
        }
        if pack_cmds && nmrqs == 0 {
            syntax_bail!("mrq=0 can not pack commands");
        }
        Ok(Self {
            nmrqs,
            side,
            pack_cmds,
        })
    }

    pub fn enabled(&self) -> bool {
        self.nmrqs > 0
    }
}

/// Parsed operands
#[derive(Debug, Clone)]
pub struct Options {
    pub bs: usize,
    /// `None` derives the count from the endpoint capacities
    pub count: Option<u64>,
    pub bpt: u32,
    pub cdbsz_in: usize,
    pub cdbsz_out: usize,
    pub coe: bool,
    /// scatter gather element size in bytes, 0 keeps the driver default
    pub elem_size: u32,
    pub in_flags: DdFlags,
    pub out_flags: DdFlags,
    pub infile: Option<PathBuf>,
    pub outfile: Option<PathBuf>,
    pub out2: Option<PathBuf>,
    pub ofreg: Option<PathBuf>,
    pub skip: u64,
    pub seek: u64,
    pub mrq: MrqOptions,
    pub noshare: bool,
    pub unshare: bool,
    pub ofsplit: u32,
    pub sync: bool,
    pub threads: usize,
    /// 0 off, 1 report throughput, 2 also nanosecond command durations
    pub time: u8,
    /// abort every n-th single command
    pub aen: u32,
    /// abort every n-th multiple requests batch
    pub maen: u32,
    pub dry_run: bool,
    pub verify: bool,
    pub prefetch: bool,
    pub verbose: u8,
    pub json: bool,
    /// handle SIGINT, SIGUSR1 and SIGUSR2 in a listener thread
    pub signal_listener: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bs: DEF_BLOCK_SIZE,
            count: None,
            bpt: DEF_BLOCKS_PER_TRANSFER,
            cdbsz_in: DEF_CDB_SIZE,
            cdbsz_out: DEF_CDB_SIZE,
            coe: false,
            elem_size: 0,
            in_flags: DdFlags::empty(),
            out_flags: DdFlags::empty(),
            infile: None,
            outfile: None,
            out2: None,
            ofreg: None,
            skip: 0,
            seek: 0,
            mrq: MrqOptions::default(),
            noshare: false,
            unshare: true,
            ofsplit: 0,
            sync: false,
            threads: DEF_THREADS,
            time: 0,
            aen: 0,
            maen: 0,
            dry_run: false,
            verify: false,
            prefetch: false,
            verbose: 0,
            json: false,
            signal_listener: false,
        }
    }
}

/// What the command line asks for
#[derive(Debug)]
pub enum Invocation {
    Run(Box<Options>),
    Help,
    Version,
}

pub const USAGE: &str = "\
Usage: sgh_dd  [bpt=BPT] [bs=BS] [cdbsz=6|10|12|16] [coe=0|1] [count=COUNT]
               [dio=0|1] [elemsz_kb=EKB] [fua=0|1|2|3] [ibs=BS] [if=IFILE]
               [iflag=FLAGS] [mrq=[I|O,]NRQS[,C]] [noshare=0|1] [obs=BS]
               [of=OFILE] [of2=OFILE2] [ofreg=OFREG] [ofsplit=OSP]
               [oflag=FLAGS] [seek=SEEK] [skip=SKIP] [sync=0|1] [thr=THR]
               [time=0|1|2] [unshare=1|0] [verbose=VERB] [ae=AEN[,MAEN]]
               [--dry-run] [--help] [--json] [--prefetch] [--verbose]
               [--verify] [--version]

  Copy BS*COUNT bytes from IFILE to OFILE using THR worker threads. If
  either file is a scsi generic (sg) device, READ and WRITE commands are
  issued through the pass-through interface, sharing one reservation
  buffer when both sides are sg devices.

  FLAGS: append,coe,defres,dio,direct,dpo,dsync,excl,fua,masync,mmap,
         mrq_immed,mrq_svb,nodur,noshare,no_unshare,no_waitq,noxfer,null,
         qhead,qtail,same_fds,swait,v3,v4,wq_excl

  The log level can be set with the SGH_DD_LOG environment variable.
";

/// Parse a number with optional multiplier suffix
///
/// Accepts decimal, `0x` prefixed hex, the dd suffixes
/// (c w b k K KiB KB m M MiB MB g G GiB GB t T TiB TB) and `AxB`
/// products of two such numbers.
pub fn parse_num(text: &str) -> Result<u64, Error> {
    let text = text.trim();
    if text.is_empty() {
        syntax_bail!("empty number");
    }

    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return match u64::from_str_radix(hex, 16) {
            Ok(value) => Ok(value),
            Err(err) => syntax_bail!("bad hex number '{}' - {}", text, err),
        };
    }

    if let Some((left, right)) = text.split_once(['x', 'X']) {
        let product = parse_num(left)?.checked_mul(parse_num(right)?);
        return match product {
            Some(value) => Ok(value),
            None => syntax_bail!("number '{}' too large", text),
        };
    }

    let digits = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(digits);
    let number: u64 = match number.parse() {
        Ok(number) => number,
        Err(_) => syntax_bail!("bad number '{}'", text),
    };

    let multiplier: u64 = match suffix {
        "" | "c" | "C" => 1,
        "w" | "W" => 2,
        "b" | "B" => 512,
        "k" | "K" | "KiB" => 1 << 10,
        "KB" | "kB" => 1_000,
        "m" | "M" | "MiB" => 1 << 20,
        "MB" | "mB" => 1_000_000,
        "g" | "G" | "GiB" => 1 << 30,
        "GB" | "gB" => 1_000_000_000,
        "t" | "T" | "TiB" => 1 << 40,
        "TB" | "tB" => 1_000_000_000_000,
        other => syntax_bail!("unrecognised multiplier '{}' in '{}'", other, text),
    };

    match number.checked_mul(multiplier) {
        Some(value) => Ok(value),
        None => syntax_bail!("number '{}' too large", text),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match parse_num(value)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => syntax_bail!("{}= expects 0 or 1", key),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, Error> {
    let value = parse_num(value)?;
    match u32::try_from(value) {
        Ok(value) => Ok(value),
        Err(_) => syntax_bail!("{}= value {} too large", key, value),
    }
}

fn parse_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

impl Options {
    fn set_operand(&mut self, key: &str, value: &str, bs_given: &mut bool, bpt_given: &mut bool) -> Result<(), Error> {
        match key {
            "ae" => {
                let (aen, maen) = match value.split_once(',') {
                    Some((aen, maen)) => (aen, Some(maen)),
                    None => (value, None),
                };
                self.aen = parse_u32(key, aen)?;
                if let Some(maen) = maen {
                    self.maen = parse_u32(key, maen)?;
                }
            }
            "bpt" => {
                self.bpt = parse_u32(key, value)?;
                if self.bpt == 0 {
                    syntax_bail!("bpt= must be at least 1");
                }
                *bpt_given = true;
            }
            "bs" | "ibs" | "obs" => {
                let bs = parse_num(value)? as usize;
                if bs == 0 {
                    syntax_bail!("{}= must be greater than 0", key);
                }
                if *bs_given && bs != self.bs {
                    syntax_bail!("differing ibs, obs and bs values are not supported");
                }
                self.bs = bs;
                *bs_given = true;
            }
            "cdbsz" => {
                let size = parse_num(value)? as usize;
                if !matches!(size, 6 | 10 | 12 | 16) {
                    syntax_bail!("cdbsz= expects 6, 10, 12 or 16");
                }
                self.cdbsz_in = size;
                self.cdbsz_out = size;
            }
            "coe" => self.coe = parse_bool(key, value)?,
            "count" => {
                self.count = if value == "-1" {
                    None
                } else {
                    Some(parse_num(value)?)
                };
            }
            "dio" => {
                if parse_bool(key, value)? {
                    self.in_flags |= DdFlags::DIO;
                    self.out_flags |= DdFlags::DIO;
                }
            }
            "elemsz_kb" => {
                let kb = parse_u32(key, value)?;
                if kb > 0 && (kb < 4 || !kb.is_power_of_two()) {
                    syntax_bail!("elemsz_kb= must be a power of two, at least 4");
                }
                self.elem_size = kb.saturating_mul(1024);
            }
            "fua" => {
                let fua = parse_num(value)?;
                if fua > 3 {
                    syntax_bail!("fua= expects 0 to 3");
                }
                if fua & 1 != 0 {
                    self.out_flags |= DdFlags::FUA;
                }
                if fua & 2 != 0 {
                    self.in_flags |= DdFlags::FUA;
                }
            }
            "if" => self.infile = parse_path(value),
            "iflag" => self.in_flags |= DdFlags::parse_list(value, "i")?,
            "mrq" => self.mrq = MrqOptions::parse(value)?,
            "noshare" => self.noshare = parse_bool(key, value)?,
            "of" => self.outfile = parse_path(value),
            "of2" => self.out2 = parse_path(value),
            "oflag" => self.out_flags |= DdFlags::parse_list(value, "o")?,
            "ofreg" => self.ofreg = parse_path(value),
            "ofsplit" => self.ofsplit = parse_u32(key, value)?,
            "seek" => self.seek = parse_num(value)?,
            "skip" => self.skip = parse_num(value)?,
            "sync" => self.sync = parse_bool(key, value)?,
            "thr" => {
                let threads = parse_num(value)? as usize;
                if threads == 0 || threads > MAX_THREADS {
                    syntax_bail!("thr= expects 1 to {}", MAX_THREADS);
                }
                self.threads = threads;
            }
            "time" => {
                self.time = match parse_num(value)? {
                    value @ 0..=2 => value as u8,
                    _ => syntax_bail!("time= expects 0, 1 or 2"),
                };
            }
            "unshare" => self.unshare = parse_bool(key, value)?,
            "verbose" => self.verbose = parse_num(value)?.min(u8::MAX as u64) as u8,
            _ => syntax_bail!("unrecognised operand '{}='", key),
        }
        Ok(())
    }

    fn set_short_options(&mut self, letters: &str) -> Result<Option<Invocation>, Error> {
        for letter in letters.chars() {
            match letter {
                'd' => self.dry_run = true,
                'h' | '?' => return Ok(Some(Invocation::Help)),
                'p' => self.prefetch = true,
                'v' => self.verbose = self.verbose.saturating_add(1),
                'V' => return Ok(Some(Invocation::Version)),
                'x' => self.verify = true,
                other => syntax_bail!("unrecognised option '-{}'", other),
            }
        }
        Ok(None)
    }

    fn finish(&mut self, bpt_given: bool) {
        if !bpt_given && self.bs >= 2048 {
            self.bpt = DEF_BLOCKS_PER_2048_TRANSFER;
        }
        if self.in_flags.contains(DdFlags::COE) || self.out_flags.contains(DdFlags::COE) {
            self.coe = true;
        }
        if self.coe {
            self.in_flags |= DdFlags::COE;
        }
        if self.in_flags.contains(DdFlags::NOSHARE) || self.out_flags.contains(DdFlags::NOSHARE) {
            self.noshare = true;
        }
        if self.in_flags.contains(DdFlags::NO_UNSHARE) || self.out_flags.contains(DdFlags::NO_UNSHARE) {
            self.unshare = false;
        }
    }

    /// Parse the command line (without the program name)
    pub fn parse_args<I, S>(args: I) -> Result<Invocation, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = Options::default();
        let mut bs_given = false;
        let mut bpt_given = false;

        for arg in args {
            let arg = arg.as_ref();
            if let Some(long) = arg.strip_prefix("--") {
                match long {
                    "dry-run" | "dry_run" => opts.dry_run = true,
                    "help" => return Ok(Invocation::Help),
                    "json" => opts.json = true,
                    "prefetch" => opts.prefetch = true,
                    "verbose" => opts.verbose = opts.verbose.saturating_add(1),
                    "verify" => opts.verify = true,
                    "version" => return Ok(Invocation::Version),
                    other => syntax_bail!("unrecognised option '--{}'", other),
                }
            } else if let Some(letters) = arg.strip_prefix('-').filter(|l| !l.is_empty()) {
                if let Some(invocation) = opts.set_short_options(letters)? {
                    return Ok(invocation);
                }
            } else if let Some((key, value)) = arg.split_once('=') {
                opts.set_operand(key, value, &mut bs_given, &mut bpt_given)?;
            } else {
                syntax_bail!("unrecognised argument '{}', expect name=value", arg);
            }
        }

        opts.finish(bpt_given);
        Ok(Invocation::Run(Box::new(opts)))
    }

    /// Combined flags of both sides
    pub fn any_flags(&self) -> DdFlags {
        self.in_flags | self.out_flags
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::error::{DdError, EXIT_SYNTAX};

    fn parse(args: &[&str]) -> Result<Options, Error> {
        match Options::parse_args(args)? {
            Invocation::Run(opts) => Ok(*opts),
            other => panic!("unexpected invocation {:?}", other),
        }
    }

    #[test]
    fn numbers() -> Result<(), Error> {
        assert_eq!(parse_num("512")?, 512);
        assert_eq!(parse_num("0x200")?, 512);
        assert_eq!(parse_num("2k")?, 2048);
        assert_eq!(parse_num("2KB")?, 2000);
        assert_eq!(parse_num("1MiB")?, 1 << 20);
        assert_eq!(parse_num("3b")?, 1536);
        assert_eq!(parse_num("1G")?, 1 << 30);
        assert_eq!(parse_num("2w")?, 4);
        assert_eq!(parse_num("4x512")?, 2048);
        assert_eq!(parse_num("2x1k")?, 2048);
        assert!(parse_num("12q").is_err());
        assert!(parse_num("").is_err());
        assert!(parse_num("99999999999T").is_err());
        Ok(())
    }

    #[test]
    fn operands_and_flags() -> Result<(), Error> {
        let opts = parse(&[
            "bs=4k",
            "count=100",
            "if=/dev/sg1",
            "of=/dev/sg2",
            "iflag=dio,mmap,mmap",
            "oflag=swait,noshare",
            "mrq=o,16,C",
            "thr=8",
            "fua=2",
            "ae=10,3",
            "--verify",
            "-vv",
        ])?;
        assert_eq!(opts.bs, 4096);
        assert_eq!(opts.bpt, DEF_BLOCKS_PER_2048_TRANSFER);
        assert_eq!(opts.count, Some(100));
        assert!(opts.in_flags.contains(DdFlags::DIO | DdFlags::MMAP | DdFlags::MMAP_KEEP));
        assert!(opts.in_flags.contains(DdFlags::FUA));
        assert!(!opts.out_flags.contains(DdFlags::FUA));
        assert!(opts.noshare);
        assert_eq!(
            opts.mrq,
            MrqOptions {
                nmrqs: 16,
                side: MrqSide::Out,
                pack_cmds: true
            }
        );
        assert_eq!(opts.threads, 8);
        assert_eq!((opts.aen, opts.maen), (10, 3));
        assert!(opts.verify);
        assert_eq!(opts.verbose, 2);

        let opts = parse(&["count=-1", "bpt=64", "bs=4096", "coe=1", "oflag=no_unshare"])?;
        assert_eq!(opts.count, None);
        assert_eq!(opts.bpt, 64);
        assert!(opts.coe && opts.in_flags.contains(DdFlags::COE));
        assert!(!opts.unshare);
        Ok(())
    }

    #[test]
    fn syntax_errors() {
        for args in [
            &["foo=1"][..],
            &["iflag=bogus"],
            &["bs=0"],
            &["thr=0"],
            &["thr=1025"],
            &["cdbsz=8"],
            &["mrq=i,4,X"],
            &["time=3"],
            &["elemsz_kb=6"],
            &["iflag=v3,v4"],
            &["--frobnicate"],
            &["stray"],
            &["bs=512", "obs=1024"],
        ] {
            let err = parse(args).unwrap_err();
            assert_eq!(DdError::exit_code_of(&err), EXIT_SYNTAX, "{:?}", args);
        }
    }

    #[test]
    fn help_and_version() -> Result<(), Error> {
        assert!(matches!(Options::parse_args(["-h"])?, Invocation::Help));
        assert!(matches!(Options::parse_args(["--version"])?, Invocation::Version));
        Ok(())
    }
}
