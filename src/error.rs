//! Typed failures carrying the process exit status

use sg_pt::SenseCategory;

/// Syntax error in operands
pub const EXIT_SYNTAX: i32 = 1;
/// Problem opening or accessing a file
pub const EXIT_FILE_ERROR: i32 = 15;
/// Operands contradict each other
pub const EXIT_CONTRADICT: i32 = 31;
/// OS error base (50) plus ENOMEM
pub const EXIT_OUT_OF_MEMORY: i32 = 62;
/// Stopped by SIGINT
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(thiserror::Error, Debug)]
pub enum DdError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("contradicting operands: {0}")]
    Contradict(String),
    #[error("{0}")]
    File(anyhow::Error),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("interrupted by signal")]
    Interrupted,
    #[error("{category}: {message}")]
    Scsi {
        category: SenseCategory,
        message: String,
    },
}

impl DdError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DdError::Syntax(_) => EXIT_SYNTAX,
            DdError::Contradict(_) => EXIT_CONTRADICT,
            DdError::File(_) => EXIT_FILE_ERROR,
            DdError::OutOfMemory(_) => EXIT_OUT_OF_MEMORY,
            DdError::Interrupted => EXIT_INTERRUPTED,
            DdError::Scsi { category, .. } => category.exit_code(),
        }
    }

    /// Exit status for any error, [DdError] values keep their own code
    pub fn exit_code_of(err: &anyhow::Error) -> i32 {
        match err.downcast_ref::<DdError>() {
            Some(err) => err.exit_code(),
            None => EXIT_FILE_ERROR,
        }
    }
}

macro_rules! syntax_bail {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::from($crate::error::DdError::Syntax(format!($($arg)*))))
    };
}

macro_rules! contradict_bail {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::from($crate::error::DdError::Contradict(format!($($arg)*))))
    };
}

pub(crate) use contradict_bail;
pub(crate) use syntax_bail;

#[cfg(test)]
mod test {
    use super::*;

    fn fails_with_syntax() -> Result<(), anyhow::Error> {
        syntax_bail!("bad operand {}", "foo=1");
    }

    #[test]
    fn exit_codes() {
        let err = fails_with_syntax().unwrap_err();
        assert_eq!(DdError::exit_code_of(&err), EXIT_SYNTAX);
        assert_eq!(err.to_string(), "syntax error: bad operand foo=1");

        let err = anyhow::format_err!("plain");
        assert_eq!(DdError::exit_code_of(&err), EXIT_FILE_ERROR);

        let err = DdError::Scsi {
            category: SenseCategory::Miscompare,
            message: "verify failed".into(),
        };
        assert_eq!(err.exit_code(), 14);
        assert_eq!(DdError::Interrupted.exit_code(), 130);
    }
}
