use std::fmt;
use std::io;

use pvdisplay_endpoint::DisplayError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn display_error(context: &str, err: DisplayError) -> CliError {
    let code = match err {
        DisplayError::InvalidArgument(_) => USAGE,
        DisplayError::Protocol(_) => DATA_INVALID,
        _ => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}
