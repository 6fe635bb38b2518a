use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the core. Skip conditions (quiet period, disabled
/// updates, no diff) are *not* errors; they come back as `(false, reason)`
/// from the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A subprocess exited non-zero (or timed out). Carries everything a
    /// user needs to debug without shell access to the bot host.
    #[error("Error running command `{command}` (exit code {exit_code}):\nstdout: {stdout}\nstderr: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    CiHttp(#[from] CiHttpError),

    /// Sentinel for an error that has already been surfaced to the user and
    /// the run log. Outer layers must not report it a second time.
    #[error("{0}")]
    AlreadyReported(String),

    /// A second `run` was invoked on a handler whose previous run is still
    /// active. This is a programming error, not a runtime race.
    #[error("handler `{0}` is already running")]
    Reentrant(String),

    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn already_reported(&self) -> bool {
        matches!(self, Error::AlreadyReported(_))
    }
}

/// What went wrong talking to the CI server.
#[derive(Debug, Clone)]
pub enum CiHttpCause {
    /// The server answered with a non-2xx status.
    HttpStatus { status: u16, body: String },
    /// The request never completed (DNS, connect, timeout).
    Network(String),
    /// A 2xx answer whose body was not the JSON we expected.
    InvalidResponse(String),
}

/// A failed CI API request. The request metadata is preserved verbatim
/// because downstream error reporting shows this Display output to users.
#[derive(Debug, Clone)]
pub struct CiHttpError {
    pub base_url: String,
    pub method: &'static str,
    pub path: String,
    pub username: String,
    pub cause: CiHttpCause,
}

impl fmt::Display for CiHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CI API request failed")?;
        writeln!(f)?;
        writeln!(f, "Request Data:")?;
        writeln!(f, "- Base URI: {}", self.base_url)?;
        writeln!(f, "- Request Method: {}", self.method)?;
        writeln!(f, "- Request Path: {}", self.path)?;
        writeln!(f, "- Username: {}", self.username)?;
        writeln!(f)?;
        match &self.cause {
            CiHttpCause::HttpStatus { status, body } => {
                writeln!(f, "Exception:")?;
                writeln!(f, "- Response Code: {status}")?;
                writeln!(f, "- Response Body:")?;
                write!(f, "{body}")
            }
            CiHttpCause::Network(text) | CiHttpCause::InvalidResponse(text) => {
                write!(f, "Exception:\n- {text}")
            }
        }
    }
}

impl std::error::Error for CiHttpError {}
