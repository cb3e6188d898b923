use std::{error::Error, fmt, io};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, CubeError>;

/// Failures reported across the cube boundary.
///
/// Validation failures are returned synchronously by the call that caused
/// them. Failures inside a running reduction job never cross the thread
/// boundary as errors; they flip the instance to `Phase::Failed` and leave
/// a descriptive entry in the message queue instead.
#[derive(Debug)]
pub enum CubeError {
    /// No instance is registered under the given id.
    InvalidHandle(usize),
    /// An argument is outside its accepted domain.
    InvalidParameter(&'static str),
    /// A dimension disagrees with one fixed by earlier usage.
    DimensionMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// A reduction job is already running on this instance.
    Conflict,
    /// The operation needs an installed model and none is present.
    NotReady,
    /// The job observed its cancel flag and stopped early.
    Cancelled,
    /// A numerical procedure failed mid-computation.
    Numerical(&'static str),
    /// An exported parameter sequence could not be understood.
    Serialization(String),
    Io(io::Error),
}

impl fmt::Display for CubeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CubeError::InvalidHandle(id) => write!(f, "unknown cube id {id}"),
            CubeError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            CubeError::DimensionMismatch {
                what,
                got,
                expected,
            } => write!(f, "dimension mismatch for {what}: got {got}, expected {expected}"),
            CubeError::Conflict => write!(f, "a reduction job is already running"),
            CubeError::NotReady => write!(f, "no model installed"),
            CubeError::Cancelled => write!(f, "computation cancelled"),
            CubeError::Numerical(msg) => write!(f, "numerical failure: {msg}"),
            CubeError::Serialization(msg) => write!(f, "bad model parameters: {msg}"),
            CubeError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for CubeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CubeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CubeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
