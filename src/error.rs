use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, BrainErr>;

/// The crate's error type. Every variant is fatal to the current run.
#[derive(Debug)]
pub enum BrainErr {
    /// A required setting is missing or out of range.
    Config(String),
    /// A batch violates an input invariant.
    InvalidInput(String),
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// The label sequence of an example can't be aligned within its frames.
    LabelTooLong {
        example: usize,
        required: usize,
        frames: usize,
    },
    Shape(ShapeError),
    /// A parameter initializer was given an invalid distribution.
    Init(String),
    /// A previous step failed midway, the trainer state can't be trusted.
    StepAborted,
    Io(io::Error),
    Json(serde_json::Error),
}

impl Display for BrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrainErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            BrainErr::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BrainErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "size mismatch for {what}: got {got}, expected {expected}"
            ),
            BrainErr::LabelTooLong {
                example,
                required,
                frames,
            } => write!(
                f,
                "example {example} needs at least {required} frames to align its labels but has {frames}"
            ),
            BrainErr::Shape(e) => write!(f, "shape error: {e}"),
            BrainErr::Init(msg) => write!(f, "parameter initialization failed: {msg}"),
            BrainErr::StepAborted => {
                write!(f, "a previous training step did not complete")
            }
            BrainErr::Io(e) => write!(f, "io error: {e}"),
            BrainErr::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for BrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BrainErr::Shape(e) => Some(e),
            BrainErr::Io(e) => Some(e),
            BrainErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for BrainErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<io::Error> for BrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for BrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
