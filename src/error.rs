use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire meta optimization crate.
pub type Result<T> = std::result::Result<T, MetaErr>;

/// The meta optimization crate's error type.
///
/// Every variant is a precondition violation: none of them are recovered from
/// internally, they are surfaced to the caller as soon as they're found.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaErr {
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    StructureMismatch {
        what: &'static str,
    },
    Domain {
        what: &'static str,
        value: f64,
    },
    NonFinite {
        what: &'static str,
    },
    NotScalar {
        got: Vec<usize>,
    },
    Config(String),
}

impl Display for MetaErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            MetaErr::StructureMismatch { what } => {
                write!(f, "tree structure mismatch between {what}")
            }
            MetaErr::Domain { what, value } => {
                write!(f, "{what} is out of its domain, got {value}")
            }
            MetaErr::NonFinite { what } => write!(f, "non-finite values found in {what}"),
            MetaErr::NotScalar { got } => {
                write!(f, "can only differentiate a scalar output, got shape {got:?}")
            }
            MetaErr::Config(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for MetaErr {}

impl From<serde_json::Error> for MetaErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}
