use std::fmt;

/// Fatal failures surfaced to the caller. Row-level data problems are not
/// errors; they travel as [`crate::claims::RowFault`] values next to the results.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoringError {
    /// The ensemble itself is unusable: no trees, or a condition that neither
    /// parses nor reduces to a flag lookup.
    Configuration { ensemble: String, msg: String },
    /// An operation was called on inputs that did not pass validation.
    Precondition { msg: String },
    /// A file or payload could not be read into the expected shape.
    Load { source: String, msg: String },
}

impl ScoringError {
    pub fn configuration(ensemble: &str, msg: impl Into<String>) -> Self {
        ScoringError::Configuration { ensemble: ensemble.to_string(), msg: msg.into() }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ScoringError::Precondition { msg: msg.into() }
    }

    pub fn load(source: impl Into<String>, msg: impl Into<String>) -> Self {
        ScoringError::Load { source: source.into(), msg: msg.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScoringError::Configuration { .. } => "configuration",
            ScoringError::Precondition { .. } => "precondition",
            ScoringError::Load { .. } => "load",
        }
    }
}

impl fmt::Display for ScoringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringError::Configuration { ensemble, msg } => {
                write!(f, "configuration error in ensemble '{}': {}", ensemble, msg)
            }
            ScoringError::Precondition { msg } => write!(f, "precondition failed: {}", msg),
            ScoringError::Load { source, msg } => write!(f, "failed to load {}: {}", source, msg),
        }
    }
}

impl std::error::Error for ScoringError {}
