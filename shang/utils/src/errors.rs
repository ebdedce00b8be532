//! Errors generated by the scheduling core.
//!
//! Every failure aborts the synthesis of the current function: downstream
//! FSM generation needs a complete schedule so nothing is emitted partially.
use thiserror::Error as ThisError;

/// Convenience wrapper to represent success or meaningful compiler error.
pub type ShangResult<T> = std::result::Result<T, Error>;

/// The kind of failure. The scheduler's caller is expected to match on
/// [ErrorKind::InfeasibleII] to retry with a larger initiation interval;
/// every other kind is fatal for the function being compiled.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation graph is not well formed (e.g. a distance-0 cycle).
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    /// Modulo scheduling could not place every node within the interval.
    #[error(
        "Cannot schedule block `{block}` with II={ii}: {reason} (minimum II is {min_ii})"
    )]
    InfeasibleII {
        block: String,
        ii: u32,
        min_ii: u32,
        reason: String,
    },

    /// A use refers to a value with no reachable definition.
    #[error("Broken dependency: {0}")]
    BrokenDependency(String),

    /// An internal invariant of the scheduling core does not hold.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// The list scheduler kept growing the block without converging.
    #[error("Schedule for block `{0}` did not converge")]
    Diverged(String),

    /// The supplied configuration cannot be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Miscellaneous error message
    #[error("{0}")]
    Misc(String),
}

/// Standard error type for the scheduling core.
#[derive(Clone, PartialEq, Eq)]
pub struct Error {
    kind: Box<ErrorKind>,
    /// Extra message attached while the error propagates
    post_msg: Option<String>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.post_msg {
            write!(f, "\n{msg}")?;
        }
        Ok(())
    }
}

// Same output as `Display`.
impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind: Box::new(kind),
            post_msg: None,
        }
    }
}

impl Error {
    pub fn with_post_msg(mut self, msg: Option<String>) -> Self {
        self.post_msg = msg;
        self
    }

    pub fn malformed_graph<S: ToString>(msg: S) -> Self {
        ErrorKind::MalformedGraph(msg.to_string()).into()
    }

    pub fn infeasible_ii<S: ToString, R: ToString>(
        block: S,
        ii: u32,
        min_ii: u32,
        reason: R,
    ) -> Self {
        ErrorKind::InfeasibleII {
            block: block.to_string(),
            ii,
            min_ii,
            reason: reason.to_string(),
        }
        .into()
    }

    pub fn broken_dependency<S: ToString>(msg: S) -> Self {
        ErrorKind::BrokenDependency(msg.to_string()).into()
    }

    pub fn invariant<S: ToString>(msg: S) -> Self {
        ErrorKind::Invariant(msg.to_string()).into()
    }

    pub fn diverged<S: ToString>(block: S) -> Self {
        ErrorKind::Diverged(block.to_string()).into()
    }

    pub fn invalid_config<S: ToString>(msg: S) -> Self {
        ErrorKind::InvalidConfig(msg.to_string()).into()
    }

    pub fn misc<S: ToString>(msg: S) -> Self {
        ErrorKind::Misc(msg.to_string()).into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The smallest interval worth retrying with, if this error reports an
    /// infeasible initiation interval.
    pub fn retry_ii(&self) -> Option<u32> {
        match &*self.kind {
            ErrorKind::InfeasibleII { ii, min_ii, .. } => {
                Some(std::cmp::max(*min_ii, ii + 1))
            }
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infeasible_ii_suggests_retry() {
        let err = Error::infeasible_ii("loop", 2, 5, "recurrence");
        assert_eq!(err.retry_ii(), Some(5));
        assert!(err.message().contains("II=2"));

        let err = Error::infeasible_ii("loop", 4, 3, "resources");
        assert_eq!(err.retry_ii(), Some(5));
        assert_eq!(Error::misc("x").retry_ii(), None);
    }

    #[test]
    fn post_msg_is_displayed() {
        let err = Error::broken_dependency("v3 has no definition")
            .with_post_msg(Some("while emitting bb1".to_string()));
        let msg = err.to_string();
        assert!(msg.starts_with("Broken dependency: v3"));
        assert!(msg.ends_with("while emitting bb1"));
    }
}
