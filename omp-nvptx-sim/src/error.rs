use crate::stats::ThreadKey;

#[allow(missing_docs)]
pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// Why a simulated launch failed.
///
/// Errors carrying a [`ThreadKey`] name the first thread that hit them.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[allow(missing_docs)]
pub enum SimError {
    /// The launch shape is unusable.
    #[error("invalid launch: {0}")]
    InvalidLaunch(String),
    #[error("no function named '{0}' is defined")]
    UnknownFunction(String),
    /// No thread can make progress; `waiting` describes every blocked one.
    #[error("deadlock: {} thread(s) wait forever:\n{}", .waiting.len(), .waiting.join("\n"))]
    Deadlock { waiting: Vec<String> },
    /// `unreachable` was executed.
    #[error("{thread} trapped in '{function}'")]
    Trap { function: String, thread: ThreadKey },
    #[error("{thread} accessed invalid address {address:#x}")]
    InvalidAddress { address: i64, thread: ThreadKey },
    /// A read or write through [`Machine`](crate::Machine) missed memory.
    #[error("the host accessed invalid address {0:#x}")]
    InvalidHostAddress(i64),
    /// A call to an unknown or undefined function, or with the wrong
    /// arguments.
    #[error("{thread} made an invalid call: {reason}")]
    InvalidCall { reason: String, thread: ThreadKey },
    #[error("{thread} divided by zero in '{function}'")]
    DivisionByZero { function: String, thread: ThreadKey },
    /// The launch ran more instructions than
    /// [`LaunchConfig::step_limit`](crate::LaunchConfig::step_limit).
    #[error("the step limit of {0} was exceeded")]
    StepLimitExceeded(u64),
    /// Threads meet on a named barrier but disagree on its participant count.
    #[error("threads wait on barrier {id} with participant counts {expected} and {found}")]
    BarrierParticipantMismatch { id: u32, expected: i64, found: i64 },
    /// The module uses a value before defining it, or a block has no
    /// terminator.
    #[error("malformed IR in '{function}': {reason}")]
    MalformedIr { function: String, reason: String },
}
