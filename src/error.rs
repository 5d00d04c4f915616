//! Compilation errors: an [`ErrorKind`] with the context it was raised in.

use std::fmt;

use colored::Colorize;

/// Return early with an [`Error`] built from an [`ErrorKind`].
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

/// A compilation error with the chain of contexts it passed through.
#[derive(thiserror::Error)]
pub struct Error {
    #[source]
    error: anyhow::Error,
    kind: ErrorKind,
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.error.fmt(fmt)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut chain = self.error.chain().peekable();

        while let Some(cause) = chain.next() {
            if chain.peek().is_some() {
                writeln!(fmt, "{}: {cause}", "while".bold())?;
            } else {
                fmt::Display::fmt(cause, fmt)?;
            }
        }

        Ok(())
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            error: anyhow::Error::new(kind.clone()),
            kind,
        }
    }
}

impl Error {
    /// The kind of the innermost error, below any added context.
    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Internal compiler errors signal a structural defect in the emitter
    /// itself, never a problem with the user's program.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.kind.is_internal()
    }

    /// Wraps the error in `context`, rendered above it.
    #[must_use]
    pub fn context<C>(self, context: C) -> Self
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        Self {
            error: self.error.context(context),
            kind: self.kind,
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: fmt::Display + Send + Sync + 'static;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|err| err.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.context(f()))
    }
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What went wrong.
///
/// The variants up to [`ErrorKind::InternalError`] are internal compiler
/// errors, the rest are caused by the input or the configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error, Clone)]
pub enum ErrorKind {
    /// A kernel emitted a different number of wake and completion
    /// barriers.
    UnpairedBarrier {
        /// The offending kernel.
        function: String,
        /// Barriers releasing the workers into published work.
        wakes: usize,
        /// Barriers waiting for the workers to finish.
        completions: usize,
    },
    /// A kernel publishes a function that its worker loop cannot call.
    UnregisteredWork {
        /// The publishing kernel.
        kernel: String,
        /// The published function.
        function: String,
    },
    /// Two target regions produced the same entry name.
    DuplicateOffloadEntry(String),
    /// A generated symbol is not a valid PTX identifier.
    InvalidSymbol(String),
    /// The emitted IR does not verify.
    MalformedIr {
        /// The function that failed to verify.
        function: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Any other emitter defect.
    InternalError(String),

    /// A directive or clause combination the lowering does not handle.
    UnsupportedConstruct(String),
    /// A variable used by a region that is neither mapped nor captured.
    UnboundVariable(u32),
    /// `LoopIndex` used outside any loop.
    UnboundLoopIndex,

    /// A rejected option value.
    InvalidConfig {
        /// The option or environment variable.
        key: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ErrorKind {
    /// See [`Error::is_internal`].
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::UnpairedBarrier { .. }
                | Self::UnregisteredWork { .. }
                | Self::DuplicateOffloadEntry(_)
                | Self::InvalidSymbol(_)
                | Self::MalformedIr { .. }
                | Self::InternalError(_)
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use ErrorKind::{
            DuplicateOffloadEntry, InternalError, InvalidConfig, InvalidSymbol, MalformedIr,
            UnboundLoopIndex, UnboundVariable, UnpairedBarrier, UnregisteredWork,
            UnsupportedConstruct,
        };

        match self {
            UnpairedBarrier {
                function,
                wakes,
                completions,
            } => write!(
                fmt,
                "{}: '{}' crosses {} wake barrier(s) but {} completion barrier(s)",
                "Internal error".bold(),
                function,
                wakes,
                completions,
            ),

            UnregisteredWork { kernel, function } => write!(
                fmt,
                "{}: '{}' publishes '{}' to the dispatch slot without a work registry entry",
                "Internal error".bold(),
                kernel,
                function.underline(),
            ),

            DuplicateOffloadEntry(name) => write!(
                fmt,
                "{}: offload entry '{}' was registered twice",
                "Internal error".bold(),
                name.underline(),
            ),

            InvalidSymbol(name) => write!(
                fmt,
                "{}: '{}' is not a valid symbol name",
                "Internal error".bold(),
                name,
            ),

            MalformedIr { function, reason } => write!(
                fmt,
                "{}: malformed IR in '{}': {}",
                "Internal error".bold(),
                function,
                reason,
            ),

            InternalError(message) => write!(fmt, "{}: {}", "Internal error".bold(), message),

            UnsupportedConstruct(construct) => write!(
                fmt,
                "{}: {} cannot be offloaded to this device",
                "Unsupported construct".bold(),
                construct,
            ),

            UnboundVariable(var) => write!(
                fmt,
                "{}: variable #{} is used but not captured by the enclosing region",
                "Unbound variable".bold(),
                var,
            ),

            UnboundLoopIndex => write!(
                fmt,
                "{}: loop index used outside of a loop",
                "Unbound loop index".bold(),
            ),

            InvalidConfig { key, value, reason } => write!(
                fmt,
                "{}: {}={:?} {}",
                "Invalid configuration".bold(),
                key,
                value,
                reason,
            ),
        }
    }
}
