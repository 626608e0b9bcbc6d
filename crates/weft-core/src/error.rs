use std::fmt;

/// Machine-readable error codes shared by every weft error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownType,
    MissingId,
    MissingNetwork,
    DuplicateType,
    NoRuntime,
    ConfigParseError,
    MissingAncestor,
    UnknownMutator,
    InvalidArguments,
    MalformedMessage,
    AccumulatorMismatch,
    StoreFailure,
    TransportFailure,
    ChannelClosed,
    AuthenticationFailed,
    UnknownInstance,
    EngineStopped,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::UnknownType => "E1001",
            Self::MissingId => "E1002",
            Self::MissingNetwork => "E1003",
            Self::DuplicateType => "E1004",
            Self::NoRuntime => "E1005",
            Self::ConfigParseError => "E1006",
            Self::MissingAncestor => "E2001",
            Self::UnknownMutator => "E3001",
            Self::InvalidArguments => "E3002",
            Self::MalformedMessage => "E3003",
            Self::AccumulatorMismatch => "E3004",
            Self::StoreFailure => "E4001",
            Self::TransportFailure => "E5001",
            Self::ChannelClosed => "E5002",
            Self::AuthenticationFailed => "E6001",
            Self::UnknownInstance => "E7001",
            Self::EngineStopped => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::UnknownType => "Unknown CRDT type",
            Self::MissingId => "Missing instance id",
            Self::MissingNetwork => "Missing network option",
            Self::DuplicateType => "Duplicate type definition",
            Self::NoRuntime => "No async runtime available",
            Self::ConfigParseError => "Config file parse error",
            Self::MissingAncestor => "Entry integrated before its ancestors",
            Self::UnknownMutator => "Unknown mutator",
            Self::InvalidArguments => "Invalid mutator arguments",
            Self::MalformedMessage => "Malformed entry payload",
            Self::AccumulatorMismatch => "Accumulator does not belong to this type",
            Self::StoreFailure => "Entry store failure",
            Self::TransportFailure => "Transport failure",
            Self::ChannelClosed => "Channel closed",
            Self::AuthenticationFailed => "Authentication failed",
            Self::UnknownInstance => "Unknown composed instance",
            Self::EngineStopped => "Merge engine stopped",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::UnknownType => Some("Define the type on the registry before calling create."),
            Self::MissingId => Some("Pass a non-empty instance id."),
            Self::MissingNetwork => Some("Set Options::network to a Transport implementation."),
            Self::DuplicateType => Some("Type names are write-once; pick a different name."),
            Self::NoRuntime => Some("Call create/compose from inside a Tokio runtime."),
            Self::ConfigParseError => Some("Fix the TOML syntax in the engine config and retry."),
            Self::MissingAncestor => {
                Some("Fetch every ancestor of an entry before integrating it.")
            }
            Self::UnknownMutator => Some("Use one of the mutators listed by the type policy."),
            Self::InvalidArguments | Self::MalformedMessage | Self::AccumulatorMismatch => None,
            Self::StoreFailure => Some("Check disk space and write permissions."),
            Self::TransportFailure | Self::ChannelClosed => {
                Some("Retry once the transport is reachable again.")
            }
            Self::AuthenticationFailed => Some("Verify the signing key and retry."),
            Self::UnknownInstance => Some("Use a name declared in the composed schema."),
            Self::EngineStopped => Some("Keep at least one Instance handle alive."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Configuration errors raised synchronously by `define`, `create` and
/// `compose`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown type {0}")]
    UnknownType(String),

    #[error("need id")]
    MissingId,

    #[error("need options.network")]
    MissingNetwork,

    #[error("already defined {0}")]
    DuplicateType(String),

    #[error("no tokio runtime is running on this thread")]
    NoRuntime,
}

impl ConfigError {
    /// Return the machine-readable error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownType(_) => ErrorCode::UnknownType,
            Self::MissingId => ErrorCode::MissingId,
            Self::MissingNetwork => ErrorCode::MissingNetwork,
            Self::DuplicateType(_) => ErrorCode::DuplicateType,
            Self::NoRuntime => ErrorCode::NoRuntime,
        }
    }
}
