use std::fmt;

/// Machine-readable error codes shared by the engine, the store and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ConfigInvalid,
    MutationTransport,
    MutationRejected,
    UnresolvedLocalId,
    EntityConflict,
    CorruptLocalState,
    MalformedMessage,
    WrongMission,
    StoreOpenFailed,
    LockContention,
    StoreWriteFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::ConfigInvalid => "E1002",
            Self::MutationTransport => "E2001",
            Self::MutationRejected => "E2002",
            Self::UnresolvedLocalId => "E2003",
            Self::EntityConflict => "E2004",
            Self::CorruptLocalState => "E3001",
            Self::MalformedMessage => "E4001",
            Self::WrongMission => "E4002",
            Self::StoreOpenFailed => "E5001",
            Self::LockContention => "E5002",
            Self::StoreWriteFailed => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ConfigInvalid => "Config value out of range",
            Self::MutationTransport => "Mutation service unreachable",
            Self::MutationRejected => "Mutation rejected by server",
            Self::UnresolvedLocalId => "Local id not yet acknowledged",
            Self::EntityConflict => "Entity already exists",
            Self::CorruptLocalState => "Persisted local state unreadable",
            Self::MalformedMessage => "Malformed realtime message",
            Self::WrongMission => "Message addressed to another mission",
            Self::StoreOpenFailed => "Local store could not be opened",
            Self::LockContention => "Lock contention",
            Self::StoreWriteFailed => "Local store write failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in config.toml and retry."),
            Self::ConfigInvalid => {
                Some("retention_seconds and purge_interval_ms must both be greater than zero.")
            }
            Self::MutationTransport => {
                Some("Pending actions stay queued and flush on the next reconnect.")
            }
            Self::MutationRejected => Some("Inspect the queued action with `trailsync queue`."),
            Self::UnresolvedLocalId => {
                Some("The action waits until the entity's create is acknowledged.")
            }
            Self::EntityConflict | Self::WrongMission => None,
            Self::CorruptLocalState => Some("The slot is ignored; server state will be reloaded."),
            Self::MalformedMessage => Some("The message was dropped; check the server version."),
            Self::StoreOpenFailed | Self::StoreWriteFailed => {
                Some("Check disk space and write permissions for the data directory.")
            }
            Self::LockContention => {
                Some("Another trailsync process holds this mission's store; close it and retry.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
