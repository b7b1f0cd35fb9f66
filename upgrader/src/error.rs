/// Error type for the upgrader crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid maintenance state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A condition that needs operator intervention before anything can proceed.
    #[error("{0}")]
    Fatal(String),
    /// Another operator holds the maintenance state and was active recently.
    #[error("an operation is already in progress by {user_name} (last active {seconds_ago} seconds ago)")]
    InProgress { user_name: String, seconds_ago: i64 },
    /// A migration step failed; the source keeps its own fatality.
    #[error("step '{step}' failed: {source}")]
    Step { step: String, source: Box<Error> },
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Whether the error requires operator intervention.
    ///
    /// Non-fatal errors are expected to clear up when the same invocation is simply repeated,
    /// since every unit of work resumes from the last persisted offset.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Rusqlite(_) | Self::Generic(_) => false,
            Self::Io(_) | Self::Json(_) | Self::Toml(_) | Self::Fatal(_) => true,
            Self::InProgress { .. } => true,
            Self::Step { source, .. } => source.is_fatal(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because io and serde errors don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Json(a), Self::Json(b)) => a.to_string() == b.to_string(),
            (Self::Toml(a), Self::Toml(b)) => a.to_string() == b.to_string(),
            (Self::Fatal(a), Self::Fatal(b)) => a == b,
            (
                Self::InProgress {
                    user_name: a,
                    seconds_ago: x,
                },
                Self::InProgress {
                    user_name: b,
                    seconds_ago: y,
                },
            ) => a == b && x == y,
            (
                Self::Step {
                    step: a,
                    source: x,
                },
                Self::Step {
                    step: b,
                    source: y,
                },
            ) => a == b && x == y,
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}
