use std::fmt;

/// Failure class of a deploy run. Each class maps to its own exit code so
/// operators (and wrapper scripts) can tell a network problem from a broken
/// repository without reading the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or unusable run parameter.
    Input,
    /// git, ssh or rsync could not reach the other side.
    Transport,
    /// The repository has nothing this tool knows how to deploy.
    Precondition,
    /// Package or service setup on the target host failed.
    Provisioning,
    /// The container did not come up, or the host does not answer.
    Deployment,
    /// The reverse proxy rejected the generated configuration.
    Configuration,
    Other,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Input => "input error",
            ErrorKind::Transport => "transport error",
            ErrorKind::Precondition => "precondition error",
            ErrorKind::Provisioning => "provisioning error",
            ErrorKind::Deployment => "deployment error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Other => "error",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Other => 1,
            ErrorKind::Input => 2,
            ErrorKind::Transport => 3,
            ErrorKind::Precondition => 4,
            ErrorKind::Provisioning => 5,
            ErrorKind::Deployment => 6,
            ErrorKind::Configuration => 7,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn input<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Input, msg)
    }

    pub fn transport<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transport, msg)
    }

    pub fn precondition<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Precondition, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    // Stages tag unclassified errors with their own failure class; an error
    // that already carries a class keeps it.
    pub fn or_kind(self, kind: ErrorKind) -> Self {
        if self.kind == ErrorKind::Other {
            Self { kind, ..self }
        } else {
            self
        }
    }

    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == ErrorKind::Other {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{}: {}", self.kind.label(), self.msg)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
