use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid inputs; raised before any stage runs.
    Config,
    /// An external command failed to launch, exited non-zero or timed out.
    Tool,
    /// A recomputed fingerprint did not match the recorded one.
    Integrity,
    Io,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Other,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Config,
            msg: msg.into(),
        }
    }

    pub fn tool<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Tool,
            msg: msg.into(),
        }
    }

    pub fn integrity<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Integrity,
            msg: msg.into(),
        }
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Io,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
