use std::{error::Error as StdError, fmt};

use backtrace::Backtrace;
use thiserror::Error;

pub trait ErrorCode: StdError + 'static {
    fn code(&self) -> &'static str;
}

#[derive(Error, Debug)]
pub enum Code {
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("Public key not found. {0}")]
    NotFound(String),
    #[error("Public key has expired. {0}")]
    Expired(String),
    #[error("No key is yet active")]
    NoActiveKey,
    #[error("Unable to load private key. {0}")]
    KeyLoad(String),
    #[error("Unable to generate new key. {0}")]
    Generate(String),
    #[error("Error publishing key. {0}")]
    Publish(String),
    #[error("Unable to save private key. {0}")]
    Persist(String),
    #[error("Unable to revoke key. {0}")]
    Revoke(String),
    #[error("Invalid configuration. {0}")]
    Config(String),
}

impl ErrorCode for Code {
    fn code(&self) -> &'static str {
        match self {
            Self::Any(_) => "1010001",
            Self::NotFound(_) => "1010002",
            Self::Expired(_) => "1010003",
            Self::NoActiveKey => "1010004",
            Self::KeyLoad(_) => "1010005",
            Self::Generate(_) => "1010006",
            Self::Publish(_) => "1010007",
            Self::Persist(_) => "1010008",
            Self::Revoke(_) => "1010009",
            Self::Config(_) => "1010010",
        }
    }
}

pub struct WithBacktrace {
    source: Code,
    backtrace: Backtrace,
}

impl WithBacktrace {
    pub fn code(&self) -> &Code {
        &self.source
    }
}

impl fmt::Debug for WithBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithBacktrace")
            .field("source", &self.source)
            .field("backtrace", &self.backtrace)
            .finish()
    }
}

impl fmt::Display for WithBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl StdError for WithBacktrace {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

impl From<Code> for WithBacktrace {
    fn from(code: Code) -> Self {
        WithBacktrace {
            source: code,
            backtrace: Backtrace::new(),
        }
    }
}

impl From<WithBacktrace> for Code {
    fn from(value: WithBacktrace) -> Self {
        value.source
    }
}

/// Two errors are equal when they carry the same code, regardless of message.
impl PartialEq for WithBacktrace {
    fn eq(&self, other: &Self) -> bool {
        self.source.code() == other.source.code()
    }
}

#[inline]
pub fn any<E: StdError>(err: E) -> WithBacktrace {
    Code::Any(anyhow::anyhow!("{}", err.to_string())).into()
}

#[inline]
pub fn anyhow(err: anyhow::Error) -> WithBacktrace {
    Code::Any(err).into()
}

#[inline]
pub fn not_found<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::NotFound(err.to_string()).into()
}

#[inline]
pub fn expired<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::Expired(err.to_string()).into()
}

#[inline]
pub fn no_active_key() -> WithBacktrace {
    Code::NoActiveKey.into()
}

#[inline]
pub fn key_load<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::KeyLoad(err.to_string()).into()
}

#[inline]
pub fn generate<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::Generate(err.to_string()).into()
}

#[inline]
pub fn publish<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::Publish(err.to_string()).into()
}

#[inline]
pub fn persist<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::Persist(err.to_string()).into()
}

#[inline]
pub fn revoke<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::Revoke(err.to_string()).into()
}

#[inline]
pub fn config<S: ToString + ?Sized>(err: &S) -> WithBacktrace {
    Code::Config(err.to_string()).into()
}
