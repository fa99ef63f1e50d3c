use std::path::PathBuf;

use thiserror::Error;

use crate::ldap::proto::ResultCode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid DN syntax: {0}")]
    InvalidDnSyntax(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported password algorithm: {0}")]
    UnsupportedPasswordAlgorithm(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("LDIF parse error at line {line}: {msg}")]
    LdifParse { line: usize, msg: String },

    #[error("LDIF template error: {0}")]
    LdifTemplate(String),

    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("entry already exists")]
    EntryAlreadyExists,

    #[error("entry not found")]
    EntryNotFound,

    #[error("parent entry not found: {0}")]
    ParentNotFound(String),

    #[error("entry has children")]
    NonLeafEntry,

    #[error("attribute or value already exists: {0}")]
    AttributeOrValueExists(String),

    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),

    #[error("operation not allowed on RDN attribute: {0}")]
    NotAllowedOnRdn(String),

    #[error("entry is not within the base DN: {0}")]
    NotUnderBase(String),

    #[error("database is opened read-only")]
    ReadOnly,

    #[error("database error: {0}")]
    Database(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// Wire result code for this error per the protocol error taxonomy.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::InvalidDnSyntax(_) => ResultCode::InvalidDnSyntax,
            Error::InvalidFilter(_) | Error::Protocol(_) => ResultCode::ProtocolError,
            Error::InvalidCredentials => ResultCode::InvalidCredentials,
            Error::EntryAlreadyExists | Error::DuplicateEntry(_) => ResultCode::EntryAlreadyExists,
            Error::EntryNotFound | Error::ParentNotFound(_) => ResultCode::NoSuchObject,
            Error::NonLeafEntry => ResultCode::NotAllowedOnNonLeaf,
            Error::AttributeOrValueExists(_) => ResultCode::AttributeOrValueExists,
            Error::NoSuchAttribute(_) => ResultCode::NoSuchAttribute,
            Error::NotAllowedOnRdn(_) => ResultCode::NotAllowedOnRdn,
            Error::NotUnderBase(_) => ResultCode::InsufficientAccessRights,
            Error::ReadOnly => ResultCode::UnwillingToPerform,
            _ => ResultCode::OperationsError,
        }
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(err: redb::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        Error::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
