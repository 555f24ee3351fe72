use derive_more::Display;
use thiserror::Error;

use crate::{
    common::{ClientId, ValueKindError},
    storage::{Accessor, Scope},
};

/// The operation that was attempted on a namespace.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq)]
pub enum Operation {
    #[display(fmt = "read")]
    Read,
    #[display(fmt = "write")]
    Write,
}

/// Errors of the namespaced store.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("access violation: {accessor} may not {operation} `{key}` in the {scope} namespace ({reason})")]
    AccessViolation {
        accessor: Accessor,
        operation: Operation,
        scope: Scope,
        key: String,
        reason: &'static str,
    },

    #[error("no value for `{key}` in the {scope} namespace")]
    MissingKey { scope: Scope, key: String },

    #[error("value `{key}` in the {scope} namespace has an unexpected type: {source}")]
    TypeMismatch {
        scope: Scope,
        key: String,
        source: ValueKindError,
    },

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error("the namespace of client {0} was requested more than once")]
    DuplicateClient(ClientId),
}

pub type StoreResult<T> = Result<T, StoreError>;
