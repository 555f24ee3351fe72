//! Namespaced key-value state.
//!
//! The [`Store`] keeps three kinds of namespaces apart:
//!
//! - the **server** namespace, owned by the algorithm running on the coordinator (global
//!   parameters, server-side dual variables, ...);
//! - one **client** namespace per simulated client (client-local auxiliary state);
//! - the **shared** namespace, holding dataset statistics which are written once during the
//!   initialization and are read-only afterwards.
//!
//! Every access is made on behalf of an [`Accessor`]. The coordinator accesses the store
//! directly, whereas a client task only ever sees a [`ClientView`] of its own namespace and of
//! the shared namespace. Accesses that cross an ownership boundary fail with
//! [`StoreError::AccessViolation`].

mod error;
mod store;

/// Well-known keys of the namespaces.
pub mod keys {
    /// The global model parameters (server).
    pub const CLOUD_PARAMS: &str = "cloud_params";
    /// The average of the last aggregated client parameters (server).
    pub const AVG_PARAMS: &str = "avg_params";
    /// A dual variable (server and clients).
    pub const H: &str = "h";
    /// The number of clients (shared).
    pub const NUM_CLIENTS: &str = "num_clients";
    /// The total number of training samples over all clients (shared).
    pub const TOTAL_TRAIN_SAMPLES: &str = "total_train_samples";
    /// The mean number of training samples per client (shared).
    pub const AVERAGE_SAMPLE: &str = "average_sample";
}

pub use self::{
    error::{Operation, StoreError, StoreResult},
    store::{Accessor, ClientView, Namespace, Scope, Store},
};
