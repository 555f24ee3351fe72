//! # fedsim: a federated learning simulator
//!
//! A single coordinator drives many simulated clients through synchronous communication rounds.
//! Each round a subset of the clients trains a copy of the global model on its private data
//! partition, the server aggregates the client contributions by weighted averaging and updates
//! the global model.
//!
//! ## Crate layout
//!
//! - [`state_machine`]: the round lifecycle of a run and its initialization from the
//!   [`settings`].
//! - [`algorithms`]: FedAvg, FedNova, FedProx and FedDyn expressed through the algorithm hooks.
//! - [`storage`]: the access-controlled server, client and shared namespaces.
//! - [`aggregation`]: the weighted accumulation of the client messages.
//! - [`sampling`]: the per-round client selection.
//! - [`training`], [`model`], [`optim`]: the local optimization loop and its components.
//! - [`data`]: the partitioning of the data among the clients.
//! - [`scores`], [`metrics`]: score evaluation, summaries and the metric log.
//! - [`registry`]: the lookup of components by their configured names.

pub mod aggregation;
pub mod algorithms;
pub mod common;
pub mod data;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod registry;
pub mod sampling;
pub mod scores;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod training;
