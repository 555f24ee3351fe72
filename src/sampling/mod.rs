//! Client sampling.
//!
//! Each round the [`ClientSampler`] selects the clients which take part in the local training.
//! The selection is a pure function of the round, the scheme, the rate, the number of clients
//! and the seed, which keeps simulations reproducible.

use std::str::FromStr;

use derive_more::Display;
use rand::{seq::index, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::ClientId;

/// The client sampling scheme.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleScheme {
    /// Draws a fresh subset of clients uniformly at random in every round.
    #[display(fmt = "uniform")]
    Uniform,
    /// Cycles through contiguous chunks of the client ids.
    #[display(fmt = "sequential")]
    Sequential,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown sample scheme `{0}` (expected `uniform` or `sequential`)")]
pub struct ParseSampleSchemeError(String);

impl FromStr for SampleScheme {
    type Err = ParseSampleSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(SampleScheme::Uniform),
            "sequential" => Ok(SampleScheme::Sequential),
            _ => Err(ParseSampleSchemeError(s.to_string())),
        }
    }
}

/// Selects the clients of a round.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSampler {
    scheme: SampleScheme,
    rate: f64,
    num_clients: usize,
    seed: u64,
}

impl ClientSampler {
    /// Creates a new sampler. The `rate` is expected to lie in `(0, 1]`, which is checked when the
    /// settings are validated.
    pub fn new(scheme: SampleScheme, rate: f64, num_clients: usize, seed: u64) -> Self {
        Self {
            scheme,
            rate,
            num_clients,
            seed,
        }
    }

    pub fn scheme(&self) -> SampleScheme {
        self.scheme
    }

    /// The number of rounds after which the sequential scheme has visited every client once.
    pub fn cycle_length(&self) -> usize {
        ((1.0 / self.rate).ceil() as usize).max(1)
    }

    /// Selects the clients of the given round (rounds start at `1`).
    ///
    /// The selected ids are distinct and sorted. The selection may be empty, e.g. when the rate
    /// is too small for the number of clients.
    pub fn sample(&self, round_id: u64) -> Vec<ClientId> {
        match self.scheme {
            SampleScheme::Uniform => self.sample_uniform(round_id),
            SampleScheme::Sequential => self.sample_sequential(round_id),
        }
    }

    fn sample_uniform(&self, round_id: u64) -> Vec<ClientId> {
        let amount = ((self.rate * self.num_clients as f64).round() as usize).min(self.num_clients);

        // one independent stream per round: the draw doesn't depend on the previous rounds
        let mut prng = ChaCha20Rng::seed_from_u64(self.seed);
        prng.set_stream(round_id);

        let mut ids = index::sample(&mut prng, self.num_clients, amount).into_vec();
        ids.sort_unstable();
        ids
    }

    fn sample_sequential(&self, round_id: u64) -> Vec<ClientId> {
        let k = self.cycle_length();
        let chunk = (round_id.saturating_sub(1) % k as u64) as usize;
        let n = self.num_clients;
        (chunk * n / k..(chunk + 1) * n / k).collect()
    }
}
