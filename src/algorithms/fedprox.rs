use std::collections::BTreeMap;

use ndarray::Zip;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    aggregation::Aggregator,
    algorithms::{local_update, AlgorithmError, ClientContext, ClientMessage, FedAvg, Hooks},
    common::{ClientId, Params, Value},
    storage::Store,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
/// The arguments of FedProx.
pub struct FedProxParams {
    /// The weight of the proximal term.
    #[validate(range(min = 0.0))]
    pub mu: f64,
}

impl Default for FedProxParams {
    fn default() -> Self {
        Self { mu: 0.0001 }
    }
}

/// FedAvg with a proximal term in the local objective.
///
/// Every local step adds `mu * (params - params_init)` to the gradients, which keeps the client
/// models close to the global model they started from.
#[derive(Debug)]
pub struct FedProx {
    fedavg: FedAvg,
    mu: f64,
}

impl FedProx {
    pub fn new(fedavg: FedAvg, params: FedProxParams) -> Self {
        Self {
            fedavg,
            mu: params.mu,
        }
    }
}

impl Hooks for FedProx {
    fn init(&mut self, store: &mut Store, init_params: &Params) -> Result<(), AlgorithmError> {
        self.fedavg.init(store, init_params)
    }

    fn send_to_server(&self, ctx: &mut ClientContext<'_>) -> Result<ClientMessage, AlgorithmError> {
        let mu = self.mu;
        let params_init = ctx.cloud_params.clone();
        let proximal = |params: &Params, grads: &mut Params| {
            Zip::from(grads)
                .and(params)
                .and(&params_init)
                .for_each(|g, p, p0| *g += mu * (p - p0));
        };
        local_update(ctx, &proximal)
    }

    fn receive_from_client(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError> {
        self.fedavg.receive_from_client(client_id, message, aggregator)
    }

    fn optimize(
        &mut self,
        store: &mut Store,
        aggregator: &Aggregator,
    ) -> Result<BTreeMap<String, Value>, AlgorithmError> {
        self.fedavg.optimize(store, aggregator)
    }

    fn deploy(&self, store: &Store) -> Result<BTreeMap<String, Params>, AlgorithmError> {
        self.fedavg.deploy(store)
    }
}
