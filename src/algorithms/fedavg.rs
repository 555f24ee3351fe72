use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    aggregation::Aggregator,
    algorithms::{
        aggregate_message,
        local_update,
        AlgorithmError,
        ClientContext,
        ClientMessage,
        Hooks,
        LOCAL_PARAMS,
    },
    common::{ClientId, Params, Value},
    optim::{LrScheduler, Optimizer, SizeMismatch},
    storage::{keys, Accessor, Scope, Store},
    training::no_transform,
};

/// The server optimizer together with its optional learning rate scheduler.
#[derive(Debug)]
pub struct ServerOptimizer {
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LrScheduler>>,
}

impl ServerOptimizer {
    pub fn new(optimizer: Box<dyn Optimizer>, scheduler: Option<Box<dyn LrScheduler>>) -> Self {
        Self {
            optimizer,
            scheduler,
        }
    }

    pub fn lr(&self) -> f64 {
        self.optimizer.lr()
    }

    /// Applies one optimizer step to `params` along `pseudo_grads`, then advances the scheduler.
    pub fn step(&mut self, params: &mut Params, pseudo_grads: &Params) -> Result<(), SizeMismatch> {
        self.optimizer.step(params, pseudo_grads)?;
        if let Some(scheduler) = self.scheduler.as_mut() {
            self.optimizer.set_lr(scheduler.step());
        }
        Ok(())
    }
}

/// Federated averaging.
///
/// Clients are weighted by the number of samples they trained on. The server treats the
/// difference between the global parameters and the weighted average of the client parameters as
/// a pseudo-gradient, a server SGD step with a learning rate of `1` therefore replaces the global
/// parameters by the average.
#[derive(Debug)]
pub struct FedAvg {
    server: ServerOptimizer,
}

impl FedAvg {
    pub fn new(server: ServerOptimizer) -> Self {
        Self { server }
    }

    pub(crate) fn server_mut(&mut self) -> &mut ServerOptimizer {
        &mut self.server
    }

    /// Accumulates a message with the given weight for its parameters.
    pub(crate) fn receive_weighted(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        weight: f64,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError> {
        aggregate_message(client_id, message, weight, aggregator).map_err(AlgorithmError::from)
    }
}

impl Hooks for FedAvg {
    fn init(&mut self, store: &mut Store, init_params: &Params) -> Result<(), AlgorithmError> {
        store.write(
            Accessor::Server,
            Scope::Server,
            keys::CLOUD_PARAMS,
            init_params.clone(),
        )?;
        Ok(())
    }

    fn send_to_server(&self, ctx: &mut ClientContext<'_>) -> Result<ClientMessage, AlgorithmError> {
        local_update(ctx, &no_transform)
    }

    fn receive_from_client(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError> {
        let weight = message.num_samples as f64;
        self.receive_weighted(client_id, message, weight, aggregator)
    }

    fn optimize(
        &mut self,
        store: &mut Store,
        aggregator: &Aggregator,
    ) -> Result<BTreeMap<String, Value>, AlgorithmError> {
        if aggregator.contains(LOCAL_PARAMS) {
            let avg_params = aggregator.pop(LOCAL_PARAMS)?.into_vector()?;
            let mut cloud_params = store
                .read_vector(Accessor::Server, Scope::Server, keys::CLOUD_PARAMS)?
                .clone();

            let pseudo_grads = &cloud_params - &avg_params;
            self.server.step(&mut cloud_params, &pseudo_grads)?;
            debug!(lr = self.server.lr(), "updated the global parameters");

            store.write(
                Accessor::Server,
                Scope::Server,
                keys::CLOUD_PARAMS,
                cloud_params,
            )?;
        }
        Ok(aggregator.pop_all())
    }

    fn deploy(&self, store: &Store) -> Result<BTreeMap<String, Params>, AlgorithmError> {
        let cloud_params = store.read_vector(Accessor::Server, Scope::Server, keys::CLOUD_PARAMS)?;
        let mut snapshots = BTreeMap::new();
        snapshots.insert("cloud".to_string(), cloud_params.clone());
        Ok(snapshots)
    }
}
