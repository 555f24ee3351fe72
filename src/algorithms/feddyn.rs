use std::collections::BTreeMap;

use ndarray::Zip;
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::{
    aggregation::Aggregator,
    algorithms::{
        local_update,
        AlgorithmError,
        ClientContext,
        ClientMessage,
        FedAvg,
        Hooks,
        LOCAL_PARAMS,
    },
    common::{ClientId, Params, Value},
    storage::{keys, Accessor, Scope, Store},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
/// The arguments of FedDyn.
pub struct FedDynParams {
    /// The weight of the dynamic regularizer.
    #[validate(range(min = 0.0))]
    pub mu: f64,
}

impl Default for FedDynParams {
    fn default() -> Self {
        Self { mu: 0.02 }
    }
}

/// Federated learning with dynamic regularization.
///
/// Every client keeps a dual variable `h` in its own namespace and the server keeps a global one.
/// The local objective is corrected by
/// `mu_adaptive * (0.5 * (params - params_init) - h_client)`, where `mu_adaptive` scales `mu` by
/// the ratio of the average client size to the client's own size.
///
/// Clients are weighted uniformly. Besides the global parameters, the average of the client
/// parameters is a servable model, too.
#[derive(Debug)]
pub struct FedDyn {
    fedavg: FedAvg,
    mu: f64,
}

impl FedDyn {
    pub fn new(fedavg: FedAvg, params: FedDynParams) -> Self {
        Self {
            fedavg,
            mu: params.mu,
        }
    }
}

impl Hooks for FedDyn {
    fn init(&mut self, store: &mut Store, init_params: &Params) -> Result<(), AlgorithmError> {
        self.fedavg.init(store, init_params)?;
        let zeros = Params::zeros(init_params.len());
        store.write(
            Accessor::Server,
            Scope::Server,
            keys::AVG_PARAMS,
            init_params.clone(),
        )?;
        store.write(Accessor::Server, Scope::Server, keys::H, zeros.clone())?;
        for client_id in 0..store.num_clients() {
            store.write(
                Accessor::Server,
                Scope::Client(client_id),
                keys::H,
                zeros.clone(),
            )?;
        }
        Ok(())
    }

    fn send_to_server(&self, ctx: &mut ClientContext<'_>) -> Result<ClientMessage, AlgorithmError> {
        let h = ctx.view.read_own_vector(keys::H)?.clone();
        let average_sample = ctx.view.read_shared_scalar(keys::AVERAGE_SAMPLE)?;
        let num_train_samples = ctx.num_train_samples();
        let mu_adaptive = if num_train_samples == 0 {
            0.0
        } else {
            self.mu / num_train_samples as f64 * average_sample
        };

        let params_init = ctx.cloud_params.clone();
        let dynamic = |params: &Params, grads: &mut Params| {
            Zip::from(grads)
                .and(params)
                .and(&params_init)
                .and(&h)
                .for_each(|g, p, p0, h| *g += mu_adaptive * (0.5 * (p - p0) - h));
        };
        let message = local_update(ctx, &dynamic)?;

        let h = h + &params_init - &message.local_params;
        ctx.view.write_own(keys::H, h)?;
        Ok(message)
    }

    fn receive_from_client(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError> {
        self.fedavg
            .receive_weighted(client_id, message, 1.0, aggregator)
    }

    fn optimize(
        &mut self,
        store: &mut Store,
        aggregator: &Aggregator,
    ) -> Result<BTreeMap<String, Value>, AlgorithmError> {
        if aggregator.contains(LOCAL_PARAMS) {
            let weight = aggregator.get_weight(LOCAL_PARAMS)?;
            let avg_params = aggregator.pop(LOCAL_PARAMS)?.into_vector()?;
            let num_clients = store.read_scalar(Accessor::Server, Scope::Shared, keys::NUM_CLIENTS)?;
            let mut cloud_params = store
                .read_vector(Accessor::Server, Scope::Server, keys::CLOUD_PARAMS)?
                .clone();
            let mut h = store
                .read_vector(Accessor::Server, Scope::Server, keys::H)?
                .clone();

            h.scaled_add(weight / num_clients, &(&cloud_params - &avg_params));
            let new_params = &avg_params - &h;
            let pseudo_grads = &cloud_params - &new_params;
            let server = self.fedavg.server_mut();
            server.step(&mut cloud_params, &pseudo_grads)?;
            debug!(lr = server.lr(), "updated the global parameters");

            store.write(
                Accessor::Server,
                Scope::Server,
                keys::CLOUD_PARAMS,
                cloud_params,
            )?;
            store.write(Accessor::Server, Scope::Server, keys::AVG_PARAMS, avg_params)?;
            store.write(Accessor::Server, Scope::Server, keys::H, h)?;
        }
        Ok(aggregator.pop_all())
    }

    fn deploy(&self, store: &Store) -> Result<BTreeMap<String, Params>, AlgorithmError> {
        let mut snapshots = self.fedavg.deploy(store)?;
        let avg_params = store.read_vector(Accessor::Server, Scope::Server, keys::AVG_PARAMS)?;
        snapshots.insert("avg".to_string(), avg_params.clone());
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::algorithms::tests::{data, run_round, server_sgd, store};

    fn message(params: Params) -> ClientMessage {
        ClientMessage {
            local_params: params,
            num_samples: 100,
            num_steps: 10,
            scores: Vec::new(),
        }
    }

    #[test]
    fn test_init_writes_the_dual_variables() {
        let data = data(3);
        let mut store = store(&data);
        let mut feddyn = FedDyn::new(FedAvg::new(server_sgd(1.0)), FedDynParams::default());
        feddyn.init(&mut store, &Params::ones(10)).unwrap();

        for client_id in 0..3 {
            assert_eq!(
                store
                    .read_vector(Accessor::Server, Scope::Client(client_id), keys::H)
                    .unwrap(),
                &Params::zeros(10)
            );
        }
        let snapshots = feddyn.deploy(&store).unwrap();
        assert_eq!(snapshots["cloud"], Params::ones(10));
        assert_eq!(snapshots["avg"], Params::ones(10));
    }

    #[test]
    fn test_server_update() {
        let mut store = Store::new(4);
        store
            .write(Accessor::Server, Scope::Shared, keys::NUM_CLIENTS, 4_usize)
            .unwrap();
        store.seal_shared();
        let mut feddyn = FedDyn::new(FedAvg::new(server_sgd(1.0)), FedDynParams::default());
        feddyn.init(&mut store, &array![2.0]).unwrap();

        // uniform weights regardless of the number of samples
        let aggregator = Aggregator::new();
        feddyn
            .receive_from_client(0, message(array![0.0]), &aggregator)
            .unwrap();
        feddyn
            .receive_from_client(1, message(array![1.0]), &aggregator)
            .unwrap();
        assert_eq!(aggregator.get_weight(LOCAL_PARAMS), Ok(2.0));
        feddyn.optimize(&mut store, &aggregator).unwrap();

        // h = 2 / 4 * (2.0 - 0.5), new = 0.5 - 0.75
        assert_eq!(
            store
                .read_vector(Accessor::Server, Scope::Server, keys::H)
                .unwrap(),
            &array![0.75]
        );
        let snapshots = feddyn.deploy(&store).unwrap();
        assert_eq!(snapshots["avg"], array![0.5]);
        assert_eq!(snapshots["cloud"], array![-0.25]);
    }

    #[test]
    fn test_client_dual_variable_tracks_the_drift() {
        let data = data(2);
        let mut store = store(&data);
        store.seal_shared();
        let mut feddyn = FedDyn::new(FedAvg::new(server_sgd(1.0)), FedDynParams::default());
        feddyn.init(&mut store, &Params::zeros(10)).unwrap();
        run_round(&mut feddyn, &mut store, &data, &[1], 1);

        // the client started from zeros, so h = -params and the average is its own params
        let h = store
            .read_vector(Accessor::Server, Scope::Client(1), keys::H)
            .unwrap()
            .clone();
        let avg_params = feddyn.deploy(&store).unwrap()["avg"].clone();
        assert_eq!(h, -&avg_params);
        assert_ne!(h, Params::zeros(10));

        // the other client was not selected
        assert_eq!(
            store
                .read_vector(Accessor::Server, Scope::Client(0), keys::H)
                .unwrap(),
            &Params::zeros(10)
        );
    }
}
