use std::collections::BTreeMap;

use crate::{
    aggregation::Aggregator,
    algorithms::{AlgorithmError, ClientContext, ClientMessage, FedAvg, Hooks},
    common::{ClientId, Params, Value},
    storage::Store,
};

/// FedAvg with step-normalized client weights.
///
/// A client is weighted by `num_samples / num_steps`, which removes the bias towards clients
/// that take more local steps. Clients that took no step get a weight of zero.
#[derive(Debug)]
pub struct FedNova {
    fedavg: FedAvg,
}

impl FedNova {
    pub fn new(fedavg: FedAvg) -> Self {
        Self { fedavg }
    }
}

pub(crate) fn step_normalized_weight(message: &ClientMessage) -> f64 {
    if message.num_steps == 0 {
        0.0
    } else {
        message.num_samples as f64 / message.num_steps as f64
    }
}

impl Hooks for FedNova {
    fn init(&mut self, store: &mut Store, init_params: &Params) -> Result<(), AlgorithmError> {
        self.fedavg.init(store, init_params)
    }

    fn send_to_server(&self, ctx: &mut ClientContext<'_>) -> Result<ClientMessage, AlgorithmError> {
        self.fedavg.send_to_server(ctx)
    }

    fn receive_from_client(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError> {
        let weight = step_normalized_weight(&message);
        self.fedavg
            .receive_weighted(client_id, message, weight, aggregator)
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

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::algorithms::{tests::server_sgd, LOCAL_PARAMS};

    fn message(params: Params, num_samples: usize, num_steps: usize) -> ClientMessage {
        ClientMessage {
            local_params: params,
            num_samples,
            num_steps,
            scores: Vec::new(),
        }
    }

    #[test]
    fn test_step_normalized_weights() {
        let fednova = FedNova::new(FedAvg::new(server_sgd(1.0)));
        let aggregator = Aggregator::new();

        // 40 samples in 10 steps and 30 samples in 2 steps: weights 4 and 15
        fednova
            .receive_from_client(0, message(array![0.0], 40, 10), &aggregator)
            .unwrap();
        fednova
            .receive_from_client(1, message(array![19.0], 30, 2), &aggregator)
            .unwrap();
        assert_eq!(aggregator.get_weight(LOCAL_PARAMS), Ok(19.0));
        assert_eq!(aggregator.pop(LOCAL_PARAMS), Ok(Value::Vector(array![15.0])));
    }

    #[test]
    fn test_no_steps() {
        assert_eq!(step_normalized_weight(&message(array![1.0], 0, 0)), 0.0);
    }
}
