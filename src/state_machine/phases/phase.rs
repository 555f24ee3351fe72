use std::fmt;

use derive_more::Display;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::ThreadPool;
use tracing::{debug, error_span, warn};

use crate::{
    algorithms::{Algorithm, ClientContext},
    common::{ClientId, Params},
    data::DataManager,
    metrics::MetricLogger,
    model::{Loss, Model},
    optim::{LrScheduler, Optimizer},
    sampling::ClientSampler,
    scores::{ScoreHooks, ScoreSummary},
    settings::EarlyStopSettings,
    state_machine::{
        coordinator::FederationState,
        events::EventPublisher,
        phases::{Failure, PhaseError},
        StateMachine,
    },
    storage::{ClientView, Store},
    training::{LocalTrainer, TrainingConfig},
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "RoundStart")]
    RoundStart,
    #[display(fmt = "ClientSelection")]
    ClientSelection,
    #[display(fmt = "LocalTraining")]
    LocalTraining,
    #[display(fmt = "Aggregation")]
    Aggregation,
    #[display(fmt = "GlobalUpdate")]
    GlobalUpdate,
    #[display(fmt = "Evaluation")]
    Evaluation,
    #[display(fmt = "RoundEnd")]
    RoundEnd,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Done")]
    Done,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
pub trait Phase {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    fn next(self) -> Option<StateMachine>;
}

/// The components of a run which are shared by all phases.
pub struct Federation {
    pub(in crate::state_machine) algorithm: Algorithm,
    pub(in crate::state_machine) data: Box<dyn DataManager>,
    pub(in crate::state_machine) sampler: ClientSampler,
    /// The model every client and evaluation instance is cloned from.
    pub(in crate::state_machine) model: Box<dyn Model>,
    pub(in crate::state_machine) loss: Box<dyn Loss>,
    /// The client optimizer every client instance is cloned from.
    pub(in crate::state_machine) local_optimizer: Box<dyn Optimizer>,
    /// The per epoch scheduler of the client optimizers.
    pub(in crate::state_machine) local_scheduler: Option<Box<dyn LrScheduler>>,
    /// The round to round scheduler of the initial client learning rate.
    pub(in crate::state_machine) r2r_scheduler: Option<Box<dyn LrScheduler>>,
    pub(in crate::state_machine) training: TrainingConfig,
    pub(in crate::state_machine) test_batch_size: usize,
    pub(in crate::state_machine) score_hooks: ScoreHooks,
    pub(in crate::state_machine) summary: ScoreSummary,
    pub(in crate::state_machine) early_stop: Option<EarlyStopSettings>,
    pub(in crate::state_machine) metrics: Box<dyn MetricLogger + Send>,
    /// The workers of the local training.
    pub(in crate::state_machine) pool: ThreadPool,
}

impl fmt::Debug for Federation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Federation")
            .field("algorithm", &self.algorithm)
            .field("data", &self.data)
            .field("sampler", &self.sampler)
            .field("model", &self.model)
            .field("loss", &self.loss)
            .field("local_optimizer", &self.local_optimizer)
            .field("local_scheduler", &self.local_scheduler)
            .field("r2r_scheduler", &self.r2r_scheduler)
            .field("training", &self.training)
            .field("test_batch_size", &self.test_batch_size)
            .field("score_hooks", &self.score_hooks)
            .field("summary", &self.summary)
            .field("early_stop", &self.early_stop)
            .field("metrics", &self.metrics)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

/// The parts of the [`Federation`] a client task borrows.
#[derive(Debug, Clone, Copy)]
pub(in crate::state_machine) struct ClientResources<'a> {
    pub data: &'a dyn DataManager,
    pub model: &'a dyn Model,
    pub loss: &'a dyn Loss,
    pub local_optimizer: &'a dyn Optimizer,
    pub local_scheduler: Option<&'a dyn LrScheduler>,
    pub training: TrainingConfig,
    pub test_batch_size: usize,
    pub score_hooks: &'a ScoreHooks,
}

impl<'a> ClientResources<'a> {
    /// Prepares the context of a client's local round.
    ///
    /// The client optimizer starts from `local_lr` with a fresh state. The random generator of
    /// the client only depends on the seed, the round and the client.
    pub fn context<'b>(
        &self,
        view: ClientView<'b>,
        cloud_params: &'b Params,
        state: &FederationState,
    ) -> ClientContext<'b>
    where
        'a: 'b,
    {
        let client_id = view.client_id();
        let mut optimizer = self.local_optimizer.boxed_clone();
        optimizer.set_lr(state.local_lr);

        ClientContext {
            view,
            cloud_params,
            data: self.data,
            model: self.model.boxed_clone(),
            trainer: LocalTrainer {
                client_id,
                loss: self.loss,
                optimizer,
                scheduler: self
                    .local_scheduler
                    .map(|scheduler| scheduler.with_base_lr(state.local_lr)),
                config: self.training,
            },
            score_hooks: self.score_hooks,
            test_batch_size: self.test_batch_size,
            rng: client_rng(state.seed, state.round_id, client_id),
        }
    }
}

impl Federation {
    pub(in crate::state_machine) fn client_resources(&self) -> ClientResources<'_> {
        ClientResources {
            data: self.data.as_ref(),
            model: self.model.as_ref(),
            loss: self.loss.as_ref(),
            local_optimizer: self.local_optimizer.as_ref(),
            local_scheduler: self.local_scheduler.as_deref(),
            training: self.training,
            test_batch_size: self.test_batch_size,
            score_hooks: &self.score_hooks,
        }
    }

    /// Records a reported score in the summary and the metric log.
    pub(in crate::state_machine) fn report(
        &mut self,
        round_id: u64,
        key: &str,
        value: f64,
    ) -> Result<(), PhaseError> {
        debug!(round_id, key, value, "reporting score");
        self.summary.record(key, value);
        self.metrics.log(round_id, key, value)?;
        Ok(())
    }
}

/// The random generator of a client in a round.
///
/// The streams of the client generators are disjoint from the streams of the client sampler,
/// which uses the round as its stream.
pub(in crate::state_machine) fn client_rng(seed: u64, round_id: u64, client_id: ClientId) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream((round_id << 32) | (client_id as u64 + 1));
    rng
}

/// A struct that contains the federation state, the store and the components that are shared
/// and accessible by all `PhaseState`s.
pub struct Shared {
    /// The federation state.
    pub(in crate::state_machine) state: FederationState,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The store holding the server, client and shared namespaces.
    pub(in crate::state_machine) store: Store,
    /// The components of the run.
    pub(in crate::state_machine) federation: Federation,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("events", &self.events)
            .field("federation", &self.federation)
            .finish()
    }
}

impl Shared {
    /// Creates a new shared state.
    pub fn new(
        state: FederationState,
        events: EventPublisher,
        store: Store,
        federation: Federation,
    ) -> Self {
        Self {
            state,
            events,
            store,
            federation,
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: u64) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }
}

/// The state corresponding to a phase of the federation.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
#[derive(Debug)]
pub struct PhaseState<S> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared federation state and components.
    pub(in crate::state_machine) shared: Shared,
}

impl<S> PhaseState<S>
where
    Self: Phase,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub fn run_phase(mut self) -> Option<StateMachine> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase, round_id = self.shared.round_id());
        let _span_guard = span.enter();

        debug!("starting phase");
        self.shared.events.broadcast_phase(phase);

        if let Err(err) = self.process() {
            warn!("failed to perform the phase tasks");
            return Some(self.into_failure_state(err));
        }
        debug!("phase ran successfully");

        self.broadcast();

        debug!("transitioning to the next phase");
        self.next()
    }
}

impl<S> PhaseState<S> {
    fn into_failure_state(self, err: PhaseError) -> StateMachine {
        PhaseState::<Failure>::new(self.shared, err).into()
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::state_machine::tests::utils;

    #[test]
    fn test_update_round_id() {
        let (mut shared, event_subscriber) = utils::init_shared();

        let phases = event_subscriber.phase_listener();
        // When starting the round ID should be 0
        let id = phases.get_latest().round_id;
        assert_eq!(id, 0);

        shared.set_round_id(1);
        assert_eq!(shared.state.round_id, 1);

        // Old events should still have the same round ID
        let id = phases.get_latest().round_id;
        assert_eq!(id, 0);

        // But new events should have the new round ID
        shared.events.broadcast_phase(PhaseName::RoundStart);
        let id = phases.get_latest().round_id;
        assert_eq!(id, 1);
    }

    #[test]
    fn test_client_rng_streams() {
        let draw = |round_id, client_id| client_rng(7, round_id, client_id).next_u64();
        assert_eq!(draw(1, 0), draw(1, 0));
        assert_ne!(draw(1, 0), draw(1, 1));
        assert_ne!(draw(1, 0), draw(2, 0));
    }
}
