//! This module provides the [`StateMachine`]'s `Events`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::watch;

use crate::{
    common::{ClientId, Params},
    state_machine::phases::PhaseName,
};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// Global model update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    Invalidate,
    New(Arc<Params>),
}

/// Score report event.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreUpdate {
    Invalidate,
    New(Arc<BTreeMap<String, f64>>),
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    selection_tx: EventBroadcaster<Arc<Vec<ClientId>>>,
    model_tx: EventBroadcaster<ModelUpdate>,
    scores_tx: EventBroadcaster<ScoreUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any
/// coordinator event.
#[derive(Debug)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    selection_rx: EventListener<Arc<Vec<ClientId>>>,
    model_rx: EventListener<ModelUpdate>,
    scores_rx: EventListener<ScoreUpdate>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(round_id: u64, phase: PhaseName, model: ModelUpdate) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (selection_tx, selection_rx) = watch::channel::<Event<Arc<Vec<ClientId>>>>(Event {
            round_id,
            event: Arc::new(Vec::new()),
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelUpdate>>(Event {
            round_id,
            event: model,
        });

        let (scores_tx, scores_rx) = watch::channel::<Event<ScoreUpdate>>(Event {
            round_id,
            event: ScoreUpdate::Invalidate,
        });

        let publisher = EventPublisher {
            round_id,
            phase_tx: phase_tx.into(),
            selection_tx: selection_tx.into(),
            model_tx: model_tx.into(),
            scores_tx: scores_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            selection_rx: selection_rx.into(),
            model_rx: model_rx.into(),
            scores_rx: scores_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit the clients selected for the current round
    pub fn broadcast_selection(&mut self, clients: Arc<Vec<ClientId>>) {
        self.selection_tx.broadcast(self.event(clients));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        self.model_tx.broadcast(self.event(update));
    }

    /// Emit the scores reported in the current phase
    pub fn broadcast_scores(&mut self, update: ScoreUpdate) {
        self.scores_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for client selection events
    pub fn selection_listener(&self) -> EventListener<Arc<Vec<ClientId>>> {
        self.selection_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }

    /// Get a listener for score reports
    pub fn scores_listener(&self) -> EventListener<ScoreUpdate> {
        self.scores_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to retrieve the latest `Event<E>` emitted
/// by the coordinator (with `EventListener::get_latest`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
