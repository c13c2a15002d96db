// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic finite state machine for long-lived entities
//!
//! A [`TransitionTable`] maps `(state, event)` to a [`Transition`]. It is a
//! partial function: each pair maps to at most one transition, and looking up
//! an unmapped pair is an error rather than a no-op.
//!
//! A [`StateMachine`] drives an entity through its table. For each requested
//! event it:
//!
//! 1. resolves the transition (or fails with
//!    [`TransitionError::NoTransition`]);
//! 2. asks every registered [`StateListener`], in registration order, whether
//!    the transition may proceed, aborting with [`TransitionError::Vetoed`]
//!    if any refuses;
//! 3. persists the new state through a [`StateDao`], which must reject the
//!    write if the entity moved underneath us;
//! 4. tells every listener what happened.
//!
//! Failures in step 4 are logged and otherwise ignored. They never undo the
//! state change, and one listener failing does not stop the others from
//! running. Listeners whose side effects can be lost this way need an
//! independent repair path.

use async_trait::async_trait;
use cirrus_common::api::external::Error;
use cirrus_db_queries::context::OpContext;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

/// Side-effect categories a transition may carry
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Impact {
    /// The transition changes billable or capacity usage.
    Usage,
}

/// One edge of a [`TransitionTable`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transition<S, E> {
    pub from: S,
    pub event: E,
    pub to: S,
    pub impacts: Vec<Impact>,
}

impl<S, E> Transition<S, E> {
    pub fn has_impact(&self, impact: Impact) -> bool {
        self.impacts.contains(&impact)
    }

    pub fn is_self_transition(&self) -> bool
    where
        S: PartialEq,
    {
        self.from == self.to
    }
}

/// An immutable `(state, event) -> transition` map
#[derive(Clone, Debug)]
pub struct TransitionTable<S, E> {
    transitions: BTreeMap<(S, E), Transition<S, E>>,
}

impl<S, E> TransitionTable<S, E>
where
    S: Copy + Ord + Debug,
    E: Copy + Ord + Debug,
{
    pub fn builder() -> TransitionTableBuilder<S, E> {
        TransitionTableBuilder { transitions: BTreeMap::new() }
    }

    /// Looks up the transition for `event` out of `from`.
    pub fn lookup(&self, from: S, event: E) -> Option<&Transition<S, E>> {
        self.transitions.get(&(from, event))
    }

    /// The state `event` moves an entity in state `from` to.
    pub fn next_state(&self, from: S, event: E) -> Option<S> {
        self.lookup(from, event).map(|t| t.to)
    }

    /// Every transition, ordered by `(from, event)`.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition<S, E>> {
        self.transitions.values()
    }

    /// The events accepted in state `from`.
    pub fn events_from(&self, from: S) -> Vec<E> {
        self.transitions
            .keys()
            .filter(|(s, _)| *s == from)
            .map(|(_, e)| *e)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

pub struct TransitionTableBuilder<S, E> {
    transitions: BTreeMap<(S, E), Transition<S, E>>,
}

impl<S, E> TransitionTableBuilder<S, E>
where
    S: Copy + Ord + Debug,
    E: Copy + Ord + Debug,
{
    /// Adds the edge `from --event--> to`.
    ///
    /// Panics if an edge for `(from, event)` was already added: tables are
    /// built once from static definitions, so a duplicate is a programming
    /// error.
    pub fn add(mut self, from: S, event: E, to: S, impacts: &[Impact]) -> Self {
        let transition =
            Transition { from, event, to, impacts: impacts.to_vec() };
        if let Some(previous) =
            self.transitions.insert((from, event), transition)
        {
            panic!(
                "duplicate transition for ({:?}, {:?}): already maps to {:?}",
                from, event, previous.to
            );
        }
        self
    }

    pub fn build(self) -> TransitionTable<S, E> {
        TransitionTable { transitions: self.transitions }
    }
}

/// An entity whose lifecycle is driven by a [`StateMachine`]
pub trait Stateful: Clone + Send + Sync + 'static {
    type State: Copy + Ord + Debug + Display + Send + Sync + 'static;
    type Event: Copy + Ord + Debug + Display + Send + Sync + 'static;
    /// Information the caller of [`StateMachine::transit_to`] passes through
    /// to the store and the listeners (for example, which host the entity was
    /// on before the transition, since the stored record will already show
    /// the new host by the time listeners run).
    type Context: Send + Sync;

    fn state(&self) -> Self::State;
}

type TransitionOf<T> =
    Transition<<T as Stateful>::State, <T as Stateful>::Event>;

/// Persistence for entity state
#[async_trait]
pub trait StateDao<T: Stateful>: Send + Sync {
    /// Writes `transition` for `entity` if the stored record is still the
    /// version `entity` was read from.
    ///
    /// Returns the updated entity, or `None` if someone else updated the
    /// record first.
    async fn update_state(
        &self,
        opctx: &OpContext,
        entity: &T,
        transition: &TransitionOf<T>,
        context: &T::Context,
    ) -> Result<Option<T>, Error>;

    /// Re-reads `entity` from the store.
    async fn refetch(&self, entity: &T) -> Result<T, Error>;
}

/// Observer of an entity's transitions
#[async_trait]
pub trait StateListener<T: Stateful>: Send + Sync {
    /// Used to identify this listener in logs and veto errors.
    fn name(&self) -> &'static str;

    /// Called before the transition is persisted. Returning `Err(reason)`
    /// vetoes it.
    async fn before_transition(
        &self,
        _opctx: &OpContext,
        _transition: &TransitionOf<T>,
        _entity: &T,
        _context: &T::Context,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Called after an attempt to persist the transition. `success` is false
    /// if the write lost a race with another update, in which case `entity`
    /// is the version the caller started from.
    async fn after_transition(
        &self,
        opctx: &OpContext,
        transition: &TransitionOf<T>,
        entity: &T,
        context: &T::Context,
        success: bool,
    ) -> Result<(), Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError<S: Debug + Display, E: Debug + Display> {
    /// `event` is not accepted in state `from`.
    #[error("no transition from state {from} on event {event}")]
    NoTransition { from: S, event: E },

    #[error("transition vetoed by {listener}: {reason}")]
    Vetoed { listener: &'static str, reason: String },

    /// A concurrent writer moved the entity from `expected` to `found`, and
    /// the requested event is still accepted in `found`.
    #[error(
        "entity changed concurrently: expected state {expected}, found \
         {found}"
    )]
    Conflict { expected: S, found: S },

    #[error(transparent)]
    Store(#[from] Error),
}

impl<S: Debug + Display, E: Debug + Display> TransitionError<S, E> {
    /// Returns whether trying the same event again might succeed.
    pub fn retryable(&self) -> bool {
        match self {
            TransitionError::Conflict { .. } => true,
            TransitionError::Store(e) => e.retryable(),
            TransitionError::NoTransition { .. }
            | TransitionError::Vetoed { .. } => false,
        }
    }
}

impl<S: Debug + Display, E: Debug + Display> From<TransitionError<S, E>>
    for Error
{
    fn from(e: TransitionError<S, E>) -> Self {
        match e {
            TransitionError::NoTransition { .. }
            | TransitionError::Vetoed { .. } => {
                Error::invalid_request(&e.to_string())
            }
            TransitionError::Conflict { .. } => Error::conflict(e.to_string()),
            TransitionError::Store(e) => e,
        }
    }
}

/// The result of a successful [`StateMachine::transit_to`]
#[derive(Clone, Debug)]
pub struct Transitioned<T: Stateful> {
    pub from: T::State,
    pub to: T::State,
    /// The entity as persisted after the transition
    pub entity: T,
}

/// Drives entities of type `T` through a [`TransitionTable`], notifying
/// listeners
pub struct StateMachine<T: Stateful> {
    table: TransitionTable<T::State, T::Event>,
    listeners: Vec<Arc<dyn StateListener<T>>>,
}

impl<T: Stateful> StateMachine<T> {
    pub fn new(table: TransitionTable<T::State, T::Event>) -> Self {
        StateMachine { table, listeners: Vec::new() }
    }

    /// Registers a listener. Listeners are called in registration order.
    pub fn register_listener(&mut self, listener: Arc<dyn StateListener<T>>) {
        self.listeners.push(listener);
    }

    pub fn table(&self) -> &TransitionTable<T::State, T::Event> {
        &self.table
    }

    /// Applies `event` to `entity`.
    pub async fn transit_to(
        &self,
        opctx: &OpContext,
        dao: &dyn StateDao<T>,
        entity: &T,
        event: T::Event,
        context: &T::Context,
    ) -> Result<Transitioned<T>, TransitionError<T::State, T::Event>> {
        let from = entity.state();
        let transition = self
            .table
            .lookup(from, event)
            .ok_or(TransitionError::NoTransition { from, event })?;

        for listener in &self.listeners {
            if let Err(reason) = listener
                .before_transition(opctx, transition, entity, context)
                .await
            {
                info!(
                    opctx.log,
                    "transition vetoed";
                    "listener" => listener.name(),
                    "from" => %from,
                    "event" => %event,
                    "to" => %transition.to,
                    "reason" => &reason,
                );
                return Err(TransitionError::Vetoed {
                    listener: listener.name(),
                    reason,
                });
            }
        }

        let updated =
            dao.update_state(opctx, entity, transition, context).await?;
        let success = updated.is_some();

        let notified = updated.as_ref().unwrap_or(entity);
        for listener in &self.listeners {
            if let Err(error) = listener
                .after_transition(opctx, transition, notified, context, success)
                .await
            {
                warn!(
                    opctx.log,
                    "state listener failed after transition";
                    "listener" => listener.name(),
                    "from" => %from,
                    "event" => %event,
                    "to" => %transition.to,
                    "error" => %error,
                );
            }
        }

        match updated {
            Some(entity) => {
                debug!(
                    opctx.log,
                    "transitioned";
                    "from" => %from,
                    "event" => %event,
                    "to" => %transition.to,
                );
                Ok(Transitioned { from, to: transition.to, entity })
            }
            None => {
                // We lost a race. Report the state the winner left behind.
                let current = dao.refetch(entity).await?;
                let found = current.state();
                info!(
                    opctx.log,
                    "lost race to update entity state";
                    "expected" => %from,
                    "found" => %found,
                    "event" => %event,
                );
                if self.table.lookup(found, event).is_none() {
                    Err(TransitionError::NoTransition { from: found, event })
                } else {
                    Err(TransitionError::Conflict { expected: from, found })
                }
            }
        }
    }
}
