//! Reducer composition: folding events into projection state without
//! mutation.
//!
//! A [`RootReducer`] chains [`EventReducer`]s in registration order. Each
//! reducer either passes an event through ([`Reduction::Unhandled`]) or
//! returns a *new* state instance ([`Reduction::Handled`]). Returning the
//! instance it was given is an [`ImmutabilityViolation`] and fails the fold.
//!
//! The root reducer also exposes a stable hash of its composition so that
//! snapshots built by different reducer logic are never mixed.
//!
//! [`ImmutabilityViolation`]: crate::error::ReducerError::ImmutabilityViolation

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::ReducerError;
use crate::event::{DomainEvent, EventRecord};

/// Outcome of offering one event to one reducer.
#[derive(Debug)]
pub enum Reduction<S> {
    /// The reducer does not handle this event.
    Unhandled,
    /// The reducer produced this new state.
    Handled(Arc<S>),
}

/// One step of a fold.
///
/// `name`, `event_type`, and `version` together identify the reducer's
/// logic; bump `version` whenever the logic changes so the reducer hash
/// changes with it.
pub trait EventReducer<S>: Send + Sync {
    /// Stable reducer name.
    fn name(&self) -> &str;

    /// Event type this reducer handles.
    fn event_type(&self) -> &str;

    /// Logic version.
    fn version(&self) -> u32 {
        1
    }

    /// Offer one event. Must not mutate `state`.
    fn reduce(&self, state: &Arc<S>, event: &EventRecord) -> Reduction<S>;
}

type ReduceFn<S, E> = Box<dyn Fn(&S, &E) -> S + Send + Sync>;
type SharedReduceFn<S, E> = Box<dyn Fn(&Arc<S>, &E) -> Arc<S> + Send + Sync>;

/// Reducer for one typed event that builds the next state by value.
///
/// Undecodable payloads are passed through with a warning.
pub struct TypedReducer<S, E> {
    name: String,
    version: u32,
    apply: ReduceFn<S, E>,
    _event: PhantomData<fn(E)>,
}

/// Build a [`TypedReducer`] for `E` from `fn(&S, &E) -> S`.
///
/// # Examples
///
/// ```
/// use brook_es::reducer::{RootReducer, reducer};
/// use brook_es::DomainEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default)]
/// struct Total(i64);
///
/// #[derive(Serialize, Deserialize)]
/// struct Added { amount: i64 }
/// impl DomainEvent for Added {
///     const EVENT_TYPE: &'static str = "Added";
/// }
///
/// let root = RootReducer::builder()
///     .register(reducer(|s: &Total, e: &Added| Total(s.0 + e.amount)))
///     .build();
/// assert_eq!(root.reducer_hash().len(), 64);
/// ```
pub fn reducer<S, E, F>(apply: F) -> TypedReducer<S, E>
where
    E: DomainEvent,
    F: Fn(&S, &E) -> S + Send + Sync + 'static,
{
    TypedReducer {
        name: E::EVENT_TYPE.to_string(),
        version: 1,
        apply: Box::new(apply),
        _event: PhantomData,
    }
}

impl<S, E> TypedReducer<S, E> {
    /// Override the reducer name (defaults to the event type).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the logic version (defaults to 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl<S, E> EventReducer<S> for TypedReducer<S, E>
where
    S: Send + Sync,
    E: DomainEvent,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn event_type(&self) -> &str {
        E::EVENT_TYPE
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn reduce(&self, state: &Arc<S>, event: &EventRecord) -> Reduction<S> {
        if !event.is::<E>() {
            return Reduction::Unhandled;
        }
        match event.decode::<E>() {
            Ok(decoded) => Reduction::Handled(Arc::new((self.apply)(state, &decoded))),
            Err(e) => {
                tracing::warn!(
                    reducer = %self.name,
                    event_type = %event.event_type,
                    position = event.position,
                    error = %e,
                    "undecodable event payload; skipping"
                );
                Reduction::Unhandled
            }
        }
    }
}

/// Reducer that receives the shared state and returns a shared state,
/// allowing structural sharing between versions.
pub struct SharedReducer<S, E> {
    name: String,
    version: u32,
    apply: SharedReduceFn<S, E>,
    _event: PhantomData<fn(E)>,
}

/// Build a [`SharedReducer`] for `E` from `fn(&Arc<S>, &E) -> Arc<S>`.
///
/// The function must return a new `Arc`; returning `state` itself fails
/// the fold.
pub fn shared_reducer<S, E, F>(apply: F) -> SharedReducer<S, E>
where
    E: DomainEvent,
    F: Fn(&Arc<S>, &E) -> Arc<S> + Send + Sync + 'static,
{
    SharedReducer {
        name: E::EVENT_TYPE.to_string(),
        version: 1,
        apply: Box::new(apply),
        _event: PhantomData,
    }
}

impl<S, E> SharedReducer<S, E> {
    /// Override the reducer name (defaults to the event type).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the logic version (defaults to 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl<S, E> EventReducer<S> for SharedReducer<S, E>
where
    S: Send + Sync,
    E: DomainEvent,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn event_type(&self) -> &str {
        E::EVENT_TYPE
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn reduce(&self, state: &Arc<S>, event: &EventRecord) -> Reduction<S> {
        if !event.is::<E>() {
            return Reduction::Unhandled;
        }
        match event.decode::<E>() {
            Ok(decoded) => Reduction::Handled((self.apply)(state, &decoded)),
            Err(e) => {
                tracing::warn!(
                    reducer = %self.name,
                    event_type = %event.event_type,
                    position = event.position,
                    error = %e,
                    "undecodable event payload; skipping"
                );
                Reduction::Unhandled
            }
        }
    }
}

/// Collects reducers for a [`RootReducer`].
pub struct RootReducerBuilder<S> {
    reducers: Vec<Box<dyn EventReducer<S>>>,
}

impl<S: Send + Sync + 'static> RootReducerBuilder<S> {
    /// Append a reducer. Registration order is fold order.
    pub fn register(mut self, reducer: impl EventReducer<S> + 'static) -> Self {
        self.reducers.push(Box::new(reducer));
        self
    }

    /// Freeze the composition and compute its hash.
    pub fn build(self) -> RootReducer<S> {
        let mut hasher = Sha256::new();
        for reducer in &self.reducers {
            hasher.update(reducer.name().as_bytes());
            hasher.update(b"|");
            hasher.update(reducer.event_type().as_bytes());
            hasher.update(format!("|v{}\n", reducer.version()).as_bytes());
        }
        RootReducer {
            reducers: self.reducers,
            hash: hex::encode(hasher.finalize()),
        }
    }
}

/// An ordered composition of reducers for state `S`.
///
/// Every event is offered to every reducer in registration order, and
/// each reducer that handles it sees the state produced by the previous
/// one. Several reducers may handle the same event type; there is no
/// first-match dispatch.
pub struct RootReducer<S> {
    reducers: Vec<Box<dyn EventReducer<S>>>,
    hash: String,
}

impl<S> fmt::Debug for RootReducer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootReducer")
            .field("reducers", &self.reducers.len())
            .field("hash", &self.hash)
            .finish()
    }
}

impl<S: Send + Sync + 'static> RootReducer<S> {
    /// Start an empty composition.
    pub fn builder() -> RootReducerBuilder<S> {
        RootReducerBuilder {
            reducers: Vec::new(),
        }
    }

    /// Hex SHA-256 of the ordered `name|event_type|vN` identities.
    pub fn reducer_hash(&self) -> &str {
        &self.hash
    }

    /// Number of registered reducers.
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// `true` if no reducers are registered.
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    /// Offer one event to every reducer in registration order, chaining
    /// the state through each reducer that handles it.
    ///
    /// # Errors
    ///
    /// [`ReducerError::ImmutabilityViolation`] if a reducer claims the
    /// event but returns the state instance it was given.
    pub fn reduce(&self, state: Arc<S>, event: &EventRecord) -> Result<Arc<S>, ReducerError> {
        let mut current = state;
        for reducer in &self.reducers {
            match reducer.reduce(&current, event) {
                Reduction::Unhandled => {}
                Reduction::Handled(next) if Arc::ptr_eq(&next, &current) => {
                    tracing::error!(
                        reducer = reducer.name(),
                        event_type = %event.event_type,
                        position = event.position,
                        "reducer returned its input state"
                    );
                    return Err(ReducerError::ImmutabilityViolation {
                        reducer: reducer.name().to_string(),
                        event_type: event.event_type.clone(),
                        position: event.position,
                    });
                }
                Reduction::Handled(next) => current = next,
            }
        }
        Ok(current)
    }

    /// Left-fold `events` in order.
    ///
    /// # Errors
    ///
    /// Same as [`reduce`](Self::reduce).
    pub fn reduce_all<'a>(
        &self,
        state: Arc<S>,
        events: impl IntoIterator<Item = &'a EventRecord>,
    ) -> Result<Arc<S>, ReducerError> {
        events
            .into_iter()
            .try_fold(state, |state, event| self.reduce(state, event))
    }
}
