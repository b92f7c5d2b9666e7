//! Shared state for request handlers.
//!
//! [`AppState`] is a type-keyed map handed to every handler call. Handlers
//! reach it through the [`State`](crate::extractor::State) extractor:
//!
//! ```
//! use std::sync::Arc;
//! use wsrelay_core::state::AppState;
//!
//! struct Greeting(&'static str);
//!
//! let state = AppState::new();
//! state.insert(Arc::new(Greeting("hello")));
//! assert_eq!(state.get::<Greeting>().unwrap().0, "hello");
//! ```
//!
//! The runtime inserts its [`Messenger`] at startup, so handlers can publish
//! without wiring it up themselves.

use crate::channel::ChannelHandle;
use crate::messenger::Messenger;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

/// Type-keyed, cheaply cloneable handler state.
#[derive(Clone, Default)]
pub struct AppState {
    entries: Arc<DashMap<TypeId, Entry>>,
}

impl AppState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any earlier value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), value as Entry);
    }

    /// Fetches the value of type `T`.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.entries.get(&TypeId::of::<T>())?.value().clone();
        entry.downcast::<T>().ok()
    }

    /// Returns `true` if a value of type `T` is stored.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The runtime's messenger, once the runtime has started.
    pub fn messenger(&self) -> Option<Arc<Messenger>> {
        self.get::<Messenger>()
    }

    /// Publishing handle for a registered channel.
    pub fn channel(&self, name: &str) -> Option<ChannelHandle> {
        self.messenger()?.channel(name)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("entries", &self.entries.len())
            .finish()
    }
}
