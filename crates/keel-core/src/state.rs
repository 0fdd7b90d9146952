use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::key::{NameKey, TypeKey};

/// Plain data a module persists across runs.
///
/// Implemented automatically for every type that is serializable, has a
/// default (the value a module starts with when nothing is loaded) and a
/// stable [`NameKey`] written into the document.
pub trait PersistentState: Serialize + DeserializeOwned + Default + fmt::Debug + NameKey + 'static {}

impl<T> PersistentState for T where
    T: Serialize + DeserializeOwned + Default + fmt::Debug + NameKey + 'static
{
}

/// Object-safe view of a [`PersistentState`] value.
pub trait ModuleState: fmt::Debug {
    /// The stable name the value is written under.
    fn state_name(&self) -> &'static str;
    fn state_key(&self) -> TypeKey;
    fn to_value(&self) -> serde_json::Result<Value>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<S: PersistentState> ModuleState for S {
    fn state_name(&self) -> &'static str {
        S::NAME
    }

    fn state_key(&self) -> TypeKey {
        TypeKey::of::<S>()
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// A state value offered to a slot of a different type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for StateMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state type mismatch: slot holds '{}', got '{}'",
            self.expected, self.found
        )
    }
}

impl std::error::Error for StateMismatch {}

/// Type-erased access to a module's state slot, used by the registry's
/// serializers.
pub trait StateAccess {
    fn state_name(&self) -> &'static str;
    fn state_key(&self) -> TypeKey;
    fn get_state(&self) -> Rc<dyn ModuleState>;
    fn set_state(&self, state: Rc<dyn ModuleState>) -> Result<(), StateMismatch>;
}

/// Holds the current state of one module.
///
/// The value is shared as `Rc<S>` and replaced wholesale, so a reader that
/// took a snapshot never observes a partial update.
pub struct StateSlot<S> {
    current: RefCell<Rc<S>>,
}

impl<S: PersistentState> Default for StateSlot<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: PersistentState> StateSlot<S> {
    pub fn new(state: S) -> Self {
        Self {
            current: RefCell::new(Rc::new(state)),
        }
    }

    /// Snapshot of the current state.
    pub fn get(&self) -> Rc<S> {
        self.current.borrow().clone()
    }

    pub fn set(&self, state: S) {
        self.set_shared(Rc::new(state));
    }

    pub fn set_shared(&self, state: Rc<S>) {
        *self.current.borrow_mut() = state;
    }

    /// Build the next state from the current one and store it.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&S) -> S,
    {
        let next = f(&self.get());
        self.set(next);
    }
}

impl<S: PersistentState> fmt::Debug for StateSlot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateSlot").field(&self.get()).finish()
    }
}

impl<S: PersistentState> StateAccess for StateSlot<S> {
    fn state_name(&self) -> &'static str {
        S::NAME
    }

    fn state_key(&self) -> TypeKey {
        TypeKey::of::<S>()
    }

    fn get_state(&self) -> Rc<dyn ModuleState> {
        self.get()
    }

    fn set_state(&self, state: Rc<dyn ModuleState>) -> Result<(), StateMismatch> {
        let found = state.state_name();
        let typed = state
            .into_any()
            .downcast::<S>()
            .map_err(|_| StateMismatch {
                expected: S::NAME,
                found,
            })?;
        self.set_shared(typed);
        Ok(())
    }
}
