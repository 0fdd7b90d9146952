use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::key::TypeKey;
use crate::state::{ModuleState, PersistentState};

type Decoder = fn(Value) -> serde_json::Result<Rc<dyn ModuleState>>;

#[derive(Clone, Copy)]
struct StateType {
    key: TypeKey,
    decode: Decoder,
}

fn decode<S: PersistentState>(value: Value) -> serde_json::Result<Rc<dyn ModuleState>> {
    let state: S = serde_json::from_value(value)?;
    Ok(Rc::new(state))
}

/// The state types that may appear in a document, by their stable name.
///
/// A state whose type was never registered here cannot be written or read;
/// the affected entry is skipped instead.
#[derive(Clone, Default)]
pub struct StateTypeRegistry {
    by_name: BTreeMap<&'static str, StateType>,
}

impl StateTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `S` under its [`NameKey`](crate::key::NameKey).
    ///
    /// Registering the same type again is a no-op; a different type with the
    /// same name is an error.
    pub fn register<S: PersistentState>(&mut self) -> Result<()> {
        let key = TypeKey::of::<S>();
        if let Some(existing) = self.by_name.get(S::NAME) {
            if existing.key == key {
                return Ok(());
            }
            return Err(RuntimeError::DuplicateStateType {
                name: S::NAME,
                existing: existing.key.name(),
            });
        }
        self.by_name.insert(
            S::NAME,
            StateType {
                key,
                decode: decode::<S>,
            },
        );
        tracing::debug!(state = S::NAME, "registered state type");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn key_for(&self, name: &str) -> Option<TypeKey> {
        self.by_name.get(name).map(|t| t.key)
    }

    /// `true` if `state` can be written: its name is registered for its own
    /// type.
    pub fn accepts(&self, state: &dyn ModuleState) -> bool {
        self.key_for(state.state_name()) == Some(state.state_key())
    }

    /// Decode `data` as the state registered under `name`; `None` if the name
    /// is unknown.
    pub fn decode(&self, name: &str, data: Value) -> Option<serde_json::Result<Rc<dyn ModuleState>>> {
        self.by_name.get(name).map(|t| (t.decode)(data))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
    }
}
