use std::io::Read;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::anchor::TaggedSafeAnchor;
use super::archive::{InputArchive, OutputArchive};
use super::types::StateTypeRegistry;
use crate::error::Result;
use crate::state::PersistentState;

/// Diagnostics collected while a batch of entries is read or written.
pub type InvalidityList = Vec<String>;

/// Entry point for writing and reading project documents.
///
/// Owns the [`StateTypeRegistry`] and a stack of [`InvalidityList`]s: a
/// caller pushes a list before a batch, every anchor that fails during the
/// batch records a line in the top list, and the caller pops the list
/// afterwards.
#[derive(Default)]
pub struct SerializationManager {
    types: StateTypeRegistry,
    invalidities: Vec<InvalidityList>,
}

impl SerializationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&self) -> &StateTypeRegistry {
        &self.types
    }

    pub fn register_state<S: PersistentState>(&mut self) -> Result<()> {
        self.types.register::<S>()
    }

    pub fn begin_save(&self) -> OutputArchive {
        OutputArchive::new()
    }

    pub fn begin_load<R: Read>(&self, reader: R) -> Result<InputArchive> {
        InputArchive::from_reader(reader)
    }

    /// Drop any invalidity lists a caller left behind.
    pub fn finish(&mut self) {
        if !self.invalidities.is_empty() {
            tracing::debug!(
                lists = self.invalidities.len(),
                "discarding unclaimed invalidity lists"
            );
        }
        self.invalidities.clear();
    }

    pub fn push_invalidity_list(&mut self) {
        self.invalidities.push(InvalidityList::new());
    }

    pub fn pop_invalidity_list(&mut self) -> Option<InvalidityList> {
        self.invalidities.pop()
    }

    /// Record a diagnostic in the innermost list; without one, only warn.
    pub fn log_invalidity(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self.invalidities.last_mut() {
            Some(list) => list.push(message),
            None => tracing::warn!(entry = %message, "invalid entry with no invalidity list to record it"),
        }
    }

    pub fn invalidity_depth(&self) -> usize {
        self.invalidities.len()
    }

    /// Write one tagged anchor, logging an invalidity if it could not be
    /// written safely.
    pub fn save_anchor<T>(&mut self, anchor: &mut TaggedSafeAnchor<T>) -> Result<Value>
    where
        T: Serialize + DeserializeOwned + Default + std::fmt::Display,
    {
        let node = anchor.save(&self.types)?;
        if let Some(reason) = anchor.failure() {
            tracing::error!(tag = %anchor.tag(), %reason, "could not save entry");
            self.log_invalidity(format!("{}: {reason}", anchor.tag()));
        }
        Ok(node)
    }

    /// Read one tagged anchor, logging an invalidity if it failed.
    pub fn load_anchor<T>(&mut self, node: &Value) -> TaggedSafeAnchor<T>
    where
        T: Serialize + DeserializeOwned + Default + std::fmt::Display,
    {
        let anchor = TaggedSafeAnchor::<T>::load(node, &self.types);
        if let Some(reason) = anchor.failure() {
            tracing::warn!(tag = %anchor.tag(), %reason, "could not load entry");
            self.log_invalidity(format!("{}: {reason}", anchor.tag()));
        }
        anchor
    }
}
