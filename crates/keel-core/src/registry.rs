use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::container::{ContainerView, ModuleContainer};
use crate::error::{Result, RuntimeError};
use crate::key::{ModuleContainerId, ModuleId, TypeKey};
use crate::module::{ConstructModule, DynModuleHandle, Module, ModuleContext, ModuleHandle};
use crate::serialization::{
    InputArchive, InvalidityList, OutputArchive, SerializationManager, TaggedSafeAnchor,
};
use crate::state::ModuleState;

/// Name of the collection holding module states in a project document.
pub const MODULE_STATES_KEY: &str = "moduleStates";

struct ModuleEntry {
    module: DynModuleHandle,
    typed: Rc<dyn Any>,
    type_key: TypeKey,
    container: ModuleContainerId,
}

/// Reads and replaces the persistent state of one module.
struct StateSerializer {
    module: DynModuleHandle,
}

impl StateSerializer {
    fn snapshot(&self, id: &str) -> Result<Option<Rc<dyn ModuleState>>> {
        let module = self
            .module
            .try_borrow()
            .map_err(|_| RuntimeError::ModuleBusy { module: id.into() })?;
        Ok(module.persistent_state().map(|slot| slot.get_state()))
    }

    fn restore(&self, state: Rc<dyn ModuleState>) -> std::result::Result<(), String> {
        let module = self
            .module
            .try_borrow()
            .map_err(|_| "module is busy".to_string())?;
        let slot = module
            .persistent_state()
            .ok_or_else(|| "module no longer exposes a state".to_string())?;
        slot.set_state(state).map_err(|err| err.to_string())
    }
}

/// An entry that was not written or not restored, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedState {
    pub module: ModuleId,
    pub reason: String,
}

impl SkippedState {
    fn new(module: impl Into<ModuleId>, reason: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SkippedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.module, self.reason)
    }
}

/// Outcome of [`ModuleRegistry::save_module_states`].
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    pub saved: Vec<ModuleId>,
    /// Written as empty entries because their state type is unknown.
    pub failed: Vec<SkippedState>,
    pub invalidities: InvalidityList,
}

impl SaveReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`ModuleRegistry::load_module_states`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub restored: Vec<ModuleId>,
    pub skipped: Vec<SkippedState>,
    /// Lines recorded by the safe anchors while reading.
    pub invalidities: InvalidityList,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.skipped.iter().map(ToString::to_string).collect()
    }

    fn skip(&mut self, module: impl Into<ModuleId>, reason: impl Into<String>) {
        let skipped = SkippedState::new(module, reason);
        tracing::debug!(module = %skipped.module, reason = %skipped.reason, "skipping module state");
        self.skipped.push(skipped);
    }
}

/// Owns every module in a runtime and records which container each belongs
/// to.
///
/// A module id is unique across all containers and each module type is
/// registered at most once. Lookups never fail; they return `None`/`false`.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleId, ModuleEntry>,
    order: Vec<ModuleId>,
    containers: HashMap<ModuleContainerId, BTreeSet<ModuleId>>,
    type_ids: HashMap<TypeKey, ModuleId>,
    state_serializers: BTreeMap<ModuleId, StateSerializer>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct `M` from `args` inside `container` and register it.
    ///
    /// Construction runs first, so dependency declarations see the registry
    /// as it is before the new module joins. On any error the registry is
    /// left unchanged.
    pub fn register_module_for_container<M, A>(
        &mut self,
        container: &dyn ModuleContainer,
        args: A,
    ) -> Result<ModuleHandle<M>>
    where
        M: ConstructModule<A>,
    {
        let module = M::construct(&ModuleContext::new(self, container), args)?;
        let id = module.id().to_string();
        if self.modules.contains_key(&id) {
            return Err(RuntimeError::DuplicateModuleId { id });
        }
        let type_key = TypeKey::of::<M>();
        if let Some(existing) = self.type_ids.get(&type_key) {
            return Err(RuntimeError::DuplicateModuleType {
                type_name: type_key.name(),
                existing: existing.clone(),
            });
        }

        let container_id = container.container_id().to_string();
        let stateful = module.persistent_state().is_some();
        let handle = Rc::new(RefCell::new(module));
        let dyn_handle: DynModuleHandle = handle.clone();

        if stateful {
            self.state_serializers.insert(
                id.clone(),
                StateSerializer {
                    module: dyn_handle.clone(),
                },
            );
        }
        self.containers
            .entry(container_id.clone())
            .or_default()
            .insert(id.clone());
        self.type_ids.insert(type_key, id.clone());
        self.order.push(id.clone());
        self.modules.insert(
            id.clone(),
            ModuleEntry {
                module: dyn_handle.clone(),
                typed: handle.clone(),
                type_key,
                container: container_id.clone(),
            },
        );

        tracing::info!(module = %id, container = %container_id, stateful, "registered module");
        container.on_module_registered(&dyn_handle);
        Ok(handle)
    }

    pub fn is_registered(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    pub fn container_has_module(&self, container_id: &str, module_id: &str) -> bool {
        self.containers
            .get(container_id)
            .is_some_and(|ids| ids.contains(module_id))
    }

    pub fn get_module(&self, module_id: &str) -> Option<DynModuleHandle> {
        self.modules.get(module_id).map(|entry| entry.module.clone())
    }

    pub fn get_typed<M: Module>(&self, module_id: &str) -> Option<ModuleHandle<M>> {
        let entry = self.modules.get(module_id)?;
        entry.typed.clone().downcast::<RefCell<M>>().ok()
    }

    pub fn get_module_for_container(
        &self,
        container_id: &str,
        module_id: &str,
    ) -> Option<DynModuleHandle> {
        if !self.container_has_module(container_id, module_id) {
            return None;
        }
        self.get_module(module_id)
    }

    pub fn get_typed_for_container<M: Module>(
        &self,
        container_id: &str,
        module_id: &str,
    ) -> Option<ModuleHandle<M>> {
        if !self.container_has_module(container_id, module_id) {
            return None;
        }
        self.get_typed::<M>(module_id)
    }

    pub fn get_module_ids_for_container(&self, container_id: &str) -> Option<&BTreeSet<ModuleId>> {
        self.containers.get(container_id)
    }

    pub fn get_module_id_for_type_id(&self, key: TypeKey) -> Option<&ModuleId> {
        self.type_ids.get(&key)
    }

    /// The container a module was registered into.
    pub fn container_of(&self, module_id: &str) -> Option<&str> {
        self.modules
            .get(module_id)
            .map(|entry| entry.container.as_str())
    }

    pub fn type_of(&self, module_id: &str) -> Option<TypeKey> {
        self.modules.get(module_id).map(|entry| entry.type_key)
    }

    pub fn container<'a>(&'a self, container_id: &'a str) -> ContainerView<'a> {
        ContainerView::new(self, container_id)
    }

    /// All module ids, sorted.
    pub fn module_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.order.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// All modules in registration order.
    pub fn modules(&self) -> impl Iterator<Item = &DynModuleHandle> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.modules.get(id).map(|entry| &entry.module))
    }

    pub fn has_persistent_state(&self, module_id: &str) -> bool {
        self.state_serializers.contains_key(module_id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Write the state of every stateful module into `archive`, ordered by
    /// module id.
    ///
    /// A state whose type is unknown to `serialization` is written as an
    /// empty entry and reported; serializer errors abort the save.
    pub fn save_module_states(
        &self,
        archive: &mut OutputArchive,
        serialization: &mut SerializationManager,
    ) -> Result<SaveReport> {
        serialization.push_invalidity_list();
        let written = self.write_states(serialization);
        let invalidities = serialization.pop_invalidity_list().unwrap_or_default();
        let (nodes, mut report) = written?;
        report.invalidities = invalidities;

        archive.save_value(MODULE_STATES_KEY, Value::Array(nodes));
        if !report.is_clean() {
            tracing::error!(
                failed = report.failed.len(),
                "some module states could not be saved; register their state types"
            );
        }
        tracing::info!(saved = report.saved.len(), "saved module states");
        Ok(report)
    }

    fn write_states(
        &self,
        serialization: &mut SerializationManager,
    ) -> Result<(Vec<Value>, SaveReport)> {
        let mut nodes = Vec::with_capacity(self.state_serializers.len());
        let mut report = SaveReport::default();
        for (id, serializer) in &self.state_serializers {
            let Some(state) = serializer.snapshot(id)? else {
                continue;
            };
            let mut anchor = TaggedSafeAnchor::new(id.clone(), state);
            nodes.push(serialization.save_anchor(&mut anchor)?);
            match anchor.failure() {
                None => report.saved.push(id.clone()),
                Some(reason) => report.failed.push(SkippedState::new(id.as_str(), reason)),
            }
        }
        Ok((nodes, report))
    }

    /// Restore module states from `archive`.
    ///
    /// Entries that cannot be applied (unreadable, unknown module, module
    /// without state, mismatched state type) are skipped and reported; only
    /// a missing or malformed state collection is an error.
    pub fn load_module_states(
        &self,
        archive: &InputArchive,
        serialization: &mut SerializationManager,
    ) -> Result<LoadReport> {
        let nodes = archive.load_collection(MODULE_STATES_KEY)?;
        serialization.push_invalidity_list();

        let mut report = LoadReport::default();
        for node in nodes {
            let anchor: TaggedSafeAnchor<ModuleId> = serialization.load_anchor(node);
            let (id, anchor) = anchor.into_parts();
            if let Some(reason) = anchor.failure() {
                report.skip(id, reason);
                continue;
            }
            let Some(state) = anchor.into_value() else {
                report.skip(id, "entry has no value");
                continue;
            };
            if !self.is_registered(&id) {
                report.skip(id, "module is not registered");
                continue;
            }
            let Some(serializer) = self.state_serializers.get(&id) else {
                report.skip(id, "module has no persistent state");
                continue;
            };
            match serializer.restore(state) {
                Ok(()) => report.restored.push(id),
                Err(reason) => report.skip(id, reason),
            }
        }

        report.invalidities = serialization.pop_invalidity_list().unwrap_or_default();
        if !report.is_clean() {
            tracing::warn!(
                skipped = report.skipped.len(),
                restored = report.restored.len(),
                "some module states were not restored: {}",
                report.diagnostics().join("; ")
            );
        }
        Ok(report)
    }

    /// Forget every module, container and serializer.
    pub fn cleanup(&mut self) {
        tracing::debug!(modules = self.modules.len(), "clearing module registry");
        self.modules.clear();
        self.order.clear();
        self.containers.clear();
        self.type_ids.clear();
        self.state_serializers.clear();
    }
}
