//! Containers group module ids; they never own modules.
//!
//! A container is anything with an id. Modules registered into it can query
//! which siblings exist through a [`ContainerView`] and can ask the container
//! for typed capabilities (shared services it offers to its members).

use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::error::{Result, RuntimeError};
use crate::key::{ModuleId, TypeKey};
use crate::module::{DynModuleHandle, Module, ModuleHandle};
use crate::registry::ModuleRegistry;

/// A named grouping that modules are registered into.
pub trait ModuleContainer {
    fn container_id(&self) -> &str;

    /// Human-readable kind of container, used in error messages.
    fn describe(&self) -> &'static str {
        type_name::<Self>()
    }

    /// A typed service this container offers, keyed by the service type.
    fn capability(&self, _key: TypeKey) -> Option<Rc<dyn Any>> {
        None
    }

    /// Called by the registry once `module` has joined this container.
    fn on_module_registered(&self, module: &DynModuleHandle) {
        if let Ok(module) = module.try_borrow() {
            tracing::debug!(
                container = self.container_id(),
                module = module.id(),
                "module joined container"
            );
        }
    }
}

/// A plain container: an id and, optionally, a set of capabilities.
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
    capabilities: Capabilities,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Capabilities::default(),
        }
    }

    /// Offer `service` to every module that requires a `T` capability.
    pub fn with_capability<T: 'static>(mut self, service: Rc<T>) -> Self {
        self.capabilities.provide(service);
        self
    }

    pub fn capabilities_mut(&mut self) -> &mut Capabilities {
        &mut self.capabilities
    }
}

impl ModuleContainer for Container {
    fn container_id(&self) -> &str {
        &self.id
    }

    fn describe(&self) -> &'static str {
        "Container"
    }

    fn capability(&self, key: TypeKey) -> Option<Rc<dyn Any>> {
        self.capabilities.get(key)
    }
}

/// Type-keyed map of shared services.
#[derive(Clone, Default)]
pub struct Capabilities {
    services: HashMap<TypeKey, Rc<dyn Any>>,
}

impl Capabilities {
    /// Insert or replace the service of type `T`.
    pub fn provide<T: 'static>(&mut self, service: Rc<T>) {
        self.services.insert(TypeKey::of::<T>(), service);
    }

    pub fn get(&self, key: TypeKey) -> Option<Rc<dyn Any>> {
        self.services.get(&key).cloned()
    }

    pub fn get_typed<T: 'static>(&self) -> Option<Rc<T>> {
        self.get(TypeKey::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(self.services.keys().map(|k| k.short_name()))
            .finish()
    }
}

/// A static list of module types, written as a tuple: `(A,)`, `(A, B)`, ...
pub trait ModuleSet {
    fn keys() -> Vec<TypeKey>;
}

macro_rules! impl_module_set {
    ($($name:ident),+) => {
        impl<$($name: Module),+> ModuleSet for ($($name,)+) {
            fn keys() -> Vec<TypeKey> {
                vec![$(TypeKey::of::<$name>()),+]
            }
        }
    };
}

impl_module_set!(A);
impl_module_set!(A, B);
impl_module_set!(A, B, C);
impl_module_set!(A, B, C, D);
impl_module_set!(A, B, C, D, E);
impl_module_set!(A, B, C, D, E, F);
impl_module_set!(A, B, C, D, E, F, G);
impl_module_set!(A, B, C, D, E, F, G, H);

/// Read-only membership queries for one container.
#[derive(Clone, Copy)]
pub struct ContainerView<'a> {
    registry: &'a ModuleRegistry,
    container_id: &'a str,
}

impl<'a> ContainerView<'a> {
    pub(crate) fn new(registry: &'a ModuleRegistry, container_id: &'a str) -> Self {
        Self {
            registry,
            container_id,
        }
    }

    pub fn container_id(&self) -> &'a str {
        self.container_id
    }

    pub fn contains_id(&self, module_id: &str) -> bool {
        self.registry
            .container_has_module(self.container_id, module_id)
    }

    pub fn contains_key(&self, key: TypeKey) -> bool {
        self.registry
            .get_module_id_for_type_id(key)
            .is_some_and(|id| self.contains_id(id))
    }

    pub fn contains<M: Module>(&self) -> bool {
        self.contains_key(TypeKey::of::<M>())
    }

    /// `true` if at least one of the listed types is registered here.
    pub fn contains_any<S: ModuleSet>(&self) -> bool {
        S::keys().into_iter().any(|key| self.contains_key(key))
    }

    /// `true` if every listed type is registered here.
    pub fn contains_all<S: ModuleSet>(&self) -> bool {
        S::keys().into_iter().all(|key| self.contains_key(key))
    }

    /// Listed types that are not registered here, by type name.
    pub fn missing<S: ModuleSet>(&self) -> Vec<&'static str> {
        S::keys()
            .into_iter()
            .filter(|key| !self.contains_key(*key))
            .map(|key| key.name())
            .collect()
    }

    pub fn get_maybe_contained<M: Module>(&self) -> Option<ModuleHandle<M>> {
        let id = self
            .registry
            .get_module_id_for_type_id(TypeKey::of::<M>())?;
        self.registry
            .get_typed_for_container::<M>(self.container_id, id)
    }

    pub fn get_contained<M: Module>(&self) -> Result<ModuleHandle<M>> {
        self.get_maybe_contained::<M>()
            .ok_or_else(|| RuntimeError::ModuleNotContained {
                container: self.container_id.to_string(),
                module: type_name::<M>().to_string(),
            })
    }

    pub fn module_ids(&self) -> Option<&'a BTreeSet<ModuleId>> {
        self.registry.get_module_ids_for_container(self.container_id)
    }

    /// Every module registered here, ordered by id.
    pub fn all_modules(&self) -> Vec<DynModuleHandle> {
        self.module_ids()
            .into_iter()
            .flatten()
            .filter_map(|id| {
                self.registry
                    .get_module_for_container(self.container_id, id)
            })
            .collect()
    }
}
