//! Dependency declarations evaluated while a module is constructed.
//!
//! ```ignore
//! let deps = Requires::new(cx)
//!     .container::<Clock>()?
//!     .siblings::<(Camera, Lights)>()?
//!     .build();
//! let camera = deps.get::<Camera>(cx.registry())?;
//! ```
//!
//! Each requirement is checked as soon as it is declared, left to right, so
//! the first unmet one aborts construction.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::rc::Rc;

use crate::container::{ModuleContainer, ModuleSet};
use crate::error::{Result, RuntimeError};
use crate::key::{ModuleContainerId, ModuleId, TypeKey};
use crate::module::{Module, ModuleContext, ModuleHandle};
use crate::registry::ModuleRegistry;

#[derive(Clone)]
enum Declared {
    /// Looked up in the owning container on every access.
    Sibling,
    /// A caller-supplied module, looked up by id on every access.
    Associated { module: ModuleId },
}

/// Builder for a module's [`Dependencies`].
pub struct Requires<'a> {
    cx: ModuleContext<'a>,
    declared: Vec<(TypeKey, Declared)>,
    capabilities: Vec<(TypeKey, Rc<dyn Any>)>,
}

impl<'a> Requires<'a> {
    pub fn new(cx: &ModuleContext<'a>) -> Self {
        Self {
            cx: *cx,
            declared: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    /// Require the container to offer a `T` capability.
    pub fn container<T: 'static>(mut self) -> Result<Self> {
        let key = TypeKey::of::<T>();
        self.ensure_new(key)?;
        let container = self.cx.container();
        let service = container
            .capability(key)
            .ok_or_else(|| unmet_container::<T>(container))?;
        self.capabilities.push((key, service));
        Ok(self)
    }

    /// Require a module of type `M` in the same container.
    pub fn sibling<M: Module>(self) -> Result<Self> {
        self.siblings::<(M,)>()
    }

    /// Require every listed module type in the same container.
    pub fn siblings<S: ModuleSet>(mut self) -> Result<Self> {
        let keys = S::keys();
        for key in &keys {
            self.ensure_new(*key)?;
        }
        let missing = self.cx.view().missing::<S>();
        if !missing.is_empty() {
            return Err(RuntimeError::UnmetSiblingRequirement {
                container: self.cx.container_id().to_string(),
                missing,
            });
        }
        self.declared
            .extend(keys.into_iter().map(|key| (key, Declared::Sibling)));
        Ok(self)
    }

    /// Depend on a specific module the caller already holds, in any
    /// container. `handle` must be the instance registered under its id.
    pub fn associated<M: Module>(mut self, handle: &ModuleHandle<M>) -> Result<Self> {
        let key = TypeKey::of::<M>();
        self.ensure_new(key)?;
        let module = handle
            .try_borrow()
            .map(|m| m.id().to_string())
            .map_err(|_| RuntimeError::ModuleBusy {
                module: type_name::<M>().to_string(),
            })?;
        let registered = self
            .cx
            .registry()
            .get_typed::<M>(&module)
            .is_some_and(|registered| Rc::ptr_eq(&registered, handle));
        if !registered {
            return Err(RuntimeError::StaleAssociation {
                dependency: key.name(),
                module,
            });
        }
        self.declared.push((key, Declared::Associated { module }));
        Ok(self)
    }

    pub fn build(self) -> Dependencies {
        Dependencies {
            container_id: self.cx.container_id().to_string(),
            order: self.declared.iter().map(|(key, _)| *key).collect(),
            modules: self.declared.into_iter().collect(),
            capabilities: self.capabilities.into_iter().collect(),
        }
    }

    fn ensure_new(&self, key: TypeKey) -> Result<()> {
        let seen = self.declared.iter().any(|(k, _)| *k == key)
            || self.capabilities.iter().any(|(k, _)| *k == key);
        if seen {
            return Err(RuntimeError::DuplicateDependency {
                dependency: key.name(),
            });
        }
        Ok(())
    }
}

fn unmet_container<T: 'static>(container: &dyn ModuleContainer) -> RuntimeError {
    RuntimeError::UnmetContainerRequirement {
        required: type_name::<T>(),
        container: container.container_id().to_string(),
        found: container.describe(),
    }
}

/// The resolved dependencies of one module.
#[derive(Clone, Default)]
pub struct Dependencies {
    container_id: ModuleContainerId,
    order: Vec<TypeKey>,
    modules: HashMap<TypeKey, Declared>,
    capabilities: HashMap<TypeKey, Rc<dyn Any>>,
}

impl Dependencies {
    /// A module without dependencies.
    pub fn none() -> Self {
        Self::default()
    }

    /// The `T` capability offered by the container.
    pub fn container<T: 'static>(&self) -> Result<Rc<T>> {
        self.capabilities
            .get(&TypeKey::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
            .ok_or(RuntimeError::UndeclaredDependency {
                dependency: type_name::<T>(),
            })
    }

    /// Resolve a declared sibling or associated module.
    ///
    /// Both kinds are looked up again on every call: siblings by type in the
    /// owning container, associated modules by id. An associated module that
    /// was removed, or replaced by one of another type, is stale.
    pub fn get<M: Module>(&self, registry: &ModuleRegistry) -> Result<ModuleHandle<M>> {
        let key = TypeKey::of::<M>();
        match self.modules.get(&key) {
            Some(Declared::Sibling) => registry.container(&self.container_id).get_contained::<M>(),
            Some(Declared::Associated { module }) => {
                registry
                    .get_typed::<M>(module)
                    .ok_or_else(|| RuntimeError::StaleAssociation {
                        dependency: key.name(),
                        module: module.clone(),
                    })
            }
            None => Err(RuntimeError::UndeclaredDependency {
                dependency: key.name(),
            }),
        }
    }

    /// Every declared dependency type, capabilities excluded, in declaration
    /// order.
    pub fn declared(&self) -> &[TypeKey] {
        &self.order
    }

    pub fn is_declared<T: 'static>(&self) -> bool {
        let key = TypeKey::of::<T>();
        self.modules.contains_key(&key) || self.capabilities.contains_key(&key)
    }
}
