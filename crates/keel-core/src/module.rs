use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::container::{ContainerView, ModuleContainer};
use crate::error::Result;
use crate::event::EventSender;
use crate::registry::ModuleRegistry;
use crate::state::StateAccess;
use crate::tick::Tick;

/// Shared handle to a registered module of a known type.
pub type ModuleHandle<M> = Rc<RefCell<M>>;

/// Shared handle to a registered module of any type.
pub type DynModuleHandle = Rc<RefCell<dyn Module>>;

/// A pluggable Keel module.
///
/// Modules are constructed and owned by the
/// [`ModuleRegistry`](crate::registry::ModuleRegistry). Each provides a
/// unique [`id`](Module::id) and may expose a persistent state through
/// [`persistent_state`](Module::persistent_state), which the registry then
/// saves and restores with the project document.
pub trait Module: Any {
    /// Unique identifier across every container (e.g. `"keel.counter"`).
    fn id(&self) -> &str;

    /// Human-readable name; defaults to the id.
    fn title(&self) -> &str {
        self.id()
    }

    /// Called once by the host after every module is registered.
    fn init(&mut self, _events: &EventSender) {}

    /// Called once per tick of the host loop. Events sent here are handled
    /// at the start of the next tick.
    fn update(&mut self, _tick: &Tick, _events: &EventSender) {}

    /// Called once before the registry is cleared.
    fn shutdown(&mut self) {}

    fn persistent_state(&self) -> Option<&dyn StateAccess> {
        None
    }
}

/// Construction of a module from an argument tuple.
///
/// A module can implement this for several argument types; registering with
/// an argument tuple no implementation accepts does not compile.
pub trait ConstructModule<Args>: Module + Sized {
    fn construct(cx: &ModuleContext<'_>, args: Args) -> Result<Self>;
}

/// What a module sees while it is being constructed: the registry as it is
/// right now and the container it is being registered into.
#[derive(Clone, Copy)]
pub struct ModuleContext<'a> {
    registry: &'a ModuleRegistry,
    container: &'a dyn ModuleContainer,
}

impl<'a> ModuleContext<'a> {
    pub fn new(registry: &'a ModuleRegistry, container: &'a dyn ModuleContainer) -> Self {
        Self {
            registry,
            container,
        }
    }

    pub fn registry(&self) -> &'a ModuleRegistry {
        self.registry
    }

    pub fn container(&self) -> &'a dyn ModuleContainer {
        self.container
    }

    pub fn container_id(&self) -> &'a str {
        self.container.container_id()
    }

    /// Membership queries against the target container.
    pub fn view(&self) -> ContainerView<'a> {
        self.registry.container(self.container.container_id())
    }
}
