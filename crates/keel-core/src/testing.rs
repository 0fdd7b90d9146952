//! Small modules shared by the unit tests.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

use crate::container::ModuleContainer;
use crate::error::Result;
use crate::key::NameKey;
use crate::module::{ConstructModule, DynModuleHandle, Module, ModuleContext, ModuleHandle};
use crate::registry::ModuleRegistry;
use crate::requires::{Dependencies, Requires};
use crate::state::{StateAccess, StateSlot};

/// Register a module that takes no arguments, panicking on failure.
pub fn register<M>(registry: &mut ModuleRegistry, container: &dyn ModuleContainer) -> ModuleHandle<M>
where
    M: ConstructModule<()>,
{
    match registry.register_module_for_container::<M, _>(container, ()) {
        Ok(handle) => handle,
        Err(err) => panic!("registering {} failed: {err}", std::any::type_name::<M>()),
    }
}

macro_rules! plain_module {
    ($name:ident, $id:literal) => {
        #[derive(Debug, Default)]
        pub struct $name;

        impl Module for $name {
            fn id(&self) -> &str {
                $id
            }
        }

        impl ConstructModule<()> for $name {
            fn construct(_: &ModuleContext<'_>, _: ()) -> Result<Self> {
                Ok(Self)
            }
        }
    };
}

plain_module!(Camera, "test.camera");
plain_module!(Lights, "test.lights");
// Different type, same id as `Camera`.
plain_module!(CameraAlias, "test.camera");

/// Needs a camera and lights in its container.
pub struct Rig {
    pub deps: Dependencies,
}

impl Module for Rig {
    fn id(&self) -> &str {
        "test.rig"
    }
}

impl ConstructModule<()> for Rig {
    fn construct(cx: &ModuleContext<'_>, _: ()) -> Result<Self> {
        let deps = Requires::new(cx).siblings::<(Camera, Lights)>()?.build();
        Ok(Self { deps })
    }
}

/// A module that is also a container for other modules.
#[derive(Debug, Default)]
pub struct Scene;

impl Module for Scene {
    fn id(&self) -> &str {
        "test.scene"
    }
}

impl ModuleContainer for Scene {
    fn container_id(&self) -> &str {
        self.id()
    }
}

impl ConstructModule<()> for Scene {
    fn construct(_: &ModuleContext<'_>, _: ()) -> Result<Self> {
        Ok(Self)
    }
}

/// A container module that records which modules joined it.
#[derive(Debug, Default)]
pub struct Stage {
    pub joined: RefCell<Vec<String>>,
}

impl Module for Stage {
    fn id(&self) -> &str {
        "test.stage"
    }
}

impl ModuleContainer for Stage {
    fn container_id(&self) -> &str {
        self.id()
    }

    fn on_module_registered(&self, module: &DynModuleHandle) {
        let id = module.borrow().id().to_string();
        self.joined.borrow_mut().push(id);
    }
}

impl ConstructModule<()> for Stage {
    fn construct(_: &ModuleContext<'_>, _: ()) -> Result<Self> {
        Ok(Self::default())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i32,
    pub label: String,
}

impl NameKey for CounterState {
    const NAME: &'static str = "test.counter_state";
}

pub fn counter_state(value: i32, label: &str) -> CounterState {
    CounterState {
        value,
        label: label.to_string(),
    }
}

#[derive(Debug)]
pub struct Counter {
    id: &'static str,
    pub slot: StateSlot<CounterState>,
}

impl Module for Counter {
    fn id(&self) -> &str {
        self.id
    }

    fn persistent_state(&self) -> Option<&dyn StateAccess> {
        Some(&self.slot)
    }
}

impl ConstructModule<()> for Counter {
    fn construct(cx: &ModuleContext<'_>, _: ()) -> Result<Self> {
        <Self as ConstructModule<(&'static str, i32)>>::construct(cx, ("test.counter", 0))
    }
}

impl ConstructModule<(&'static str, i32)> for Counter {
    fn construct(_: &ModuleContext<'_>, (id, value): (&'static str, i32)) -> Result<Self> {
        Ok(Self {
            id,
            slot: StateSlot::new(counter_state(value, "")),
        })
    }
}

/// State type that tests deliberately leave unregistered.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JournalState {
    pub entries: Vec<String>,
}

impl NameKey for JournalState {
    const NAME: &'static str = "test.journal_state";
}

#[derive(Debug, Default)]
pub struct Journal {
    pub slot: StateSlot<JournalState>,
}

impl Module for Journal {
    fn id(&self) -> &str {
        "test.journal"
    }

    fn persistent_state(&self) -> Option<&dyn StateAccess> {
        Some(&self.slot)
    }
}

impl ConstructModule<()> for Journal {
    fn construct(_: &ModuleContext<'_>, _: ()) -> Result<Self> {
        Ok(Self::default())
    }
}
