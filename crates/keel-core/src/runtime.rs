use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::Context;

use crate::error::{Result, RuntimeError};
use crate::event::EventManager;
use crate::module::DynModuleHandle;
use crate::registry::{LoadReport, ModuleRegistry, SaveReport};
use crate::serialization::SerializationManager;
use crate::state::PersistentState;
use crate::tick::Tick;

/// One module runtime: the module registry, the event manager and the
/// serialization manager, owned together and passed around by reference.
///
/// Separate runtimes share nothing, so tests build a fresh one each.
#[derive(Default)]
pub struct Runtime {
    modules: ModuleRegistry,
    events: EventManager,
    serialization: SerializationManager,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.modules
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventManager {
        &mut self.events
    }

    pub fn serialization(&self) -> &SerializationManager {
        &self.serialization
    }

    pub fn serialization_mut(&mut self) -> &mut SerializationManager {
        &mut self.serialization
    }

    /// Allow states of type `S` to be written to and read from documents.
    pub fn register_state_type<S: PersistentState>(&mut self) -> Result<()> {
        self.serialization.register_state::<S>()
    }

    /// Call [`Module::init`](crate::module::Module::init) on every module in
    /// registration order.
    pub fn init_modules(&self) -> Result<()> {
        let events = self.events.sender();
        self.for_each_module(|module| module.init(&events))
    }

    pub fn update_modules(&self, tick: &Tick) -> Result<()> {
        let events = self.events.sender();
        self.for_each_module(|module| module.update(tick, &events))
    }

    fn for_each_module<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn crate::module::Module),
    {
        let handles: Vec<DynModuleHandle> = self.modules.modules().cloned().collect();
        for handle in handles {
            let mut module = handle.try_borrow_mut().map_err(|_| RuntimeError::ModuleBusy {
                module: module_id(&handle),
            })?;
            f(&mut *module);
        }
        Ok(())
    }

    pub fn save_project<W: Write>(&mut self, writer: W) -> Result<SaveReport> {
        let mut archive = self.serialization.begin_save();
        let report = self
            .modules
            .save_module_states(&mut archive, &mut self.serialization)?;
        archive.write_to(writer)?;
        self.serialization.finish();
        Ok(report)
    }

    pub fn load_project<R: Read>(&mut self, reader: R) -> Result<LoadReport> {
        let archive = self.serialization.begin_load(reader)?;
        let report = self
            .modules
            .load_module_states(&archive, &mut self.serialization)?;
        self.serialization.finish();
        Ok(report)
    }

    pub fn save_project_file(&mut self, path: &Path) -> anyhow::Result<SaveReport> {
        let file = File::create(path)
            .with_context(|| format!("failed to create project file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let report = self
            .save_project(&mut writer)
            .with_context(|| format!("failed to save project: {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to write project file: {}", path.display()))?;
        tracing::info!(path = %path.display(), modules = report.saved.len(), "project saved");
        Ok(report)
    }

    pub fn load_project_file(&mut self, path: &Path) -> anyhow::Result<LoadReport> {
        let file = File::open(path)
            .with_context(|| format!("failed to open project file: {}", path.display()))?;
        let report = self
            .load_project(BufReader::new(file))
            .with_context(|| format!("failed to load project: {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            "project loaded"
        );
        Ok(report)
    }

    /// Shut every module down in reverse registration order, then clear the
    /// registry, every event and the serialization stack. Modules that are
    /// borrowed elsewhere are dropped without their shutdown hook.
    pub fn cleanup(&mut self) {
        let handles: Vec<DynModuleHandle> = self.modules.modules().cloned().collect();
        for handle in handles.iter().rev() {
            match handle.try_borrow_mut() {
                Ok(mut module) => module.shutdown(),
                Err(_) => tracing::warn!(module = %module_id(handle), "module busy during shutdown"),
            }
        }
        self.modules.cleanup();
        self.events.cleanup();
        self.serialization.finish();
    }
}

fn module_id(handle: &DynModuleHandle) -> String {
    handle
        .try_borrow()
        .map(|module| module.id().to_string())
        .unwrap_or_else(|_| "<busy>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::define_event;
    use crate::event::{EventResult, EventSender};
    use crate::module::{ConstructModule, Module, ModuleContext};
    use crate::testing::{counter_state, Counter, CounterState, Journal, JournalState};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    define_event!(struct Nudged(i32) -> EventResult);

    struct Lifecycle {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Module for Lifecycle {
        fn id(&self) -> &str {
            "test.lifecycle"
        }

        fn init(&mut self, _: &EventSender) {
            self.log.borrow_mut().push("init".into());
        }

        fn update(&mut self, tick: &Tick, _: &EventSender) {
            self.log.borrow_mut().push(format!("update {}", tick.index));
        }

        fn shutdown(&mut self) {
            self.log.borrow_mut().push("shutdown".into());
        }
    }

    impl ConstructModule<Rc<RefCell<Vec<String>>>> for Lifecycle {
        fn construct(_: &ModuleContext<'_>, log: Rc<RefCell<Vec<String>>>) -> Result<Self> {
            Ok(Self { log })
        }
    }

    fn runtime_with_counter(app: &Container) -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_state_type::<CounterState>().unwrap();
        runtime
            .modules_mut()
            .register_module_for_container::<Counter, _>(app, ())
            .unwrap();
        runtime
    }

    #[test]
    fn lifecycle_hooks_run_in_order() {
        let app = Container::new("app");
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut runtime = Runtime::new();
        runtime
            .modules_mut()
            .register_module_for_container::<Lifecycle, _>(&app, log.clone())
            .unwrap();

        runtime.init_modules().unwrap();
        let tick = Tick {
            index: 3,
            now: Instant::now(),
            delta: std::time::Duration::ZERO,
        };
        runtime.update_modules(&tick).unwrap();
        runtime.cleanup();

        assert_eq!(log.borrow().as_slice(), &["init", "update 3", "shutdown"]);
        assert!(runtime.modules().is_empty());
    }

    #[test]
    fn busy_module_fails_update() {
        let app = Container::new("app");
        let runtime = runtime_with_counter(&app);
        let counter = runtime.modules().get_typed::<Counter>("test.counter").unwrap();
        let _guard = counter.borrow_mut();
        let err = runtime.init_modules().unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleBusy { .. }));
    }

    #[test]
    fn project_round_trip_through_bytes() {
        let app = Container::new("app");
        let mut runtime = runtime_with_counter(&app);
        let counter = runtime.modules().get_typed::<Counter>("test.counter").unwrap();
        counter.borrow().slot.set(counter_state(42, "Test String"));

        let mut buf = Vec::new();
        let saved = runtime.save_project(&mut buf).unwrap();
        assert!(saved.is_clean());

        let mut fresh = runtime_with_counter(&app);
        let report = fresh.load_project(buf.as_slice()).unwrap();
        assert!(report.is_clean());
        let restored = fresh.modules().get_typed::<Counter>("test.counter").unwrap();
        assert_eq!(*restored.borrow().slot.get(), counter_state(42, "Test String"));
    }

    #[test]
    fn project_files_round_trip() {
        let dir = std::env::temp_dir().join(format!("keel-runtime-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("project.json");

        let app = Container::new("app");
        let mut runtime = runtime_with_counter(&app);
        runtime
            .modules()
            .get_typed::<Counter>("test.counter")
            .unwrap()
            .borrow()
            .slot
            .set(counter_state(5, "file"));
        runtime.save_project_file(&path).unwrap();

        let mut fresh = runtime_with_counter(&app);
        fresh.load_project_file(&path).unwrap();
        let value = fresh
            .modules()
            .get_typed::<Counter>("test.counter")
            .unwrap()
            .borrow()
            .slot
            .get()
            .value;
        assert_eq!(value, 5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_project_file_has_context() {
        let mut runtime = Runtime::new();
        let err = runtime
            .load_project_file(Path::new("/definitely/not/here.json"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to open project file"));
    }

    #[test]
    fn loading_garbage_is_an_error() {
        let mut runtime = Runtime::new();
        let err = runtime.load_project("][".as_bytes()).unwrap_err();
        assert!(matches!(err, RuntimeError::SerializationIo(_)));
    }

    #[test]
    fn unregistered_state_does_not_abort_save() {
        let app = Container::new("app");
        let mut runtime = runtime_with_counter(&app);
        runtime
            .modules_mut()
            .register_module_for_container::<Journal, _>(&app, ())
            .unwrap();

        let mut buf = Vec::new();
        let report = runtime.save_project(&mut buf).unwrap();
        assert_eq!(report.failed.len(), 1);

        // The empty entry is skipped even once the type is known.
        let mut fresh = runtime_with_counter(&app);
        fresh.register_state_type::<JournalState>().unwrap();
        fresh
            .modules_mut()
            .register_module_for_container::<Journal, _>(&app, ())
            .unwrap();
        let loaded = fresh.load_project(buf.as_slice()).unwrap();
        assert_eq!(loaded.restored, vec!["test.counter".to_string()]);
        assert_eq!(loaded.skipped.len(), 1);
    }

    /// Sends one `Nudged` per update, carrying the tick index.
    struct Nudger;

    impl Module for Nudger {
        fn id(&self) -> &str {
            "test.nudger"
        }

        fn update(&mut self, tick: &Tick, events: &EventSender) {
            if let Err(err) = events.enqueue_event::<Nudged>((tick.index as i32,)) {
                panic!("nudge not sent: {err}");
            }
        }
    }

    impl ConstructModule<()> for Nudger {
        fn construct(_: &ModuleContext<'_>, _: ()) -> Result<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn module_update_publishes_for_next_flush() {
        let app = Container::new("app");
        let mut runtime = Runtime::new();
        runtime.events_mut().register_event::<Nudged>().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        runtime
            .events_mut()
            .register_event_handler::<Nudged, _>(move |&(n,)| {
                s.borrow_mut().push(n);
                EventResult::handled()
            })
            .unwrap();
        runtime
            .modules_mut()
            .register_module_for_container::<Nudger, _>(&app, ())
            .unwrap();

        let mut ticks = crate::tick::TickCounter::default();
        let start = Instant::now();
        for n in 0..3u64 {
            runtime.events_mut().handle_enqueued_events();
            let tick = ticks.tick(start + std::time::Duration::from_millis(n * 10));
            runtime.update_modules(&tick).unwrap();
        }
        assert_eq!(seen.borrow().as_slice(), &[0, 1]);
        assert_eq!(runtime.events().pending_events(), 1);
    }

    #[test]
    fn cleanup_resets_events_too() {
        let mut runtime = Runtime::new();
        runtime.events_mut().register_event::<Nudged>().unwrap();
        runtime.cleanup();
        assert!(!runtime.events().is_registered::<Nudged>());
        runtime.events_mut().register_event::<Nudged>().unwrap();
    }
}
