use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Context, Result};

use keel_config::KeelConfig;
use keel_core::container::{Container, ModuleContainer};
use keel_core::event::Handled;
use keel_core::module::ModuleHandle;
use keel_core::registry::LoadReport;
use keel_core::tick::{Tick, TickCounter};
use keel_core::Runtime;
use keel_mod_counter::{CounterModule, CounterOptions, Increment, Milestone, COUNTER_ID};

use crate::events::{self, FrameEnded, FrameWillBegin, KeyPressed};

/// What one [`Host::run`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    /// Queued events flushed across all ticks.
    pub flushed: usize,
    pub unhandled_keys: Vec<char>,
    pub tps: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ran {} ticks ({:.1} tps), flushed {} queued events",
            self.ticks, self.tps, self.flushed
        )?;
        if !self.unhandled_keys.is_empty() {
            let keys: String = self.unhandled_keys.iter().collect();
            write!(f, ", unhandled keys: {keys}")?;
        }
        Ok(())
    }
}

/// Headless driver of one [`Runtime`].
///
/// Each tick flushes queued events, raises [`FrameWillBegin`], delivers the
/// scripted key for that tick, updates every module and raises
/// [`FrameEnded`].
pub struct Host {
    runtime: Runtime,
    root: Container,
    ticks: TickCounter,
    frames: Rc<Cell<u64>>,
    milestones: Rc<RefCell<Vec<i64>>>,
    counter: Option<ModuleHandle<CounterModule>>,
}

impl Host {
    pub fn new(config: &KeelConfig) -> Result<Self> {
        let mut runtime = Runtime::new();
        let root = Container::new(config.runtime.container.clone());
        events::register_core_events(runtime.events_mut())
            .context("failed to register core events")?;
        keel_mod_counter::register_events(runtime.events_mut())?;

        let frames = Rc::new(Cell::new(0));
        let seen = frames.clone();
        runtime
            .events_mut()
            .register_event_handler::<FrameEnded, _>(move |_| seen.set(seen.get() + 1))?;

        let milestones = Rc::new(RefCell::new(Vec::new()));
        let reached = milestones.clone();
        runtime
            .events_mut()
            .register_event_handler::<Milestone, _>(move |&(count,)| {
                tracing::info!(count, "counter milestone");
                reached.borrow_mut().push(count);
            })?;

        let counter = if config.module_enabled(COUNTER_ID) {
            let counter = keel_mod_counter::install(&mut runtime, &root, CounterOptions::default())
                .context("failed to install counter module")?;
            bind_counter_keys(&mut runtime, &counter)?;
            Some(counter)
        } else {
            tracing::info!(module = COUNTER_ID, "module disabled by config");
            None
        };

        runtime.init_modules()?;
        tracing::info!(
            container = %root.container_id(),
            modules = runtime.modules().len(),
            events = runtime.events().len(),
            "host ready"
        );

        Ok(Self {
            runtime,
            root,
            ticks: TickCounter::default(),
            frames,
            milestones,
            counter,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn root(&self) -> &Container {
        &self.root
    }

    pub fn counter(&self) -> Option<&ModuleHandle<CounterModule>> {
        self.counter.as_ref()
    }

    /// Number of [`FrameEnded`] events raised so far.
    pub fn frames(&self) -> u64 {
        self.frames.get()
    }

    /// Counter milestones seen so far, oldest first.
    pub fn milestones(&self) -> Vec<i64> {
        self.milestones.borrow().clone()
    }

    /// Run `count` ticks. `keys[i]` is pressed during tick `i`.
    pub fn run(&mut self, count: u64, keys: &[char]) -> Result<RunSummary> {
        let mut summary = RunSummary {
            ticks: 0,
            flushed: 0,
            unhandled_keys: Vec::new(),
            tps: 0.0,
        };
        for i in 0..count {
            let key = usize::try_from(i).ok().and_then(|i| keys.get(i)).copied();
            let (tick, flushed) = self.step(key, &mut summary.unhandled_keys)?;
            summary.flushed += flushed;
            summary.ticks += 1;
            tracing::trace!(tick = tick.index, flushed, "tick done");
        }
        summary.tps = self.ticks.tps();
        Ok(summary)
    }

    fn step(&mut self, key: Option<char>, unhandled: &mut Vec<char>) -> Result<(Tick, usize)> {
        let tick = self.ticks.tick(Instant::now());
        let manager = self.runtime.events_mut();
        let flushed = manager.handle_enqueued_events();
        manager.dispatch_event::<FrameWillBegin>((tick.index,))?;

        if let Some(key) = key {
            if !events::press_key(manager, key)? {
                match key.to_digit(10) {
                    Some(amount) => manager.enqueue_event::<Increment>((i64::from(amount),))?,
                    None => {
                        tracing::debug!(%key, "key not handled");
                        unhandled.push(key);
                    }
                }
            }
        }

        self.runtime.update_modules(&tick)?;
        self.runtime
            .events_mut()
            .dispatch_event::<FrameEnded>((tick.index, tick.delta))?;
        Ok((tick, flushed))
    }

    pub fn load(&mut self, path: &Path) -> Result<LoadReport> {
        let report = self.runtime.load_project_file(path)?;
        for line in report.diagnostics() {
            tracing::warn!(path = %path.display(), "{line}");
        }
        Ok(report)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        let report = self.runtime.save_project_file(path)?;
        for failed in &report.failed {
            tracing::warn!(path = %path.display(), "{failed}");
        }
        Ok(())
    }

    pub fn shutdown(mut self) {
        self.runtime.cleanup();
        tracing::info!("host stopped");
    }
}

/// `r` resets the counter, `+` and `-` nudge it by one.
fn bind_counter_keys(runtime: &mut Runtime, counter: &ModuleHandle<CounterModule>) -> Result<()> {
    let weak = Rc::downgrade(counter);
    runtime
        .events_mut()
        .register_event_handler::<KeyPressed, _>(move |&(key,)| {
            let Some(counter) = weak.upgrade() else {
                return Handled(false);
            };
            let Ok(counter) = counter.try_borrow() else {
                return Handled(false);
            };
            match key {
                'r' => counter.reset(),
                '+' => counter.add(1),
                '-' => counter.add(-1),
                _ => return Handled(false),
            }
            Handled(true)
        })?;
    Ok(())
}
