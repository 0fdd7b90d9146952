use std::rc::Rc;

use serde::{Deserialize, Serialize};

use keel_core::container::ModuleContainer;
use keel_core::define_event;
use keel_core::event::{EventManager, EventResult, EventSender};
use keel_core::key::NameKey;
use keel_core::module::{ConstructModule, Module, ModuleContext, ModuleHandle};
use keel_core::state::{StateAccess, StateSlot};
use keel_core::tick::Tick;
use keel_core::{Result, Runtime};

pub const COUNTER_ID: &str = "keel.counter";

define_event!(
    /// Add the given amount to every subscribed counter.
    pub struct Increment(i64) -> EventResult
);
define_event!(
    /// Set the counter back to zero. Consumed by the first counter that sees it.
    pub struct Reset() -> EventResult
);
define_event!(
    /// Sent by the counter when its count passes a multiple of
    /// [`CounterOptions::milestone`]. Carries that multiple.
    pub struct Milestone(i64)
);

/// Persistent state of [`CounterModule`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterState {
    pub count: i64,
    pub ticks_seen: u64,
}

impl NameKey for CounterState {
    const NAME: &'static str = "keel.counter.state";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOptions {
    /// Added to the count on every tick.
    pub step: i64,
    /// Spacing of [`Milestone`] events; zero or less turns them off.
    pub milestone: i64,
}

impl Default for CounterOptions {
    fn default() -> Self {
        Self {
            step: 1,
            milestone: 10,
        }
    }
}

/// A reference stateful module.
///
/// Counts ticks by `step`, reacts to [`Increment`] and [`Reset`], and keeps
/// its count in the project document.
#[derive(Debug)]
pub struct CounterModule {
    step: i64,
    milestone: i64,
    slot: StateSlot<CounterState>,
}

impl CounterModule {
    pub fn count(&self) -> i64 {
        self.slot.get().count
    }

    pub fn state(&self) -> Rc<CounterState> {
        self.slot.get()
    }

    pub fn add(&self, amount: i64) {
        self.slot.update(|s| CounterState {
            count: s.count.saturating_add(amount),
            ..s.clone()
        });
    }

    pub fn reset(&self) {
        self.slot.update(|s| CounterState {
            count: 0,
            ..s.clone()
        });
    }
}

impl Module for CounterModule {
    fn id(&self) -> &str {
        COUNTER_ID
    }

    fn title(&self) -> &str {
        "Counter"
    }

    fn init(&mut self, _: &EventSender) {
        tracing::debug!(count = self.count(), step = self.step, "counter ready");
    }

    fn update(&mut self, _tick: &Tick, events: &EventSender) {
        let before = self.count();
        self.slot.update(|s| CounterState {
            count: s.count.saturating_add(self.step),
            ticks_seen: s.ticks_seen + 1,
        });
        let Some(reached) = milestone_passed(before, self.count(), self.milestone) else {
            return;
        };
        if let Err(err) = events.enqueue_event::<Milestone>((reached,)) {
            tracing::debug!(%err, reached, "milestone not sent");
        }
    }

    fn shutdown(&mut self) {
        let state = self.slot.get();
        tracing::info!(count = state.count, ticks = state.ticks_seen, "counter stopped");
    }

    fn persistent_state(&self) -> Option<&dyn StateAccess> {
        Some(&self.slot)
    }
}

impl ConstructModule<()> for CounterModule {
    fn construct(cx: &ModuleContext<'_>, _: ()) -> Result<Self> {
        <Self as ConstructModule<CounterOptions>>::construct(cx, CounterOptions::default())
    }
}

impl ConstructModule<CounterOptions> for CounterModule {
    fn construct(_: &ModuleContext<'_>, options: CounterOptions) -> Result<Self> {
        Ok(Self {
            step: options.step,
            milestone: options.milestone,
            slot: StateSlot::default(),
        })
    }
}

/// The last multiple of `every` in `(before, after]`, if any.
fn milestone_passed(before: i64, after: i64, every: i64) -> Option<i64> {
    if every <= 0 || after <= before {
        return None;
    }
    let reached = after.div_euclid(every) * every;
    (reached > before).then_some(reached)
}

/// Register the counter events unless they already are.
pub fn register_events(events: &mut EventManager) -> Result<()> {
    if !events.is_registered::<Increment>() {
        events.register_event::<Increment>()?;
    }
    if !events.is_registered::<Reset>() {
        events.register_event::<Reset>()?;
    }
    if !events.is_registered::<Milestone>() {
        events.register_event::<Milestone>()?;
    }
    Ok(())
}

/// Subscribe `counter` to [`Increment`] and [`Reset`].
///
/// Handlers hold a weak handle; once the module is dropped they report the
/// event as unhandled.
pub fn subscribe(counter: &ModuleHandle<CounterModule>, events: &mut EventManager) -> Result<()> {
    let weak = Rc::downgrade(counter);
    events.register_event_handler::<Increment, _>(move |&(amount,)| {
        let Some(counter) = weak.upgrade() else {
            return EventResult::default();
        };
        let Ok(counter) = counter.try_borrow() else {
            tracing::warn!(amount, "counter busy, increment dropped");
            return EventResult::default();
        };
        counter.add(amount);
        EventResult::handled()
    })?;

    let weak = Rc::downgrade(counter);
    events.register_event_handler::<Reset, _>(move |_| {
        let Some(counter) = weak.upgrade() else {
            return EventResult::default();
        };
        let Ok(counter) = counter.try_borrow() else {
            tracing::warn!("counter busy, reset dropped");
            return EventResult::default();
        };
        counter.reset();
        EventResult::consumed()
    })?;

    Ok(())
}

/// Register the state type, the events and the module, and subscribe it.
pub fn install(
    runtime: &mut Runtime,
    container: &dyn ModuleContainer,
    options: CounterOptions,
) -> Result<ModuleHandle<CounterModule>> {
    runtime.register_state_type::<CounterState>()?;
    register_events(runtime.events_mut())?;
    let counter = runtime
        .modules_mut()
        .register_module_for_container::<CounterModule, _>(container, options)?;
    subscribe(&counter, runtime.events_mut())?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::container::Container;
    use keel_core::tick::TickCounter;
    use keel_core::RuntimeError;
    use std::time::Instant;

    fn runtime_with_counter(step: i64) -> (Runtime, ModuleHandle<CounterModule>) {
        let app = Container::new("app");
        let mut runtime = Runtime::new();
        let options = CounterOptions {
            step,
            ..CounterOptions::default()
        };
        let counter = install(&mut runtime, &app, options).unwrap();
        (runtime, counter)
    }

    #[test]
    fn update_adds_step_per_tick() {
        let (runtime, counter) = runtime_with_counter(2);
        let mut ticks = TickCounter::default();
        for _ in 0..3 {
            runtime.update_modules(&ticks.tick(Instant::now())).unwrap();
        }
        let state = counter.borrow().state();
        assert_eq!(state.count, 6);
        assert_eq!(state.ticks_seen, 3);
    }

    #[test]
    fn increment_event_reaches_counter() {
        let (mut runtime, counter) = runtime_with_counter(1);
        let outcome = runtime.events_mut().dispatch_event::<Increment>((5,)).unwrap();
        assert_eq!(outcome.invoked, 1);
        assert_eq!(counter.borrow().count(), 5);
    }

    #[test]
    fn queued_increments_apply_on_flush() {
        let (mut runtime, counter) = runtime_with_counter(1);
        runtime.events_mut().enqueue_event::<Increment>((1,)).unwrap();
        runtime.events_mut().enqueue_event::<Increment>((10,)).unwrap();
        assert_eq!(counter.borrow().count(), 0);

        assert_eq!(runtime.events_mut().handle_enqueued_events(), 2);
        assert_eq!(counter.borrow().count(), 11);
    }

    #[test]
    fn reset_is_consumed() {
        let (mut runtime, counter) = runtime_with_counter(1);
        counter.borrow().add(7);
        runtime
            .events_mut()
            .register_event_handler::<Reset, _>(|_| panic!("reset should be consumed"))
            .unwrap();

        let outcome = runtime.events_mut().dispatch_event::<Reset>(()).unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.invoked, 1);
        assert_eq!(counter.borrow().count(), 0);
    }

    #[test]
    fn update_sends_milestones() {
        let (mut runtime, _counter) = runtime_with_counter(4);
        let reached = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let r = reached.clone();
        runtime
            .events_mut()
            .register_event_handler::<Milestone, _>(move |&(n,)| r.borrow_mut().push(n))
            .unwrap();

        let mut ticks = TickCounter::default();
        for _ in 0..5 {
            runtime.events_mut().handle_enqueued_events();
            runtime.update_modules(&ticks.tick(Instant::now())).unwrap();
        }
        // counts 4 8 12 16 20; the 20 milestone is still queued
        assert_eq!(reached.borrow().as_slice(), &[10]);
        assert_eq!(runtime.events_mut().handle_enqueued_events(), 1);
        assert_eq!(reached.borrow().as_slice(), &[10, 20]);
    }

    #[test]
    fn milestone_math() {
        assert_eq!(milestone_passed(9, 10, 10), Some(10));
        assert_eq!(milestone_passed(8, 31, 10), Some(30));
        assert_eq!(milestone_passed(10, 19, 10), None);
        assert_eq!(milestone_passed(-5, 3, 10), Some(0));
        assert_eq!(milestone_passed(5, 25, 0), None);
        assert_eq!(milestone_passed(25, 5, 10), None);
    }

    #[test]
    fn second_counter_is_rejected() {
        let app = Container::new("app");
        let (mut runtime, _counter) = runtime_with_counter(1);
        let err = install(&mut runtime, &app, CounterOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateModuleId { .. }));
    }

    #[test]
    fn count_survives_save_and_load() {
        let (mut runtime, counter) = runtime_with_counter(1);
        counter.borrow().add(41);
        let mut buf = Vec::new();
        runtime.save_project(&mut buf).unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(doc["moduleStates"][0]["tag"], COUNTER_ID);
        assert_eq!(doc["moduleStates"][0]["value"]["type"], CounterState::NAME);

        let (mut fresh, restored) = runtime_with_counter(1);
        let report = fresh.load_project(buf.as_slice()).unwrap();
        assert!(report.is_clean());
        assert_eq!(restored.borrow().count(), 41);
    }

    #[test]
    fn handlers_outlive_the_module_quietly() {
        let (mut runtime, counter) = runtime_with_counter(1);
        runtime.modules_mut().cleanup();
        drop(counter);
        let outcome = runtime.events_mut().dispatch_event::<Increment>((1,)).unwrap();
        assert_eq!(outcome.last, Some(EventResult::default()));
    }
}
