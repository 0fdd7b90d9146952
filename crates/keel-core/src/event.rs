//! Typed publish/subscribe on top of [`DispatchManager`].
//!
//! Every event is a zero-sized marker type implementing [`Event`]. Its
//! [`TypeKey`] selects one `DispatchManager` holding the handlers for exactly
//! that event's argument tuple and output type, so no handler is ever called
//! with arguments of the wrong shape.
//!
//! Modules and handlers publish through an [`EventSender`], which queues
//! events for the next flush without borrowing the manager.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::dispatch::{DispatchManager, Dispatched, ErasedDispatch};
use crate::error::{Result, RuntimeError};
use crate::key::TypeKey;

/// Default output of an event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventResult {
    /// The handler acted on the event.
    pub handled: bool,
    /// Later handlers should still see the event.
    pub forward: bool,
}

impl Default for EventResult {
    fn default() -> Self {
        Self {
            handled: false,
            forward: true,
        }
    }
}

impl EventResult {
    /// Handled, and later handlers still run.
    pub fn handled() -> Self {
        Self {
            handled: true,
            forward: true,
        }
    }

    /// Handled, and no later handler runs.
    pub fn consumed() -> Self {
        Self {
            handled: true,
            forward: false,
        }
    }
}

/// Output of "was this handled?" events: dispatch stops at the first `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Handled(pub bool);

/// Short-circuit rule for output types that have a natural one.
pub trait DefaultPolicy {
    fn proceed(&self) -> bool;
}

impl DefaultPolicy for () {
    fn proceed(&self) -> bool {
        true
    }
}

impl DefaultPolicy for EventResult {
    fn proceed(&self) -> bool {
        self.forward
    }
}

impl DefaultPolicy for Handled {
    fn proceed(&self) -> bool {
        !self.0
    }
}

/// A compile-time event definition.
///
/// `Args` is the tuple handed to each handler by reference; `Output` is what a
/// handler returns. Output types without a [`DefaultPolicy`] must implement
/// `process_result` by hand. [`define_event!`](crate::define_event) covers
/// the common shapes.
pub trait Event: 'static {
    type Args: 'static;
    type Output: 'static;

    /// Decide, after each handler, whether the remaining handlers run.
    fn process_result(output: &Self::Output) -> bool;
}

/// Define an event marker type whose output has a [`DefaultPolicy`].
///
/// ```
/// use keel_core::define_event;
/// use keel_core::event::EventResult;
///
/// define_event!(pub struct Resized(u32, u32));
/// define_event!(pub struct Clicked(i32, i32) -> EventResult);
/// ```
#[macro_export]
macro_rules! define_event {
    ($(#[$meta:meta])* $vis:vis struct $name:ident ( $($arg:ty),* $(,)? ) -> $out:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::event::Event for $name {
            type Args = ($($arg,)*);
            type Output = $out;

            fn process_result(output: &Self::Output) -> bool {
                $crate::event::DefaultPolicy::proceed(output)
            }
        }
    };
    ($(#[$meta:meta])* $vis:vis struct $name:ident ( $($arg:ty),* $(,)? )) => {
        $crate::define_event!($(#[$meta])* $vis struct $name($($arg),*) -> ());
    };
}

/// The dispatch manager type that serves event `E`.
pub type EventDispatchManager<E> =
    DispatchManager<<E as Event>::Args, <E as Event>::Output>;

struct Slot {
    key: TypeKey,
    manager: Box<dyn ErasedDispatch>,
}

/// Queued argument tuples, one `VecDeque<E::Args>` per registered event.
/// Never borrowed while a handler runs.
#[derive(Default)]
struct Pending {
    queues: HashMap<TypeKey, Box<dyn Any>>,
    queued: usize,
}

/// Cloneable publishing handle of one [`EventManager`].
///
/// Modules get one in `init` and `update`; handlers capture one from
/// [`EventManager::sender`]. Everything sent lands in the queues flushed by
/// [`EventManager::handle_enqueued_events`].
#[derive(Clone, Default)]
pub struct EventSender {
    pending: Rc<RefCell<Pending>>,
}

impl EventSender {
    /// Queue `E` for the next flush. Works during a flush too; such events
    /// wait for the following one.
    pub fn enqueue_event<E: Event>(&self, args: E::Args) -> Result<()> {
        let key = TypeKey::of::<E>();
        let mut pending = self.pending.borrow_mut();
        let queue = pending
            .queues
            .get_mut(&key)
            .and_then(|queue| queue.downcast_mut::<VecDeque<E::Args>>())
            .ok_or(RuntimeError::EventNotRegistered { event: key.name() })?;
        queue.push_back(args);
        pending.queued += 1;
        Ok(())
    }

    pub fn is_registered<E: Event>(&self) -> bool {
        self.pending
            .borrow()
            .queues
            .contains_key(&TypeKey::of::<E>())
    }

    /// Events sent and not yet picked up by a flush.
    pub fn pending(&self) -> usize {
        self.pending.borrow().queued
    }

    fn open<E: Event>(&self) {
        self.pending
            .borrow_mut()
            .queues
            .insert(TypeKey::of::<E>(), Box::new(VecDeque::<E::Args>::new()));
    }

    fn hand_over(&self, key: TypeKey, manager: &mut dyn ErasedDispatch) -> usize {
        let mut pending = self.pending.borrow_mut();
        let Some(queue) = pending.queues.get_mut(&key) else {
            return 0;
        };
        let moved = manager.absorb_erased(&mut **queue);
        pending.queued = pending.queued.saturating_sub(moved);
        moved
    }

    fn close_all(&self) {
        let mut pending = self.pending.borrow_mut();
        pending.queues.clear();
        pending.queued = 0;
    }
}

/// Routes events to handlers without compile-time coupling between the
/// publisher and the subscribers.
///
/// Events are registered once, then any number of handlers subscribe. Events
/// are either dispatched immediately or enqueued and flushed by
/// [`handle_enqueued_events`](EventManager::handle_enqueued_events), which the
/// host calls once per tick.
#[derive(Default)]
pub struct EventManager {
    slots: Vec<Slot>,
    index: HashMap<TypeKey, usize>,
    sender: EventSender,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_event<E: Event>(&mut self) -> Result<()> {
        let key = TypeKey::of::<E>();
        if self.index.contains_key(&key) {
            return Err(RuntimeError::EventAlreadyRegistered { event: key.name() });
        }
        let manager: EventDispatchManager<E> = DispatchManager::new(E::process_result);
        self.index.insert(key, self.slots.len());
        self.slots.push(Slot {
            key,
            manager: Box::new(manager),
        });
        self.sender.open::<E>();
        tracing::debug!(event = key.short_name(), "registered event");
        Ok(())
    }

    /// Subscribe `handler` to `E`. Handlers run in subscription order and stay
    /// subscribed for the lifetime of this manager.
    pub fn register_event_handler<E, F>(&mut self, handler: F) -> Result<()>
    where
        E: Event,
        F: FnMut(&E::Args) -> E::Output + 'static,
    {
        self.manager_mut::<E>()?.register_target(handler);
        Ok(())
    }

    /// A publishing handle sharing this manager's queues.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Run all handlers of `E` now.
    pub fn dispatch_event<E: Event>(&mut self, args: E::Args) -> Result<Dispatched<E::Output>> {
        let manager = self.manager_mut::<E>()?;
        let outcome = manager.perform_dispatch(args);
        if outcome.stopped {
            tracing::trace!(
                event = TypeKey::of::<E>().short_name(),
                invoked = outcome.invoked,
                "dispatch stopped by handler"
            );
        }
        Ok(outcome)
    }

    /// Queue `E` for the next [`handle_enqueued_events`] call.
    ///
    /// [`handle_enqueued_events`]: EventManager::handle_enqueued_events
    pub fn enqueue_event<E: Event>(&self, args: E::Args) -> Result<()> {
        self.sender.enqueue_event::<E>(args)
    }

    /// Dispatch everything queued before this call, FIFO within each event
    /// type and in event registration order across types. Events queued by
    /// handlers during the flush are left for the next call. Returns the
    /// number of dispatches performed.
    pub fn handle_enqueued_events(&mut self) -> usize {
        for slot in &mut self.slots {
            self.sender.hand_over(slot.key, &mut *slot.manager);
        }
        let mut handled = 0;
        for slot in &mut self.slots {
            if slot.manager.pending() == 0 {
                continue;
            }
            let count = slot.manager.handle_enqueued_dispatches();
            tracing::trace!(event = slot.key.short_name(), count, "flushed queued events");
            handled += count;
        }
        handled
    }

    pub fn is_registered<E: Event>(&self) -> bool {
        self.index.contains_key(&TypeKey::of::<E>())
    }

    /// Number of handlers subscribed to `E`, or `None` if `E` is unknown.
    pub fn handler_count<E: Event>(&self) -> Option<usize> {
        self.index
            .get(&TypeKey::of::<E>())
            .map(|&idx| self.slots[idx].manager.target_count())
    }

    /// Total number of queued events across all types.
    pub fn pending_events(&self) -> usize {
        self.sender.pending()
            + self
                .slots
                .iter()
                .map(|slot| slot.manager.pending())
                .sum::<usize>()
    }

    /// Registered event types in registration order.
    pub fn event_types(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.slots.iter().map(|slot| slot.key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forget every event, handler and queued dispatch. Outstanding senders
    /// stay valid and see events again once they are registered anew.
    pub fn cleanup(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.sender.close_all();
    }

    fn manager_mut<E: Event>(&mut self) -> Result<&mut EventDispatchManager<E>> {
        let key = TypeKey::of::<E>();
        let not_registered = RuntimeError::EventNotRegistered { event: key.name() };
        let idx = *self.index.get(&key).ok_or_else(|| not_registered.clone())?;
        self.slots[idx]
            .manager
            .as_any_mut()
            .downcast_mut::<EventDispatchManager<E>>()
            .ok_or(not_registered)
    }
}
