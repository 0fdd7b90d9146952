use std::any::Any;
use std::collections::VecDeque;

/// A registered callback for one argument tuple `A` producing `R`.
pub type DispatchTarget<A, R> = Box<dyn FnMut(&A) -> R>;

/// Inspects the output of one target and decides whether the remaining
/// targets still run (`true`) or the dispatch stops (`false`).
pub type ResultPolicy<R> = fn(&R) -> bool;

fn always_continue<R>(_: &R) -> bool {
    true
}

/// Outcome of one dispatch over all targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched<R> {
    /// Number of targets that were invoked.
    pub invoked: usize,
    /// `true` if the policy stopped the chain before the last target.
    pub stopped: bool,
    /// Output of the last invoked target, if any ran.
    pub last: Option<R>,
}

impl<R> Dispatched<R> {
    fn empty() -> Self {
        Self {
            invoked: 0,
            stopped: false,
            last: None,
        }
    }

    pub fn last(&self) -> Option<&R> {
        self.last.as_ref()
    }
}

/// Stores the targets for one signature and invokes them, either right away
/// or later from a FIFO queue.
///
/// Targets run in registration order. The list only grows; there is no
/// unregistration. After every target the [`ResultPolicy`] decides whether
/// the rest of the chain runs.
pub struct DispatchManager<A, R> {
    targets: Vec<DispatchTarget<A, R>>,
    queue: VecDeque<A>,
    policy: ResultPolicy<R>,
}

impl<A: 'static, R: 'static> Default for DispatchManager<A, R> {
    fn default() -> Self {
        Self::new(always_continue::<R>)
    }
}

impl<A: 'static, R: 'static> DispatchManager<A, R> {
    /// Create a manager with the given short-circuit policy.
    pub fn new(policy: ResultPolicy<R>) -> Self {
        Self {
            targets: Vec::new(),
            queue: VecDeque::new(),
            policy,
        }
    }

    pub fn set_result_policy(&mut self, policy: ResultPolicy<R>) {
        self.policy = policy;
    }

    /// Append a target at the end of the invocation order.
    pub fn register_target<F>(&mut self, target: F)
    where
        F: FnMut(&A) -> R + 'static,
    {
        self.targets.push(Box::new(target));
    }

    /// Invoke all targets now.
    pub fn perform_dispatch(&mut self, args: A) -> Dispatched<R> {
        self.dispatch(&args)
    }

    /// Store `args` until the next [`handle_enqueued_dispatches`] call.
    ///
    /// [`handle_enqueued_dispatches`]: DispatchManager::handle_enqueued_dispatches
    pub fn enqueue_dispatch(&mut self, args: A) {
        self.queue.push_back(args);
    }

    /// Dispatch every queued argument tuple in FIFO order and leave the
    /// queue empty. Returns the number of dispatches performed.
    pub fn handle_enqueued_dispatches(&mut self) -> usize {
        let pending: Vec<A> = self.queue.drain(..).collect();
        for args in &pending {
            self.dispatch(args);
        }
        pending.len()
    }

    /// Move every tuple from `pending` to the back of this manager's queue.
    pub fn absorb(&mut self, pending: &mut VecDeque<A>) -> usize {
        let count = pending.len();
        self.queue.append(pending);
        count
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn dispatch(&mut self, args: &A) -> Dispatched<R> {
        let mut outcome = Dispatched::empty();
        let total = self.targets.len();
        for target in &mut self.targets {
            let result = target(args);
            outcome.invoked += 1;
            let proceed = (self.policy)(&result);
            outcome.last = Some(result);
            if !proceed {
                outcome.stopped = outcome.invoked < total;
                break;
            }
        }
        outcome
    }
}

/// Signature-independent view of a [`DispatchManager`], used by containers
/// that hold managers for many different signatures.
pub trait ErasedDispatch {
    fn handle_enqueued_dispatches(&mut self) -> usize;
    /// Like [`DispatchManager::absorb`] for a queue passed as
    /// `&mut VecDeque<A>`; a queue of any other type is left alone.
    fn absorb_erased(&mut self, pending: &mut dyn Any) -> usize;
    fn pending(&self) -> usize;
    fn target_count(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<A: 'static, R: 'static> ErasedDispatch for DispatchManager<A, R> {
    fn handle_enqueued_dispatches(&mut self) -> usize {
        DispatchManager::handle_enqueued_dispatches(self)
    }

    fn absorb_erased(&mut self, pending: &mut dyn Any) -> usize {
        match pending.downcast_mut::<VecDeque<A>>() {
            Some(queue) => self.absorb(queue),
            None => 0,
        }
    }

    fn pending(&self) -> usize {
        DispatchManager::pending(self)
    }

    fn target_count(&self) -> usize {
        DispatchManager::target_count(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn non_negative(result: &i32) -> bool {
        *result >= 0
    }

    #[test]
    fn targets_receive_arguments() {
        let sum = Rc::new(RefCell::new(0));
        let mut manager: DispatchManager<(i32, i32), ()> = DispatchManager::default();
        let s = sum.clone();
        manager.register_target(move |(a, b)| *s.borrow_mut() = a + b);

        let outcome = manager.perform_dispatch((5, 6));
        assert_eq!(*sum.borrow(), 11);
        assert_eq!(outcome.invoked, 1);
        assert!(!outcome.stopped);
    }

    #[test]
    fn targets_run_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager: DispatchManager<(), ()> = DispatchManager::default();
        for name in ["first", "second", "third"] {
            let log = log.clone();
            manager.register_target(move |_| log.borrow_mut().push(name));
        }
        manager.perform_dispatch(());
        assert_eq!(log.borrow().as_slice(), &["first", "second", "third"]);
    }

    #[test]
    fn policy_short_circuits_remaining_targets() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut manager: DispatchManager<(i32,), i32> = DispatchManager::new(non_negative);
        for (idx, value) in [1, -1, 7].into_iter().enumerate() {
            let calls = calls.clone();
            manager.register_target(move |_| {
                calls.borrow_mut().push(idx);
                value
            });
        }

        let outcome = manager.perform_dispatch((0,));
        assert_eq!(calls.borrow().as_slice(), &[0, 1]);
        assert_eq!(outcome.invoked, 2);
        assert!(outcome.stopped);
        assert_eq!(outcome.last, Some(-1));
    }

    #[test]
    fn stop_on_last_target_is_not_reported_as_stopped() {
        let mut manager: DispatchManager<(), i32> = DispatchManager::new(non_negative);
        manager.register_target(|_| 3);
        manager.register_target(|_| -3);
        let outcome = manager.perform_dispatch(());
        assert_eq!(outcome.invoked, 2);
        assert!(!outcome.stopped);
    }

    #[test]
    fn policy_can_be_replaced() {
        let mut manager: DispatchManager<(), i32> = DispatchManager::default();
        manager.register_target(|_| -1);
        manager.register_target(|_| 2);
        assert_eq!(manager.perform_dispatch(()).invoked, 2);

        manager.set_result_policy(non_negative);
        assert_eq!(manager.perform_dispatch(()).invoked, 1);
    }

    #[test]
    fn enqueue_defers_until_handled() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut manager: DispatchManager<(u32,), ()> = DispatchManager::default();
        let s = seen.clone();
        manager.register_target(move |(n,)| s.borrow_mut().push(*n));

        manager.enqueue_dispatch((1,));
        manager.enqueue_dispatch((2,));
        manager.enqueue_dispatch((3,));
        assert!(seen.borrow().is_empty());
        assert_eq!(manager.pending(), 3);

        assert_eq!(manager.handle_enqueued_dispatches(), 3);
        assert_eq!(seen.borrow().as_slice(), &[1, 2, 3]);
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn handling_empty_queue_is_noop() {
        let mut manager: DispatchManager<(), ()> = DispatchManager::default();
        manager.register_target(|_| panic!("must not run"));
        assert_eq!(manager.handle_enqueued_dispatches(), 0);
    }

    #[test]
    fn dispatch_without_targets_reports_nothing() {
        let mut manager: DispatchManager<(), i32> = DispatchManager::default();
        let outcome = manager.perform_dispatch(());
        assert_eq!(outcome.invoked, 0);
        assert!(outcome.last.is_none());
    }

    #[test]
    fn absorbed_tuples_queue_behind_existing_ones() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut manager: DispatchManager<(u32,), ()> = DispatchManager::default();
        let s = seen.clone();
        manager.register_target(move |(n,)| s.borrow_mut().push(*n));
        manager.enqueue_dispatch((1,));

        let mut outside: VecDeque<(u32,)> = VecDeque::from([(2,), (3,)]);
        let erased: &mut dyn ErasedDispatch = &mut manager;
        assert_eq!(erased.absorb_erased(&mut outside), 2);
        assert!(outside.is_empty());

        let mut wrong: VecDeque<(u8,)> = VecDeque::from([(9,)]);
        assert_eq!(erased.absorb_erased(&mut wrong), 0);
        assert_eq!(wrong.len(), 1);

        assert_eq!(manager.handle_enqueued_dispatches(), 3);
        assert_eq!(seen.borrow().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn erased_view_downcasts_to_concrete_manager() {
        let mut boxed: Box<dyn ErasedDispatch> =
            Box::new(DispatchManager::<(i32,), ()>::default());
        assert!(boxed
            .as_any_mut()
            .downcast_mut::<DispatchManager<(i32,), ()>>()
            .is_some());
        assert!(boxed
            .as_any()
            .downcast_ref::<DispatchManager<(u8,), ()>>()
            .is_none());
        assert_eq!(boxed.target_count(), 0);
    }
}
