//! Events the host raises every tick and for scripted input.

use std::time::Duration;

use keel_core::define_event;
use keel_core::event::{EventManager, Handled};
use keel_core::Result;

define_event!(
    /// Raised at the start of a tick, after queued events are flushed.
    pub struct FrameWillBegin(u64)
);
define_event!(
    /// Raised after every module has been updated; carries the tick delta.
    pub struct FrameEnded(u64, Duration)
);
define_event!(
    /// A key press. Dispatch stops at the first handler that takes it.
    pub struct KeyPressed(char) -> Handled
);

pub fn register_core_events(events: &mut EventManager) -> Result<()> {
    events.register_event::<FrameWillBegin>()?;
    events.register_event::<FrameEnded>()?;
    events.register_event::<KeyPressed>()?;
    Ok(())
}

/// Dispatch a key press and report whether any handler took it.
pub fn press_key(events: &mut EventManager, key: char) -> Result<bool> {
    let outcome = events.dispatch_event::<KeyPressed>((key,))?;
    Ok(matches!(outcome.last, Some(Handled(true))))
}
