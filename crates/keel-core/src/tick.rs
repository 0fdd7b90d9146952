use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MIN_WINDOW: Duration = Duration::from_millis(1);

/// One step of the host's cooperative loop, handed to [`Module::update`].
///
/// [`Module::update`]: crate::module::Module::update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based index of the tick since the loop started.
    pub index: u64,
    pub now: Instant,
    /// Time elapsed since the previous tick (zero for the first).
    pub delta: Duration,
}

/// Produces consecutive [`Tick`]s and measures the tick rate over a sliding
/// window.
pub struct TickCounter {
    timestamps: VecDeque<Instant>,
    window: Duration,
    next_index: u64,
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl TickCounter {
    /// A window shorter than one millisecond is raised to one millisecond.
    pub fn new(window: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window: window.max(MIN_WINDOW),
            next_index: 0,
        }
    }

    /// Record a tick at `now` and return its description.
    pub fn tick(&mut self, now: Instant) -> Tick {
        let delta = self
            .timestamps
            .back()
            .map(|&prev| now.saturating_duration_since(prev))
            .unwrap_or_default();
        self.timestamps.push_back(now);
        self.prune(now);

        let tick = Tick {
            index: self.next_index,
            now,
            delta,
        };
        self.next_index += 1;
        tick
    }

    /// Total number of ticks recorded.
    pub fn count(&self) -> u64 {
        self.next_index
    }

    /// Ticks per second over the window; `0.0` until two ticks are recorded.
    pub fn tps(&self) -> f64 {
        let Some(&newest) = self.timestamps.back() else {
            return 0.0;
        };
        if self.timestamps.len() < 2 {
            return 0.0;
        }
        let count = match newest.checked_sub(self.window) {
            Some(start) => self.timestamps.iter().filter(|&&t| t >= start).count(),
            None => self.timestamps.len(),
        };
        count as f64 / self.window.as_secs_f64()
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(&front) = self.timestamps.front() {
            if front < cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
