use std::fs;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use log::{debug, info};

pub const DEFAULT_CEILING_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Pressure ratio above which batches shrink.
const HIGH_WATERMARK: f64 = 0.8;
/// Pressure ratio below which batches may grow again.
const GROW_THRESHOLD: f64 = 0.5;

pub const BASE_BATCH_SIZE: usize = 5000;
pub const MIN_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureAction {
    ReduceBatch,
    ReleaseCaches,
}

#[derive(Debug, Clone, Copy)]
pub struct PressureEvent {
    pub ratio: f64,
    pub suggested: PressureAction,
}

/// Process-wide memory observer. Long passes ask it for batch sizes and
/// subscribe to pressure events; it never allocates on their behalf.
///
/// RSS comes from /proc/self/statm. Where that is unavailable the ratio
/// reads as zero and batch sizing stays at its base.
pub struct MemoryController {
    ceiling_bytes: u64,
    probe: fn() -> Option<u64>,
    subscribers: Mutex<Vec<Sender<PressureEvent>>>,
}

fn rss_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

impl MemoryController {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self::with_probe(ceiling_bytes, rss_bytes)
    }

    pub(crate) fn with_probe(ceiling_bytes: u64, probe: fn() -> Option<u64>) -> Self {
        MemoryController {
            ceiling_bytes: ceiling_bytes.max(1),
            probe,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn pressure_ratio(&self) -> f64 {
        match (self.probe)() {
            Some(resident) => resident as f64 / self.ceiling_bytes as f64,
            None => 0.0,
        }
    }

    pub fn is_under_pressure(&self) -> bool {
        self.pressure_ratio() > HIGH_WATERMARK
    }

    /// Base size under light pressure, halving toward the floor as the
    /// ratio climbs.
    pub fn optimal_batch_size(&self, base: usize, min: usize) -> usize {
        let ratio = self.pressure_ratio();
        if ratio <= HIGH_WATERMARK {
            base
        } else if ratio <= 0.9 {
            (base / 2).max(min)
        } else if ratio <= 1.0 {
            (base / 4).max(min)
        } else {
            min
        }
    }

    /// Forces a reclaim pass: broadcasts a cache-eviction hint to every
    /// subscriber (the index manager among them).
    pub fn try_reduce_pressure(&self) {
        let ratio = self.pressure_ratio();
        info!("memory pressure {ratio:.2}, requesting cache release");
        self.broadcast(PressureEvent {
            ratio,
            suggested: PressureAction::ReleaseCaches,
        });
    }

    pub fn subscribe(&self) -> Receiver<PressureEvent> {
        let (sender, receiver) = channel();
        self.subscribers
            .lock()
            .expect("pressure subscriber list poisoned")
            .push(sender);
        receiver
    }

    /// Samples the ratio; above the watermark, notifies subscribers.
    pub fn sample(&self) -> f64 {
        let ratio = self.pressure_ratio();
        if ratio > HIGH_WATERMARK {
            debug!("memory pressure detected: ratio {ratio:.2}");
            self.broadcast(PressureEvent {
                ratio,
                suggested: PressureAction::ReduceBatch,
            });
        }
        ratio
    }

    fn broadcast(&self, event: PressureEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("pressure subscriber list poisoned");
        subscribers.retain(|sender| sender.send(event).is_ok());
    }
}

/// Batch-size policy of a chunked pass: start at the controller's
/// optimum, halve under pressure, grow by 1.2x while comfortably below
/// the watermark.
pub struct BatchSizer<'controller> {
    controller: &'controller MemoryController,
    current: usize,
    floor: usize,
    cap: usize,
}

impl<'controller> BatchSizer<'controller> {
    pub fn new(controller: &'controller MemoryController) -> Self {
        BatchSizer {
            current: controller.optimal_batch_size(BASE_BATCH_SIZE, MIN_BATCH_SIZE),
            controller,
            floor: MIN_BATCH_SIZE,
            cap: BASE_BATCH_SIZE,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn after_batch(&mut self) -> usize {
        let ratio = self.controller.sample();
        if self.controller.is_under_pressure() {
            self.current = (self.current / 2).max(self.floor);
            self.controller.try_reduce_pressure();
        } else if ratio < GROW_THRESHOLD && self.current < self.cap {
            self.current = ((self.current as f64 * 1.2) as usize).min(self.cap);
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm() -> Option<u64> {
        Some(0)
    }

    fn strained() -> Option<u64> {
        Some(950)
    }

    #[test]
    fn batch_grows_back_toward_cap_when_calm() {
        let controller = MemoryController::with_probe(1000, calm);
        let mut sizer = BatchSizer::new(&controller);
        let start = sizer.current();
        assert_eq!(start, BASE_BATCH_SIZE);
        assert_eq!(sizer.after_batch(), BASE_BATCH_SIZE);
    }

    #[test]
    fn batch_halves_under_pressure_and_recovers() {
        let controller = MemoryController::with_probe(1000, strained);
        let mut sizer = BatchSizer::new(&controller);
        assert!(sizer.current() < BASE_BATCH_SIZE);
        let first = sizer.after_batch();
        let second = sizer.after_batch();
        assert!(second <= first);
        assert!(second >= MIN_BATCH_SIZE);
    }

    #[test]
    fn pressure_events_reach_subscribers() {
        let controller = MemoryController::with_probe(1000, strained);
        let events = controller.subscribe();
        let ratio = controller.sample();
        assert!(ratio > 0.9);
        let event = events.try_recv().expect("pressure event");
        assert_eq!(event.suggested, PressureAction::ReduceBatch);
        controller.try_reduce_pressure();
        let event = events.try_recv().expect("release event");
        assert_eq!(event.suggested, PressureAction::ReleaseCaches);
    }

    #[test]
    fn optimal_batch_size_honours_floor() {
        let controller = MemoryController::with_probe(100, strained);
        assert_eq!(controller.optimal_batch_size(5000, 1000), 1000);
        let calm_controller = MemoryController::with_probe(u64::MAX, calm);
        assert_eq!(calm_controller.optimal_batch_size(5000, 1000), 5000);
    }
}
