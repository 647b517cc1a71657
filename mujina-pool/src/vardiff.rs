//! Per-session difficulty retargeting.
//!
//! Watches the cadence of a miner's submissions and nudges its
//! difficulty so shares arrive near a configured target interval.
//! Retargets are rate-limited and only fire when the average cadence
//! leaves the tolerance window.

use std::time::{Duration, Instant};

use serde::Deserialize;

/// Tuning for one vardiff port.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VardiffOptions {
    pub min_diff: f64,
    pub max_diff: f64,
    /// Desired seconds between shares.
    pub target_time: f64,
    /// Minimum seconds between retargets.
    pub retarget_time: f64,
    /// Half-width of the no-change window, as a percentage of
    /// `target_time`.
    pub variance_percent: f64,
    /// Step difficulty by powers of two instead of proportionally.
    #[serde(default)]
    pub x2mode: bool,
}

#[derive(Debug)]
struct Clock {
    last_submission: Instant,
    last_retarget: Instant,
}

#[derive(Debug)]
pub struct Vardiff {
    options: VardiffOptions,
    t_min: f64,
    t_max: f64,
    buffer: RingBuffer,
    clock: Option<Clock>,
}

impl Vardiff {
    pub fn new(options: VardiffOptions) -> Self {
        let variance = options.target_time * (options.variance_percent / 100.0);
        let capacity = ((options.retarget_time / (options.target_time * 4.0)) as usize).max(1);
        Vardiff {
            t_min: options.target_time - variance,
            t_max: options.target_time + variance,
            buffer: RingBuffer::new(capacity),
            clock: None,
            options,
        }
    }

    /// Feeds one submission at `now` from a session currently at
    /// `difficulty`. Returns the new difficulty when a retarget is
    /// due.
    pub fn on_submit(&mut self, now: Instant, difficulty: f64) -> Option<f64> {
        let Some(clock) = &mut self.clock else {
            // First submission: start the cadence clock half a window
            // back so a badly sized first difficulty corrects soon.
            let half = Duration::from_secs_f64(self.options.retarget_time / 2.0);
            self.clock = Some(Clock {
                last_submission: now,
                last_retarget: now.checked_sub(half).unwrap_or(now),
            });
            return None;
        };

        let since_last = now.duration_since(clock.last_submission).as_secs_f64();
        self.buffer.append(since_last);
        clock.last_submission = now;

        if now.duration_since(clock.last_retarget).as_secs_f64() < self.options.retarget_time {
            return None;
        }
        clock.last_retarget = now;

        let avg = self.buffer.avg();
        let mut factor = self.options.target_time / avg;
        if avg > self.t_max && difficulty > self.options.min_diff {
            if self.options.x2mode {
                factor = 0.5;
            }
            if factor * difficulty < self.options.min_diff {
                factor = self.options.min_diff / difficulty;
            }
        } else if avg < self.t_min {
            if self.options.x2mode {
                factor = 2.0;
            }
            if factor * difficulty > self.options.max_diff {
                factor = self.options.max_diff / difficulty;
            }
        } else {
            return None;
        }

        self.buffer.clear();
        Some(round8(difficulty * factor))
    }

    #[cfg(test)]
    fn samples(&self) -> usize {
        self.buffer.data.len()
    }
}

/// Fixed-capacity buffer of the most recent inter-submission deltas.
#[derive(Debug)]
struct RingBuffer {
    data: Vec<f64>,
    capacity: usize,
    cursor: usize,
    full: bool,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        RingBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
            full: false,
        }
    }

    fn append(&mut self, value: f64) {
        if self.full {
            self.data[self.cursor] = value;
            self.cursor = (self.cursor + 1) % self.capacity;
        } else {
            self.data.push(value);
            self.cursor += 1;
            if self.data.len() == self.capacity {
                self.cursor = 0;
                self.full = true;
            }
        }
    }

    fn avg(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }

    fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
        self.full = false;
    }
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> VardiffOptions {
        VardiffOptions {
            min_diff: 8.0,
            max_diff: 512.0,
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
            x2mode: false,
        }
    }

    fn timeline() -> impl Fn(u64) -> Instant {
        // Headroom below the base so the seeded retarget clock can sit
        // in the past.
        let base = Instant::now() + Duration::from_secs(10_000);
        move |seconds| base + Duration::from_secs(seconds)
    }

    #[test]
    fn first_submission_only_seeds_the_clock() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        assert_eq!(vardiff.on_submit(at(0), 8.0), None);
        assert_eq!(vardiff.samples(), 0);
    }

    #[test]
    fn on_target_cadence_never_retargets() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        vardiff.on_submit(at(0), 8.0);
        for i in 1..=20 {
            assert_eq!(vardiff.on_submit(at(i * 15), 8.0), None);
        }
        // The window check ran and declined without dropping samples.
        assert!(vardiff.samples() > 0);
    }

    #[test]
    fn fast_cadence_raises_difficulty() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        vardiff.on_submit(at(0), 8.0);
        let mut result = None;
        for i in 1..=45 {
            result = vardiff.on_submit(at(i), 8.0);
            if result.is_some() {
                break;
            }
        }
        // One-second cadence against a 15-second target.
        assert_eq!(result, Some(120.0));
        assert_eq!(vardiff.samples(), 0);
    }

    #[test]
    fn raise_is_clamped_to_max_diff() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        vardiff.on_submit(at(0), 256.0);
        let mut result = None;
        for i in 1..=45 {
            result = vardiff.on_submit(at(i), 256.0);
            if result.is_some() {
                break;
            }
        }
        assert_eq!(result, Some(512.0));
    }

    #[test]
    fn slow_cadence_lowers_difficulty_no_further_than_min() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        vardiff.on_submit(at(0), 16.0);
        // 60-second cadence wants a quarter of the difficulty, but
        // 4 sits below the floor.
        assert_eq!(vardiff.on_submit(at(60), 16.0), Some(8.0));
    }

    #[test]
    fn slow_cadence_at_min_diff_does_nothing() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        vardiff.on_submit(at(0), 8.0);
        assert_eq!(vardiff.on_submit(at(60), 8.0), None);
        assert_eq!(vardiff.samples(), 1);
    }

    #[test]
    fn x2mode_steps_by_powers_of_two() {
        let at = timeline();
        let mut vardiff = Vardiff::new(VardiffOptions {
            x2mode: true,
            ..options()
        });
        vardiff.on_submit(at(0), 16.0);
        let mut result = None;
        for i in 1..=45 {
            result = vardiff.on_submit(at(i), 16.0);
            if result.is_some() {
                break;
            }
        }
        assert_eq!(result, Some(32.0));

        let mut vardiff = Vardiff::new(VardiffOptions {
            x2mode: true,
            ..options()
        });
        vardiff.on_submit(at(0), 16.0);
        assert_eq!(vardiff.on_submit(at(60), 16.0), Some(8.0));
    }

    #[test]
    fn retargets_are_rate_limited() {
        let at = timeline();
        let mut vardiff = Vardiff::new(options());
        vardiff.on_submit(at(0), 16.0);
        assert_eq!(vardiff.on_submit(at(60), 16.0), Some(8.0));
        // Nothing fires again until a full retarget window passes,
        // whatever the cadence.
        for i in 0..89 {
            assert_eq!(vardiff.on_submit(at(61 + i), 8.0), None);
        }
    }
}
