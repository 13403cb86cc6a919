//! Server-side FIFO of received trajectories, bounded by timestep count.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use super::trajectory::Trajectory;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedTrajectory {
    pub trajectory: Trajectory,
    pub timesteps: usize,
}

/// Whole trajectories in arrival order.
///
/// `available_timesteps` always equals the sum of `timesteps` over the
/// retained entries, and never exceeds `max_queue_size` once an insert
/// returns. Eviction drops whole trajectories from the head, so the window
/// skews toward the most recent data.
#[derive(Debug)]
pub struct ExperienceBuffer {
    entries: VecDeque<BufferedTrajectory>,
    available_timesteps: usize,
    max_queue_size: usize,
}

impl ExperienceBuffer {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            available_timesteps: 0,
            max_queue_size,
        }
    }

    pub fn insert(&mut self, trajectory: Trajectory) {
        let timesteps = trajectory.len();
        self.entries.push_back(BufferedTrajectory {
            trajectory,
            timesteps,
        });
        self.available_timesteps += timesteps;
        self.trim();
    }

    /// Insert every trajectory in order and return the number of timesteps received.
    pub fn extend<I: IntoIterator<Item = Trajectory>>(&mut self, trajectories: I) -> usize {
        let mut received = 0;
        for trajectory in trajectories {
            received += trajectory.len();
            self.insert(trajectory);
        }
        received
    }

    /// Pop from the tail until at least `n` timesteps are collected. Returns
    /// `None` without touching the buffer when fewer than `n` are available.
    pub fn pop_n(&mut self, n: usize) -> Option<Vec<Trajectory>> {
        if self.available_timesteps < n {
            return None;
        }
        Some(self.pop_up_to(n))
    }

    /// Pop from the tail while entries remain and fewer than `n` timesteps
    /// have been collected. May overshoot `n` by part of one trajectory.
    pub fn pop_up_to(&mut self, n: usize) -> Vec<Trajectory> {
        let mut collected = 0;
        let mut out = Vec::new();
        while collected < n {
            let Some(entry) = self.entries.pop_back() else {
                break;
            };
            collected += entry.timesteps;
            out.push(entry.trajectory);
        }
        self.available_timesteps -= collected;
        out
    }

    pub fn available_timesteps(&self) -> usize {
        self.available_timesteps
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedTrajectory> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.available_timesteps = 0;
    }

    fn trim(&mut self) {
        while self.available_timesteps > self.max_queue_size {
            let Some(evicted) = self.entries.pop_front() else {
                break;
            };
            self.available_timesteps -= evicted.timesteps;
            debug!(
                evicted = evicted.timesteps,
                available = self.available_timesteps,
                "experience buffer over capacity"
            );
        }
    }
}

/// Steps-per-second estimate, reported only.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    accumulated: usize,
    last_sample: Instant,
    steps_per_second: f64,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputMeter {
    const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            accumulated: 0,
            last_sample: now,
            steps_per_second: 0.0,
        }
    }

    pub fn record(&mut self, timesteps: usize) {
        self.record_at(timesteps, Instant::now());
    }

    pub fn record_at(&mut self, timesteps: usize, now: Instant) {
        self.accumulated += timesteps;
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed >= Self::SAMPLE_PERIOD {
            let rate = self.accumulated as f64 / elapsed.as_secs_f64();
            self.steps_per_second = 0.9 * self.steps_per_second + 0.1 * rate;
            self.accumulated = 0;
            self.last_sample = now;
        }
    }

    pub fn steps_per_second(&self) -> f64 {
        self.steps_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::Timestep;

    fn trajectory_of(len: usize, tag: f32) -> Trajectory {
        let mut traj = Trajectory::new();
        for i in 0..len {
            traj.register_timestep(Timestep::new(vec![tag], 0.0, 1.0, vec![i as f32], i + 1 == len));
        }
        traj
    }

    fn check_invariant(buffer: &ExperienceBuffer) {
        let sum: usize = buffer.iter().map(|e| e.timesteps).sum();
        assert_eq!(buffer.available_timesteps(), sum);
        assert!(buffer.available_timesteps() <= buffer.max_queue_size());
    }

    #[test]
    fn oldest_trajectory_is_evicted_first() {
        let mut buffer = ExperienceBuffer::new(10);
        for tag in 0..3 {
            buffer.insert(trajectory_of(4, tag as f32));
            check_invariant(&buffer);
        }

        assert_eq!(buffer.available_timesteps(), 8);
        let tags: Vec<f32> = buffer.iter().map(|e| e.trajectory.actions[0][0]).collect();
        assert_eq!(tags, vec![1.0, 2.0]);
    }

    #[test]
    fn oversized_trajectory_is_dropped_whole() {
        let mut buffer = ExperienceBuffer::new(5);
        buffer.insert(trajectory_of(2, 0.0));
        buffer.insert(trajectory_of(7, 1.0));
        check_invariant(&buffer);
        assert!(buffer.is_empty());
    }

    #[test]
    fn pop_n_waits_for_enough_timesteps() {
        let mut buffer = ExperienceBuffer::new(100);
        buffer.extend([trajectory_of(3, 0.0), trajectory_of(3, 1.0)]);

        assert!(buffer.pop_n(7).is_none());
        assert_eq!(buffer.available_timesteps(), 6);

        let popped = buffer.pop_n(4).unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].actions[0][0], 1.0, "newest comes out first");
        assert_eq!(buffer.available_timesteps(), 0);
        check_invariant(&buffer);
    }

    #[test]
    fn pop_up_to_takes_what_is_there() {
        let mut buffer = ExperienceBuffer::new(100);
        assert!(buffer.pop_up_to(10).is_empty());

        let received = buffer.extend([trajectory_of(2, 0.0), trajectory_of(5, 1.0), trajectory_of(1, 2.0)]);
        assert_eq!(received, 8);

        let popped = buffer.pop_up_to(3);
        assert_eq!(popped.iter().map(Trajectory::len).sum::<usize>(), 6);
        assert_eq!(buffer.available_timesteps(), 2);
        check_invariant(&buffer);
    }

    #[test]
    fn throughput_is_an_ema_sampled_each_second() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::starting_at(start);

        meter.record_at(500, start + Duration::from_millis(400));
        assert_eq!(meter.steps_per_second(), 0.0);

        meter.record_at(500, start + Duration::from_secs(1));
        assert!((meter.steps_per_second() - 100.0).abs() < 1e-9);

        meter.record_at(2000, start + Duration::from_secs(3));
        assert!((meter.steps_per_second() - (90.0 + 100.0)).abs() < 1e-9);
    }
}
