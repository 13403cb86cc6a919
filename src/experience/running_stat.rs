//! Welford running mean and standard deviation over a scalar stream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStat {
    count: u64,
    mean: f64,
    /// Sum of squared deviations from the running mean.
    m2: f64,
}

impl RunningStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn extend<I: IntoIterator<Item = f32>>(&mut self, xs: I) {
        for x in xs {
            self.push(x as f64);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 0 until two samples have been seen.
    pub fn mean(&self) -> f64 {
        if self.count < 2 { 0.0 } else { self.mean }
    }

    /// 1 until two samples have been seen, and 1 again if the samples carry
    /// no variance, so the result is always safe to divide by.
    pub fn std(&self) -> f64 {
        if self.count < 2 {
            return 1.0;
        }
        let var = self.m2 / (self.count - 1) as f64;
        if var <= 0.0 { 1.0 } else { var.sqrt() }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
