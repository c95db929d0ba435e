//! Step statistics shared by the solver backends

/// Counts steps and accumulated simulated time
#[derive(Debug, Clone, Default)]
pub struct SolverStats {
    pub step_count: u64,
    pub delta_accumulator: f32,
}

impl SolverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed step
    pub fn record_step(&mut self, delta_time: f32) {
        self.step_count += 1;
        self.delta_accumulator += delta_time;
    }

    /// Average time step over the solver's lifetime
    pub fn average_frame_time(&self) -> f32 {
        if self.step_count > 0 {
            self.delta_accumulator / self.step_count as f32
        } else {
            0.0
        }
    }

    /// Steps per simulated second
    pub fn frequency(&self) -> f32 {
        let avg = self.average_frame_time();
        if avg > 0.0 {
            1.0 / avg
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency() {
        let mut stats = SolverStats::new();
        assert_eq!(stats.frequency(), 0.0);
        stats.record_step(0.5);
        stats.record_step(0.5);
        assert_eq!(stats.step_count, 2);
        assert_eq!(stats.average_frame_time(), 0.5);
        assert_eq!(stats.frequency(), 2.0);
    }
}
