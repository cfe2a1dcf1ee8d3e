//! Model sweep state and seed policy.
//!
//! A sweep re-runs the whole template once per checkpoint. The high-res
//! checkpoint sweep is the inner loop: for each model, every high-res model
//! is visited before the model index advances.

/// What [`ModelSweepState::advance`] moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStep {
    /// Next high-res checkpoint, same main checkpoint.
    Highres,
    /// Next main checkpoint; high-res index reset.
    Model,
    /// Every combination has been run.
    Complete,
}

/// Checkpoint overrides for one compile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOverrides {
    pub ckpt_file: Option<String>,
    pub highres_ckpt_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSweepState {
    models: Vec<String>,
    model_index: usize,
    highres_models: Vec<String>,
    highres_index: usize,
    total_loops: u32,
}

impl ModelSweepState {
    pub fn new(models: Vec<String>, highres_models: Vec<String>) -> Self {
        Self {
            models,
            highres_models,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        !self.models.is_empty() || !self.highres_models.is_empty()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn current_model(&self) -> Option<&str> {
        self.models.get(self.model_index).map(String::as_str)
    }

    pub fn current_highres_model(&self) -> Option<&str> {
        self.highres_models
            .get(self.highres_index)
            .map(String::as_str)
    }

    pub fn overrides(&self) -> SweepOverrides {
        SweepOverrides {
            ckpt_file: self.current_model().map(str::to_string),
            highres_ckpt_file: self.current_highres_model().map(str::to_string),
        }
    }

    /// Move to the next combination. `Complete` leaves the indices in
    /// place; call [`ModelSweepState::restart`] to loop again.
    pub fn advance(&mut self) -> SweepStep {
        if self.highres_index + 1 < self.highres_models.len() {
            self.highres_index += 1;
            return SweepStep::Highres;
        }
        if self.model_index + 1 < self.models.len() {
            self.model_index += 1;
            self.highres_index = 0;
            return SweepStep::Model;
        }
        SweepStep::Complete
    }

    /// Rewind to the first combination, keeping the loop counter.
    pub fn restart(&mut self) {
        self.model_index = 0;
        self.highres_index = 0;
    }

    pub fn total_loops(&self) -> u32 {
        self.total_loops
    }

    /// Count one completed pass over the queue.
    pub fn record_loop(&mut self) {
        self.total_loops += 1;
    }

    /// Amount added to a fixed template seed for the current pass.
    ///
    /// With an active sweep the seed only moves once every
    /// `combinations` passes, so every checkpoint in one sweep round renders
    /// with the same seed. The division floors.
    pub fn seed_offset(&self) -> i64 {
        let combinations = self.models.len().max(1) * self.highres_models.len().max(1);
        if self.is_active() {
            i64::from(self.total_loops) / combinations as i64
        } else {
            i64::from(self.total_loops)
        }
    }
}

/// Apply the seed offset to a template seed. `-1` never changes.
pub fn seed_for_loop(base_seed: i64, offset: i64) -> i64 {
    if base_seed < 0 {
        base_seed
    } else {
        base_seed + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn model_sweep_visits_each_model_once() {
        let mut sweep = ModelSweepState::new(names(&["A", "B"]), Vec::new());
        assert_eq!(sweep.current_model(), Some("A"));
        assert_eq!(sweep.advance(), SweepStep::Model);
        assert_eq!(sweep.current_model(), Some("B"));
        assert_eq!(sweep.advance(), SweepStep::Complete);
        assert_eq!(sweep.current_model(), Some("B"));
    }

    #[test]
    fn highres_sweep_is_inner_loop() {
        let mut sweep = ModelSweepState::new(names(&["A", "B"]), names(&["X", "Y"]));
        let mut seen = vec![(sweep.current_model().unwrap().to_string(), sweep.current_highres_model().unwrap().to_string())];
        while sweep.advance() != SweepStep::Complete {
            seen.push((
                sweep.current_model().unwrap().to_string(),
                sweep.current_highres_model().unwrap().to_string(),
            ));
        }
        let seen: Vec<(&str, &str)> = seen.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        assert_eq!(seen, vec![("A", "X"), ("A", "Y"), ("B", "X"), ("B", "Y")]);
    }

    #[test]
    fn seed_repeats_across_models_within_a_round() {
        let mut sweep = ModelSweepState::new(names(&["A", "B"]), Vec::new());
        let mut offsets = Vec::new();
        for _ in 0..5 {
            offsets.push(sweep.seed_offset());
            sweep.record_loop();
        }
        assert_eq!(offsets, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn seed_increments_every_loop_without_sweep() {
        let mut sweep = ModelSweepState::default();
        sweep.record_loop();
        sweep.record_loop();
        assert_eq!(sweep.seed_offset(), 2);
        assert_eq!(seed_for_loop(100, sweep.seed_offset()), 102);
        assert_eq!(seed_for_loop(-1, sweep.seed_offset()), -1);
    }

    #[test]
    fn restart_keeps_loop_count() {
        let mut sweep = ModelSweepState::new(names(&["A", "B"]), Vec::new());
        sweep.advance();
        sweep.record_loop();
        sweep.restart();
        assert_eq!(sweep.current_model(), Some("A"));
        assert_eq!(sweep.total_loops(), 1);
    }
}
