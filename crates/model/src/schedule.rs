use crate::config::{checkpoint_violations, ConfigError};

/// What the encoder does around the layer at one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStep {
    /// Run the layer on the carried representation.
    Plain,
    /// Replace the carried representation with the history combination,
    /// then run the layer. Positions listed in `k`.
    CombineThenRun,
    /// Run the layer, then record its output. Positions just before a
    /// checkpoint.
    RunThenRecord,
}

/// Per-position steps derived once from a checkpoint list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSchedule {
    checkpoints: Vec<usize>,
    steps: Vec<LayerStep>,
}

impl CheckpointSchedule {
    pub fn new(k: &[usize], layers: usize) -> Result<Self, ConfigError> {
        let errors = checkpoint_violations(k, layers);
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        let steps = (0..layers)
            .map(|position| {
                if k.contains(&position) {
                    LayerStep::CombineThenRun
                } else if k.contains(&(position + 1)) {
                    LayerStep::RunThenRecord
                } else {
                    LayerStep::Plain
                }
            })
            .collect::<Vec<_>>();
        let schedule = Self {
            checkpoints: k.to_vec(),
            steps,
        };
        log::debug!(
            "checkpoint_schedule layers={} records={} combines={}",
            layers,
            schedule.record_events(),
            schedule.combine_events()
        );
        Ok(schedule)
    }

    pub fn checkpoints(&self) -> &[usize] {
        &self.checkpoints
    }

    pub fn steps(&self) -> &[LayerStep] {
        &self.steps
    }

    pub fn step(&self, position: usize) -> Option<LayerStep> {
        self.steps.get(position).copied()
    }

    pub fn num_layers(&self) -> usize {
        self.steps.len()
    }

    /// Records per pass, counting the input representation.
    pub fn record_events(&self) -> usize {
        1 + self
            .steps
            .iter()
            .filter(|step| **step == LayerStep::RunThenRecord)
            .count()
    }

    /// Combines per pass, counting the final one after the last layer.
    pub fn combine_events(&self) -> usize {
        1 + self
            .steps
            .iter()
            .filter(|step| **step == LayerStep::CombineThenRun)
            .count()
    }
}
