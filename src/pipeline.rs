use crate::runner::{close_pipeline, run_pipeline, set_pipeline_epochs};
use crate::stage::{Stage, Stream};
use anyhow::Result;

/// An ordered list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: impl Stage + 'static) {
        self.stages.push(Box::new(stage));
    }

    #[must_use]
    pub fn with(mut self, stage: impl Stage + 'static) -> Self {
        self.push(stage);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name())
    }

    pub fn set_epoch(&mut self, epoch: i64) {
        set_pipeline_epochs(&mut self.stages, epoch);
    }

    /// Assemble a fresh stream from the first stage.
    ///
    /// # Errors
    ///
    /// See [`run_pipeline`].
    pub fn run(&self) -> Result<Stream> {
        run_pipeline(&self.stages)
    }

    /// Close stages in reverse order.
    pub fn close(&mut self) {
        close_pipeline(&mut self.stages);
    }
}

impl From<Vec<Box<dyn Stage>>> for Pipeline {
    fn from(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }
}
