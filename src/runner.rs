//! Pipeline execution.
//!
//! Stages are chained front to back: the first one produces the source
//! stream, each later one wraps its predecessor. Nothing is pulled until the
//! caller iterates the returned stream.

use crate::error::DatasetError;
use crate::stage::{Stage, Stream};
use anyhow::Result;
use tracing::{debug, trace};

/// Chain `stages` into one lazy stream.
///
/// # Errors
///
/// [`DatasetError::Assembly`] if the list is empty or a stage returns no
/// stream.
pub fn run_pipeline(stages: &[Box<dyn Stage>]) -> Result<Stream> {
    let Some((first, rest)) = stages.split_first() else {
        return Err(DatasetError::Assembly {
            index: 0,
            stage: "<empty pipeline>".to_string(),
        }
        .into());
    };
    let mut stream = first.apply(None).ok_or_else(|| assembly_error(0, first.as_ref()))?;
    for (i, stage) in rest.iter().enumerate() {
        trace!(index = i + 1, stage = stage.name(), "assembling stage");
        stream = stage
            .apply(Some(stream))
            .ok_or_else(|| assembly_error(i + 1, stage.as_ref()))?;
    }
    Ok(stream)
}

fn assembly_error(index: usize, stage: &dyn Stage) -> anyhow::Error {
    DatasetError::Assembly {
        index,
        stage: stage.name().to_string(),
    }
    .into()
}

/// Hand `epoch` to every stage that wants it.
pub fn set_pipeline_epochs(stages: &mut [Box<dyn Stage>], epoch: i64) {
    let mut aware = 0;
    for stage in stages.iter_mut() {
        if let Some(s) = stage.epoch_aware() {
            s.set_epoch(epoch);
            aware += 1;
        }
    }
    debug!(epoch, stages = aware, "set pipeline epoch");
}

/// Release stage resources, last stage first.
pub fn close_pipeline(stages: &mut [Box<dyn Stage>]) {
    for stage in stages.iter_mut().rev() {
        let name = stage.name().to_string();
        if let Some(s) = stage.closeable() {
            trace!(stage = %name, "closing stage");
            s.close();
        }
    }
}
