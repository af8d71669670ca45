//! Schedule of a training run
//!
//! A run trains `epochs` passes of `floor(samples / batch)` mini-batches.
//! Every mini-batch fans out over `shards` Jobs, each reading the same sample
//! window of its own shard file. The window is `ceil(batch / shards)` samples
//! wide, advances by its width after every mini-batch and restarts at zero
//! with each epoch.

use crate::crd::TrainingRequestSpec;
use crate::Error;

/// Half-open sample window `[start, end)` inside a shard file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleWindow {
    pub start: u64,
    pub end: u64,
}

/// One fan-out/aggregate cycle of the run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    pub epoch: u32,
    pub mini_batch: u64,
    pub window: SampleWindow,
}

/// Shape of a training run derived from the request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrainingPlan {
    pub epochs: u32,
    pub mini_batches: u64,
    pub shards: u32,
    pub window_width: u64,
}

impl TrainingPlan {
    /// Derive the plan, rejecting a zero batch size or zero shards
    pub fn new(spec: &TrainingRequestSpec) -> Result<Self, Error> {
        if spec.batch_size == 0 {
            return Err(Error::ZeroBatchSize);
        }
        if spec.shard_count == 0 {
            return Err(Error::validation("shardCount must be at least 1"));
        }

        let batch = u64::from(spec.batch_size);
        let shards = u64::from(spec.shard_count);

        Ok(Self {
            epochs: spec.epochs,
            mini_batches: u64::from(spec.number_of_samples) / batch,
            shards: spec.shard_count,
            window_width: batch.div_ceil(shards),
        })
    }

    /// Sample window of a mini-batch
    pub fn window(&self, mini_batch: u64) -> SampleWindow {
        let start = mini_batch * self.window_width;
        SampleWindow {
            start,
            end: start + self.window_width,
        }
    }

    /// Total number of fan-out/aggregate cycles
    pub fn cycles(&self) -> u64 {
        u64::from(self.epochs) * self.mini_batches
    }

    /// Every cycle in execution order
    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        (0..self.epochs).flat_map(move |epoch| {
            (0..self.mini_batches).map(move |mini_batch| Step {
                epoch,
                mini_batch,
                window: self.window(mini_batch),
            })
        })
    }
}
