//! Command queues.
//!
//! The host queue batches dispatches and runs them in submission order on [`CommandQueue::finish`],
//! which is the synchronous wait of the execution model.

use std::sync::Arc;

use tracing::debug;

use crate::device::{Launch, Program};
use crate::error::Result;

pub trait CommandQueue {
    /// Enqueue one dispatch.
    fn dispatch(&mut self, program: Arc<dyn Program>, launch: Launch) -> Result<()>;

    /// Block until every enqueued dispatch has completed.
    fn finish(&mut self) -> Result<()>;
}

/// In-order queue for the host reference device.
#[derive(Debug, Default)]
pub struct HostQueue {
    pending: Vec<(Arc<dyn Program>, Launch)>,
    completed: usize,
}

impl HostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches enqueued but not yet run.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Dispatches run since the queue was created.
    pub fn completed(&self) -> usize {
        self.completed
    }
}

impl CommandQueue for HostQueue {
    fn dispatch(&mut self, program: Arc<dyn Program>, launch: Launch) -> Result<()> {
        self.pending.push((program, launch));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        debug!(dispatches = pending.len(), "finishing host queue");
        for (program, launch) in pending {
            program.execute(&launch)?;
            self.completed += 1;
        }
        Ok(())
    }
}
