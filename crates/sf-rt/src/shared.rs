//! Command-backed shared state cell
//!
//! Non-realtime writes become visible to the realtime thread through the
//! command queue: `write` enqueues a command whose `execute` swaps the new
//! value into the realtime slot; the superseded value travels back and is
//! dropped on the non-realtime side.  A shadow copy for non-realtime reads
//! is published in the cleanup phase.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Command, CommandQueue, RtCell};

/// A single value shared between the non-realtime and the realtime thread.
pub struct SharedData<T> {
    queue: Arc<CommandQueue>,
    /// Realtime-visible slot
    rt: RtCell<T>,
    /// Last value whose set-command finished, for non-realtime reads
    shadow: Mutex<T>,
}

impl<T: Clone + Send + 'static> SharedData<T> {
    pub fn new(queue: Arc<CommandQueue>, initial: T) -> Arc<Self> {
        Arc::new(Self {
            queue,
            rt: RtCell::new(initial.clone()),
            shadow: Mutex::new(initial),
        })
    }

    /// Write a new value from the non-realtime thread.
    ///
    /// Non-blocking (apart from momentary command-queue backpressure); the
    /// value is visible to the realtime thread no later than the next audio
    /// period.
    pub fn write(self: &Arc<Self>, value: T) {
        self.queue.push(Box::new(SetCommand {
            cell: Arc::clone(self),
            shadow: Some(value.clone()),
            value: Some(value),
            retired: None,
        }));
    }

    /// Read the current value from the realtime thread.
    ///
    /// Only valid on the realtime thread; set-commands never run while
    /// items are being processed, so the reference is stable for the
    /// duration of a graph phase.
    pub fn read(&self) -> &T {
        unsafe { self.rt.get_ref() }
    }

    /// Read the last fully-propagated value from the non-realtime thread.
    pub fn get(&self) -> T {
        self.shadow.lock().clone()
    }
}

struct SetCommand<T> {
    cell: Arc<SharedData<T>>,
    /// Value to move into the realtime slot
    value: Option<T>,
    /// Copy for the non-realtime shadow, applied during cleanup
    shadow: Option<T>,
    /// Superseded value, carried back for non-realtime disposal
    retired: Option<T>,
}

impl<T: Clone + Send + 'static> Command for SetCommand<T> {
    fn execute(&mut self) {
        if let Some(value) = self.value.take() {
            // No allocation, no deallocation: plain swap.
            let slot = unsafe { self.cell.rt.get() };
            self.retired = Some(std::mem::replace(slot, value));
        }
    }

    fn cleanup(&mut self) {
        if let Some(shadow) = self.shadow.take() {
            *self.cell.shadow.lock() = shadow;
        }
        // Retired value is dropped here, in the non-realtime thread.
        self.retired = None;
    }
}
