//! sf-rt: Realtime plumbing for the Soundfield engine
//!
//! Lock-free communication between the non-realtime control plane and the
//! realtime audio thread:
//! - SPSC `Fifo` (wait-free push/pop)
//! - `CommandQueue` (execute in RT, clean up in NRT)
//! - `SharedData` (single-cell command-backed state)
//! - `RtList` (non-blocking list mutation through commands)
//! - `WorkerPool` + `MimoProcessor` (per-period list scheduling)
//!
//! CRITICAL: the audio thread never blocks and never allocates.  All
//! allocation and deallocation happens on the non-realtime side; retired
//! objects travel back through the command queue and are dropped there.

mod cell;
mod command;
mod fifo;
mod processor;
mod rtlist;
mod shared;
mod worker;

pub use cell::RtCell;
pub use command::{Command, CommandQueue};
pub use fifo::Fifo;
pub use processor::{
    AudioBackend, BackendError, MimoProcessor, NullBackend, Processable, Query, QueryArm,
};
pub use rtlist::{RtKeyed, RtList};
pub use shared::SharedData;
pub use worker::{Semaphore, WorkerPool};
