//! Command queue between the non-realtime and the realtime thread
//!
//! Commands are pushed by the non-realtime thread, executed by the realtime
//! thread (`process_commands`) and travel back for cleanup in the
//! non-realtime thread.  Resource deallocation only ever happens in
//! `cleanup` or when the command itself is dropped - both on the
//! non-realtime side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::Fifo;

/// Sleep interval while spinning on a full in-queue or an empty out-queue.
const RETRY_SLEEP: Duration = Duration::from_micros(50);

/// A mutation that crosses the thread boundary.
///
/// `execute` runs exactly once on the realtime thread (or inline on the
/// non-realtime thread while the queue is deactivated); `cleanup` runs
/// exactly once afterwards on the non-realtime thread.
pub trait Command: Send {
    /// The actual command; called from the realtime thread.
    fn execute(&mut self);

    /// Cleanup of resources; called from the non-realtime thread.
    fn cleanup(&mut self);
}

/// Dummy command used by [`CommandQueue::wait`] to synchronize with the
/// realtime thread.
struct NoOpCommand {
    done: Arc<AtomicBool>,
}

impl Command for NoOpCommand {
    fn execute(&mut self) {}

    fn cleanup(&mut self) {
        self.done.store(true, Ordering::Release);
    }
}

/// Bidirectional command channel.
///
/// Exactly one non-realtime thread and one realtime thread may use the
/// queue at a time; multiple non-realtime writers have to be serialized by
/// the caller.
pub struct CommandQueue {
    /// Commands to execute in the realtime thread
    in_fifo: Fifo<Box<dyn Command>>,
    /// Executed commands to clean up in the non-realtime thread
    out_fifo: Fifo<Box<dyn Command>>,
    /// While inactive, commands are executed inline on the pushing thread
    active: AtomicBool,
}

impl CommandQueue {
    /// Create a queue holding at most `size` commands in flight per
    /// direction.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            in_fifo: Fifo::new(size),
            out_fifo: Fifo::new(size),
            active: AtomicBool::new(true),
        })
    }

    // ------------ non-realtime side ------------

    /// Push a command to be executed in the realtime thread.
    ///
    /// Drains the cleanup queue first so the realtime thread can always
    /// hand commands back.  Spins with short sleeps while the in-queue is
    /// full; this is bounded because the realtime thread drains the queue
    /// every period.  While the queue is deactivated the command executes
    /// inline and is placed on the cleanup queue.
    pub fn push(&self, cmd: Box<dyn Command>) {
        self.cleanup_commands();

        if self.active.load(Ordering::Relaxed) {
            let mut cmd = cmd;
            loop {
                match self.in_fifo.push(cmd) {
                    Ok(()) => break,
                    Err(back) => {
                        cmd = back;
                        thread::sleep(RETRY_SLEEP);
                    }
                }
            }
        } else {
            let mut cmd = cmd;
            cmd.execute();
            // Not cleaned up here, otherwise wait() wouldn't work.
            if let Err(mut cmd) = self.out_fifo.push(cmd) {
                log::warn!("command queue: cleanup queue full while inactive");
                cmd.cleanup();
            }
        }
    }

    /// Block until all commands pushed before this call have been executed
    /// and cleaned up.
    pub fn wait(&self) {
        let done = Arc::new(AtomicBool::new(false));
        self.push(Box::new(NoOpCommand {
            done: Arc::clone(&done),
        }));

        while !done.load(Ordering::Acquire) {
            match self.out_fifo.pop() {
                Some(mut cmd) => cmd.cleanup(),
                None => thread::sleep(RETRY_SLEEP),
            }
        }
    }

    /// Trivial combination of [`push`](Self::push) and [`wait`](Self::wait).
    pub fn push_and_wait(&self, cmd: Box<dyn Command>) {
        self.push(cmd);
        self.wait();
    }

    /// Clean up all commands in the cleanup queue.
    pub fn cleanup_commands(&self) {
        while let Some(mut cmd) = self.out_fifo.pop() {
            cmd.cleanup();
        }
    }

    /// Deactivate the queue; subsequent commands execute inline on the
    /// pushing thread.
    ///
    /// Fails (returns `false`) if commands are still waiting for the
    /// realtime thread.
    pub fn deactivate(&self) -> bool {
        self.cleanup_commands();
        if self.in_fifo.is_empty() {
            self.active.store(false, Ordering::Relaxed);
        }
        !self.active.load(Ordering::Relaxed)
    }

    /// Re-activate the queue.  See [`deactivate`](Self::deactivate).
    pub fn reactivate(&self) {
        self.cleanup_commands();
        debug_assert!(self.in_fifo.is_empty());
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    // ------------ realtime side ------------

    /// Execute all queued commands and hand them over for cleanup.
    pub fn process_commands(&self) {
        while let Some(mut cmd) = self.in_fifo.pop() {
            cmd.execute();
            if let Err(cmd) = self.out_fifo.push(cmd) {
                // The cleanup queue has the same capacity as the in-queue,
                // so this is a sizing bug on the caller's side.  The
                // command leaks its cleanup work; dropping it here would
                // deallocate on the realtime thread.
                log::warn!("command queue: cleanup queue overflow, command dropped");
                std::mem::forget(cmd);
            }
        }
    }

    /// Check if commands are waiting for the realtime thread.
    pub fn commands_available(&self) -> bool {
        !self.in_fifo.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingCommand {
        executed: Arc<AtomicUsize>,
        cleaned: Arc<AtomicUsize>,
    }

    impl Command for CountingCommand {
        fn execute(&mut self) {
            self.executed.fetch_add(1, Ordering::SeqCst);
        }

        fn cleanup(&mut self) {
            // cleanup must run strictly after execute
            assert!(self.executed.load(Ordering::SeqCst) > self.cleaned.load(Ordering::SeqCst));
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    // Execute and cleanup run exactly once per command, in that order.
    #[test]
    fn test_execute_then_cleanup_exactly_once() {
        let queue = CommandQueue::new(16);
        let executed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            queue.push(Box::new(CountingCommand {
                executed: Arc::clone(&executed),
                cleaned: Arc::clone(&cleaned),
            }));
        }

        // "realtime thread"
        queue.process_commands();
        queue.cleanup_commands();

        assert_eq!(executed.load(Ordering::SeqCst), 10);
        assert_eq!(cleaned.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_wait_with_rt_thread() {
        let queue = CommandQueue::new(8);
        let executed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let rt = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for _ in 0..200 {
                    queue.process_commands();
                    thread::sleep(Duration::from_micros(100));
                }
            })
        };

        for _ in 0..20 {
            queue.push(Box::new(CountingCommand {
                executed: Arc::clone(&executed),
                cleaned: Arc::clone(&cleaned),
            }));
        }
        queue.wait();

        assert_eq!(executed.load(Ordering::SeqCst), 20);
        assert_eq!(cleaned.load(Ordering::SeqCst), 20);
        rt.join().unwrap();
    }

    #[test]
    fn test_inactive_queue_executes_inline() {
        let queue = CommandQueue::new(8);
        assert!(queue.deactivate());

        let executed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        queue.push(Box::new(CountingCommand {
            executed: Arc::clone(&executed),
            cleaned: Arc::clone(&cleaned),
        }));

        // executed inline, cleanup pending until the next drain
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        queue.cleanup_commands();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        queue.reactivate();
        assert!(queue.is_active());
    }

    #[test]
    fn test_deactivate_fails_with_pending_commands() {
        let queue = CommandQueue::new(8);
        let executed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        queue.push(Box::new(CountingCommand {
            executed: Arc::clone(&executed),
            cleaned: Arc::clone(&cleaned),
        }));

        assert!(!queue.deactivate());
        queue.process_commands();
        assert!(queue.deactivate());
    }
}
