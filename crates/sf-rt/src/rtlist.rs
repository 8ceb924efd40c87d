//! A list for realtime access and non-realtime modification
//!
//! The list is mutated from the non-realtime thread with `add`, `rem` and
//! `clear`, which enqueue commands on the shared `CommandQueue`.  The
//! actual splicing happens when the realtime thread calls
//! `process_commands`; element destruction happens in the command's cleanup
//! phase, back on the non-realtime side.  Realtime iteration is plain list
//! traversal with no locks and no allocation.

use std::cell::UnsafeCell;
use std::collections::LinkedList;
use std::sync::Arc;

use crate::{Command, CommandQueue};

/// Elements of an [`RtList`] are identified by a stable key derived from
/// their heap address.
pub trait RtKeyed {
    fn key(&self) -> usize;
}

impl<T: ?Sized> RtKeyed for Box<T> {
    fn key(&self) -> usize {
        (&**self as *const T).cast::<()>() as usize
    }
}

impl<T: ?Sized> RtKeyed for Arc<T> {
    fn key(&self) -> usize {
        Arc::as_ptr(self).cast::<()>() as usize
    }
}

/// List whose mutations are commands.
///
/// Single non-realtime writer (serialized by the caller) and single
/// realtime reader.  Realtime-side iteration stays valid across any
/// sequence of commands issued from the non-realtime side, because nodes
/// are only relinked between processing phases.
pub struct RtList<T: Send + 'static> {
    queue: Arc<CommandQueue>,
    list: UnsafeCell<LinkedList<T>>,
}

// The inner list is only touched by the realtime thread (iteration and
// command execution); the non-realtime side merely enqueues commands.
unsafe impl<T: Send> Send for RtList<T> {}
unsafe impl<T: Send> Sync for RtList<T> {}

impl<T: RtKeyed + Send + 'static> RtList<T> {
    pub fn new(queue: Arc<CommandQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            list: UnsafeCell::new(LinkedList::new()),
        })
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut LinkedList<T> {
        &mut *self.list.get()
    }

    // ------------ non-realtime side ------------

    /// Add an element; ownership passes to the list.  Returns the
    /// element's key for later [`rem`](Self::rem).
    pub fn add(self: &Arc<Self>, item: T) -> usize {
        let key = item.key();
        let mut items = LinkedList::new();
        items.push_back(item);
        self.queue.push(Box::new(AddCommand {
            list: Arc::clone(self),
            items,
        }));
        key
    }

    /// Add a range of elements with a single command.
    pub fn add_range(self: &Arc<Self>, range: impl IntoIterator<Item = T>) -> Vec<usize> {
        let items: LinkedList<T> = range.into_iter().collect();
        let keys = items.iter().map(|i| i.key()).collect();
        self.queue.push(Box::new(AddCommand {
            list: Arc::clone(self),
            items,
        }));
        keys
    }

    /// Remove the element with the given key.  The element is dropped in
    /// the non-realtime thread during command cleanup.
    pub fn rem(self: &Arc<Self>, key: usize) {
        self.queue.push(Box::new(RemCommand {
            list: Arc::clone(self),
            key,
            victims: LinkedList::new(),
        }));
    }

    /// Remove all elements.
    pub fn clear(self: &Arc<Self>) {
        self.queue.push(Box::new(ClearCommand {
            list: Arc::clone(self),
            victims: LinkedList::new(),
        }));
    }

    /// Move all elements of `other` to the end of this list, bypassing the
    /// command queue.
    ///
    /// Both lists must share the same queue, and the realtime thread must
    /// not be iterating either list (i.e. the queue is deactivated or the
    /// call happens between periods under the caller's control).
    pub fn splice(&self, other: &RtList<T>) {
        assert!(
            Arc::ptr_eq(&self.queue, &other.queue),
            "RtList::splice requires lists on the same command queue"
        );
        unsafe {
            self.inner().append(other.inner());
        }
    }

    // ------------ realtime side ------------

    pub fn len(&self) -> usize {
        unsafe { (*self.list.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        unsafe { (*self.list.get()).is_empty() }
    }

    /// Visit every element whose position is congruent to `residue` modulo
    /// `stride`.
    ///
    /// This is the worker-pool entry point: concurrent calls with distinct
    /// residues partition the list, and the traversal itself is read-only.
    pub fn process_items(&self, residue: usize, stride: usize, f: impl Fn(&T)) {
        let list = unsafe { &*self.list.get() };
        for (n, item) in list.iter().enumerate() {
            if n % stride == residue {
                f(item);
            }
        }
    }

    /// Visit every element (realtime thread only).
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        let list = unsafe { &*self.list.get() };
        for item in list.iter() {
            f(item);
        }
    }
}

/// Command to splice new elements onto the target list.
struct AddCommand<T: Send + 'static> {
    list: Arc<RtList<T>>,
    items: LinkedList<T>,
}

impl<T: RtKeyed + Send> Command for AddCommand<T> {
    fn execute(&mut self) {
        // Splicing relinks nodes; no allocation happens here.
        unsafe { self.list.inner() }.append(&mut self.items);
    }

    fn cleanup(&mut self) {}
}

/// Command to extract one element and dispose of it in the non-realtime
/// thread.
struct RemCommand<T: Send + 'static> {
    list: Arc<RtList<T>>,
    key: usize,
    victims: LinkedList<T>,
}

impl<T: RtKeyed + Send> Command for RemCommand<T> {
    fn execute(&mut self) {
        let inner = unsafe { self.list.inner() };
        let index = inner.iter().position(|item| item.key() == self.key);
        if let Some(index) = index {
            let mut tail = inner.split_off(index);
            if let Some(victim) = tail.pop_front() {
                self.victims.push_back(victim);
            }
            inner.append(&mut tail);
        } else {
            log::warn!("RtList: rem() for unknown element");
        }
    }

    fn cleanup(&mut self) {
        // Dropped here, in the non-realtime thread.
        self.victims.clear();
    }
}

/// Command to swap out the whole list and dispose of it in the non-realtime
/// thread.
struct ClearCommand<T: Send + 'static> {
    list: Arc<RtList<T>>,
    victims: LinkedList<T>,
}

impl<T: RtKeyed + Send> Command for ClearCommand<T> {
    fn execute(&mut self) {
        self.victims = std::mem::take(unsafe { self.list.inner() });
    }

    fn cleanup(&mut self) {
        self.victims.clear();
    }
}
