use std::{
    ops::Add,
    sync::{Arc, Mutex, PoisonError},
};

use weft_core::{ObjectId, Op};

use crate::{
    fiber::{self, Suspension},
    session,
};

// SHARED CELL
// ================================================================================================

/// The real storage behind an [`Atomic`] handle.
///
/// A mutex stands in for hardware atomics so the cell can hold any `Send` value. At most one
/// fiber is runnable at any instant, so the lock is never contended; poisoning is recovered
/// from because a fiber may unwind while other handles to the cell are still live.
#[derive(Debug)]
struct SharedCell<T>(Mutex<T>);

impl<T> SharedCell<T> {
    fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

// ATOMIC HANDLE
// ================================================================================================

/// Handle to one shared atomic cell: the underlying storage paired with the object-id that
/// names the cell for scheduling purposes.
///
/// Clones alias the same cell; clone a handle into every process closure that shares it.
#[derive(Clone, Debug)]
pub struct Atomic<T> {
    cell: Arc<SharedCell<T>>,
    id: ObjectId,
}

impl<T> Atomic<T> {
    /// Returns the object-id naming this cell within the current run.
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

// OPERATIONS
// ================================================================================================

/// Creates a new shared cell holding `value`.
///
/// Under an active trace session this is a schedulable step: the calling fiber suspends, and
/// the cell comes into existence when the replayer executes the corresponding `make` step,
/// drawing the next object-id in schedule order. Anywhere else the cell is created
/// immediately.
pub fn make<T: Send>(value: T) -> Atomic<T> {
    let id = match fiber::suspend(Op::Make, None) {
        Suspension::Resumed(id) => id.expect("make resumptions always carry an object-id"),
        Suspension::Direct => session::alloc_object_id(),
    };
    Atomic { cell: Arc::new(SharedCell::new(value)), id }
}

/// Reads the cell.
pub fn get<T: Clone + Send>(handle: &Atomic<T>) -> T {
    fiber::suspend(Op::Get, Some(handle.id));
    handle.cell.with(|v| v.clone())
}

/// Overwrites the cell with `value`.
pub fn set<T: Send>(handle: &Atomic<T>, value: T) {
    fiber::suspend(Op::Set, Some(handle.id));
    handle.cell.with(|v| *v = value);
}

/// Overwrites the cell with `value` and returns the previous value.
pub fn exchange<T: Send>(handle: &Atomic<T>, value: T) -> T {
    fiber::suspend(Op::Exchange, Some(handle.id));
    handle.cell.with(|v| core::mem::replace(v, value))
}

/// Writes `new` if the cell currently holds `seen`; returns whether the write happened.
pub fn compare_and_set<T: PartialEq + Send>(handle: &Atomic<T>, seen: T, new: T) -> bool {
    fiber::suspend(Op::CompareAndSwap, Some(handle.id));
    handle.cell.with(|v| {
        if *v == seen {
            *v = new;
            true
        } else {
            false
        }
    })
}

/// Adds `n` to the cell and returns the previous value.
pub fn fetch_and_add<T>(handle: &Atomic<T>, n: T) -> T
where
    T: Copy + Add<Output = T> + Send,
{
    fiber::suspend(Op::FetchAndAdd, Some(handle.id));
    handle.cell.with(|v| {
        let old = *v;
        *v = old + n;
        old
    })
}

/// Increments an integer cell by one.
pub fn incr(handle: &Atomic<i64>) {
    fetch_and_add(handle, 1);
}

/// Decrements an integer cell by one.
pub fn decr(handle: &Atomic<i64>) {
    fetch_and_add(handle, -1);
}

// TESTS
// ================================================================================================
