//! Cross-process exclusive lock with in-process reentrancy.
//!
//! The OS-level advisory lock (`flock` via fs2) is taken on a sidecar
//! `.lock` file only by the outermost acquisition in this process. Nested
//! acquisitions on the same thread bump a depth counter under a
//! `parking_lot::ReentrantMutex`; other threads in the process block on the
//! mutex before ever touching the file lock.

use crate::errors::StateError;
use fs2::FileExt;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

#[derive(Default)]
struct LockSlot {
    depth: Cell<usize>,
    file: RefCell<Option<File>>,
    mutating: Cell<bool>,
}

type SharedSlot = Arc<ReentrantMutex<LockSlot>>;

/// One slot per lock path, shared by every store in the process that points
/// at the same file.
static SLOTS: LazyLock<Mutex<HashMap<PathBuf, Weak<ReentrantMutex<LockSlot>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn shared_slot(path: &Path) -> SharedSlot {
    let mut slots = SLOTS.lock();
    slots.retain(|_, weak| weak.strong_count() > 0);
    if let Some(slot) = slots.get(path).and_then(Weak::upgrade) {
        return slot;
    }
    let slot = Arc::new(ReentrantMutex::new(LockSlot::default()));
    slots.insert(path.to_path_buf(), Arc::downgrade(&slot));
    slot
}

#[derive(Clone)]
pub(crate) struct ProcessLock {
    path: PathBuf,
    slot: SharedSlot,
}

impl ProcessLock {
    pub(crate) fn new(path: PathBuf) -> Self {
        let key = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => dir
                .canonicalize()
                .map(|d| d.join(name))
                .unwrap_or_else(|_| path.clone()),
            _ => path.clone(),
        };
        let slot = shared_slot(&key);
        Self { path, slot }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Block until this thread holds the lock.
    pub(crate) fn acquire(&self) -> Result<LockGuard<'_>, StateError> {
        let guard = self.slot.lock();
        if guard.depth.get() == 0 {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.path)
                .map_err(|source| StateError::Lock {
                    path: self.path.clone(),
                    source,
                })?;
            file.lock_exclusive().map_err(|source| StateError::Lock {
                path: self.path.clone(),
                source,
            })?;
            *guard.file.borrow_mut() = Some(file);
        }
        guard.depth.set(guard.depth.get() + 1);
        Ok(LockGuard { guard })
    }

    pub(crate) fn is_held_by_current_thread(&self) -> bool {
        self.slot.is_owned_by_current_thread()
    }
}

pub(crate) struct LockGuard<'a> {
    guard: ReentrantMutexGuard<'a, LockSlot>,
}

impl LockGuard<'_> {
    pub(crate) fn depth(&self) -> usize {
        self.guard.depth.get()
    }

    /// Mark the start of a mutation. Fails if one is already running on
    /// this thread.
    pub(crate) fn begin_mutation(&self) -> Result<MutationScope<'_>, StateError> {
        if self.guard.mutating.get() {
            return Err(StateError::NestedMutation);
        }
        self.guard.mutating.set(true);
        Ok(MutationScope { slot: &*self.guard })
    }

    pub(crate) fn is_mutating(&self) -> bool {
        self.guard.mutating.get()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let depth = self.guard.depth.get().saturating_sub(1);
        self.guard.depth.set(depth);
        if depth == 0
            && let Some(file) = self.guard.file.borrow_mut().take()
        {
            let _ = FileExt::unlock(&file);
        }
    }
}

pub(crate) struct MutationScope<'a> {
    slot: &'a LockSlot,
}

impl Drop for MutationScope<'_> {
    fn drop(&mut self) {
        self.slot.mutating.set(false);
    }
}
