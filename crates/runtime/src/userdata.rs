//! Host userdata
//!
//! An opaque payload owned by the host, either allocated by the
//! interpreter (`new_userdata`) or wrapping an external pointer
//! (`wrap_userdata`). The payload lives behind an indirection cell so
//! the host can tombstone it early with `invalidate`: the finalizer runs
//! right then, and later `ptr()` reads observe null instead of a
//! dangling pointer. Whatever happens, the finalizer runs exactly once —
//! at invalidation or when the last reference drops.

use std::cell::RefCell;

pub type Finalizer = Box<dyn FnMut(*mut u8)>;

enum Payload {
    Owned(Box<[u8]>),
    Wrapped(*mut u8),
    /// Tombstoned: the finalizer already ran.
    Dead,
}

pub struct UserData {
    state: RefCell<(Payload, Option<Finalizer>)>,
}

impl UserData {
    pub fn owned(size: usize, finalizer: Option<Finalizer>) -> Self {
        let bytes = vec![0u8; size].into_boxed_slice();
        UserData { state: RefCell::new((Payload::Owned(bytes), finalizer)) }
    }

    pub fn wrapped(ptr: *mut u8, finalizer: Option<Finalizer>) -> Self {
        UserData { state: RefCell::new((Payload::Wrapped(ptr), finalizer)) }
    }

    /// The live payload pointer, or null after invalidation.
    pub fn ptr(&self) -> *mut u8 {
        match &mut self.state.borrow_mut().0 {
            Payload::Owned(bytes) => bytes.as_mut_ptr(),
            Payload::Wrapped(ptr) => *ptr,
            Payload::Dead => std::ptr::null_mut(),
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state.borrow().0, Payload::Dead)
    }

    /// Tombstone now: run the finalizer and null the pointer. Safe to
    /// call more than once.
    pub fn invalidate(&self) {
        let mut state = self.state.borrow_mut();
        let (payload, finalizer) = &mut *state;
        let ptr = match payload {
            Payload::Owned(bytes) => bytes.as_mut_ptr(),
            Payload::Wrapped(ptr) => *ptr,
            Payload::Dead => return,
        };
        if let Some(f) = finalizer.as_mut() {
            f(ptr);
        }
        *payload = Payload::Dead;
        *finalizer = None;
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<UserData dead={}>", self.is_dead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_finalizer_runs_once_on_drop() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let ud = UserData::owned(8, Some(Box::new(move |_| c.set(c.get() + 1))));
        drop(ud);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_invalidate_tombstones_and_finalizes() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let ud = UserData::owned(8, Some(Box::new(move |_| c.set(c.get() + 1))));
        assert!(!ud.ptr().is_null());
        ud.invalidate();
        assert!(ud.ptr().is_null());
        assert!(ud.is_dead());
        assert_eq!(count.get(), 1);
        // dropping after invalidation must not re-run the finalizer
        drop(ud);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_wrapped_pointer_roundtrip() {
        let mut payload = 7u8;
        let ud = UserData::wrapped(&mut payload as *mut u8, None);
        assert_eq!(ud.ptr(), &mut payload as *mut u8);
    }
}
