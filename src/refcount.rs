//! Intrusive dual reference counting with strong and weak handles
//!
//! A host object lives in a single heap allocation together with its control
//! block (strong count, weak count, lifetime flags). [`Strong`] handles keep
//! the host alive; [`Weak`] handles keep only the control block alive and can
//! attempt promotion back to a [`Strong`] handle.
//!
//! Two details distinguish this from `std::sync::Arc`:
//!
//! - The strong count starts at a reserved sentinel meaning "allocated but
//!   never yet owned". The host's [`Host::on_first_ref`] hook fires when the
//!   first genuine strong reference appears, not at allocation time, so a host
//!   can delay its real activation.
//! - The host chooses which counter governs its destruction. Under the default
//!   strong-governed lifetime the host value is dropped the moment the strong
//!   count hits zero. After [`extend_lifetime`](Strong::extend_lifetime) with
//!   [`Lifetime::Weak`] the host survives until the last weak handle is gone,
//!   so a weak holder can observe the "last strong ref released" notification
//!   and even re-promote.
//!
//! All counter operations are lock-free compare-and-swap; nothing here blocks.

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI64, AtomicU32, Ordering};

/// Identifies the handle performing a counter operation.
///
/// This is the handle's address, passed to the [`Host`] callbacks purely for
/// diagnostics; the kernel attaches no meaning to it.
pub type HolderId = usize;

/// Reserved strong-count value: allocated but never yet promoted.
const INITIAL_STRONG: i64 = 1 << 28;

const LIFETIME_WEAK: u32 = 0x0001;

/// Set once the host value has been dropped in place. The lifetime mode can
/// legally change after destruction (the flag word outlives the host), so
/// destruction itself has to be recorded, not inferred from the mode.
const HOST_DROPPED: u32 = 0x0002;

/// Which counter reaching zero destroys the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Destroy the host when the strong count reaches zero (default).
    Strong,
    /// Keep the host alive until the weak count reaches zero.
    Weak,
}

impl Lifetime {
    fn bits(self) -> u32 {
        match self {
            Lifetime::Strong => 0,
            Lifetime::Weak => LIFETIME_WEAK,
        }
    }
}

/// Lifecycle callbacks for a reference-counted host.
///
/// Every method has a default, so `impl Host for MyType {}` opts a type into
/// the handle machinery with no custom behavior.
pub trait Host {
    /// Called once, when the first genuine strong reference appears.
    fn on_first_ref(&self) {}

    /// Called each time the strong count transitions to zero.
    fn on_last_strong_ref(&self, _id: HolderId) {}

    /// Approves or denies a promotion that found no live strong count.
    ///
    /// `first_attempt` is true exactly when the strong count was still at its
    /// never-promoted sentinel. The default policy grants only first attempts.
    fn on_inc_strong_attempted(&self, first_attempt: bool, _id: HolderId) -> bool {
        first_attempt
    }

    /// Called when the weak count reaches zero under a weak-governed lifetime,
    /// immediately before the host is destroyed.
    fn on_last_weak_ref(&self, _id: HolderId) {}
}

/// Control block plus inline host storage. One per host, for its whole life.
///
/// The host value sits in `ManuallyDrop` so it can be dropped in place when
/// its governing counter hits zero while the block itself stays allocated for
/// any remaining weak holders.
struct Count<T> {
    strong: AtomicI64,
    weak: AtomicI64,
    flags: AtomicU32,
    host: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> Count<T> {
    fn new(host: T) -> NonNull<Count<T>> {
        let boxed = Box::new(Count {
            strong: AtomicI64::new(INITIAL_STRONG),
            weak: AtomicI64::new(0),
            flags: AtomicU32::new(0),
            host: UnsafeCell::new(ManuallyDrop::new(host)),
        });
        // Freed in dec_weak when the weak count hits zero.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    fn weak_governed(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & LIFETIME_WEAK != 0
    }

    fn host_dropped(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & HOST_DROPPED != 0
    }

    /// Caller must guarantee the host value has not been dropped.
    unsafe fn host(&self) -> &T {
        &*self.host.get()
    }
}

unsafe fn inc_weak<T: Host>(ptr: NonNull<Count<T>>, _id: HolderId) {
    ptr.as_ref().weak.fetch_add(1, Ordering::Relaxed);
}

unsafe fn dec_weak<T: Host>(ptr: NonNull<Count<T>>, id: HolderId) {
    let count = ptr.as_ref();
    if count.weak.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    fence(Ordering::Acquire);

    // The value survives to this point under a weak-governed lifetime, or
    // when it was never promoted at all. Either way it is dropped exactly
    // once: dec_strong records its drop in the flag word.
    if !count.host_dropped() {
        if count.weak_governed() {
            count.host().on_last_weak_ref(id);
        }
        ManuallyDrop::drop(&mut *count.host.get());
    }
    drop(Box::from_raw(ptr.as_ptr()));
}

unsafe fn inc_strong<T: Host>(ptr: NonNull<Count<T>>, id: HolderId) {
    let count = ptr.as_ref();
    inc_weak(ptr, id);
    let old = count.strong.fetch_add(1, Ordering::Relaxed);
    if old == INITIAL_STRONG {
        count.strong.fetch_sub(INITIAL_STRONG, Ordering::Relaxed);
        count.host().on_first_ref();
    }
}

unsafe fn dec_strong<T: Host>(ptr: NonNull<Count<T>>, id: HolderId) {
    let count = ptr.as_ref();
    if count.strong.fetch_sub(1, Ordering::Release) == 1 {
        fence(Ordering::Acquire);
        count.host().on_last_strong_ref(id);
        if !count.weak_governed() {
            count.flags.fetch_or(HOST_DROPPED, Ordering::Relaxed);
            ManuallyDrop::drop(&mut *count.host.get());
        }
    }
    // Every strong reference carries an implicit weak reference.
    dec_weak(ptr, id);
}

/// The only safe strong-from-weak path. Lock-free CAS retry, never a mutex.
unsafe fn attempt_inc_strong<T: Host>(ptr: NonNull<Count<T>>, id: HolderId) -> bool {
    let count = ptr.as_ref();
    // Speculatively reserve liveness of the control block.
    inc_weak(ptr, id);

    let mut cur = count.strong.load(Ordering::Relaxed);
    while cur > 0 && cur != INITIAL_STRONG {
        match count.strong.compare_exchange_weak(
            cur,
            cur + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }

    // Strong count is exhausted or never left the sentinel; the host decides.
    // A destroyed host must never be consulted, even if the lifetime mode
    // changed after its destruction: the promotion is simply denied.
    let allow = if cur == INITIAL_STRONG {
        !count.weak_governed() || count.host().on_inc_strong_attempted(true, id)
    } else {
        count.weak_governed()
            && !count.host_dropped()
            && count.host().on_inc_strong_attempted(false, id)
    };
    if !allow {
        dec_weak(ptr, id);
        return false;
    }

    let old = count.strong.fetch_add(1, Ordering::Relaxed);
    if old == INITIAL_STRONG {
        count.strong.fetch_sub(INITIAL_STRONG, Ordering::Relaxed);
        count.host().on_first_ref();
    }
    true
}

/// An owning handle: the host stays alive at least as long as this exists.
pub struct Strong<T: Host> {
    ptr: NonNull<Count<T>>,
}

unsafe impl<T: Host + Send + Sync> Send for Strong<T> {}
unsafe impl<T: Host + Send + Sync> Sync for Strong<T> {}

impl<T: Host> Strong<T> {
    /// Heap-allocates `host` and takes the first strong reference to it,
    /// firing [`Host::on_first_ref`].
    pub fn new(host: T) -> Strong<T> {
        let handle = Strong {
            ptr: Count::new(host),
        };
        unsafe { inc_strong(handle.ptr, handle.id()) };
        handle
    }

    fn id(&self) -> HolderId {
        self as *const Self as usize
    }

    /// Creates an observing handle to the same host.
    pub fn downgrade(&self) -> Weak<T> {
        let weak = Weak { ptr: self.ptr };
        unsafe { inc_weak(weak.ptr, weak.id()) };
        weak
    }

    /// Switches the host to the given lifetime mode.
    ///
    /// Modes accumulate: once weak-governed, the host stays weak-governed for
    /// the rest of its life.
    pub fn extend_lifetime(&self, mode: Lifetime) {
        unsafe { self.ptr.as_ref() }
            .flags
            .fetch_or(mode.bits(), Ordering::Relaxed);
    }

    /// True if both handles point at the same host allocation.
    pub fn ptr_eq(&self, other: &Strong<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Host> Clone for Strong<T> {
    fn clone(&self) -> Self {
        let handle = Strong { ptr: self.ptr };
        unsafe { inc_strong(handle.ptr, handle.id()) };
        handle
    }
}

impl<T: Host> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // A live strong count keeps the host value alive.
        unsafe { self.ptr.as_ref().host() }
    }
}

impl<T: Host> Drop for Strong<T> {
    fn drop(&mut self) {
        unsafe { dec_strong(self.ptr, self.id()) };
    }
}

/// A non-owning handle: observes the host without keeping it alive.
pub struct Weak<T: Host> {
    ptr: NonNull<Count<T>>,
}

unsafe impl<T: Host + Send + Sync> Send for Weak<T> {}
unsafe impl<T: Host + Send + Sync> Sync for Weak<T> {}

impl<T: Host> Weak<T> {
    /// Heap-allocates `host` without taking ownership of it.
    ///
    /// The strong count stays at its never-promoted sentinel until the first
    /// successful [`promote`](Weak::promote), which then fires
    /// [`Host::on_first_ref`]. If no promotion ever happens the host is
    /// destroyed when the last weak handle goes away.
    pub fn new(host: T) -> Weak<T> {
        let handle = Weak {
            ptr: Count::new(host),
        };
        unsafe { inc_weak(handle.ptr, handle.id()) };
        handle
    }

    fn id(&self) -> HolderId {
        self as *const Self as usize
    }

    /// Attempts to convert this observing handle into an owning one.
    ///
    /// Fails (returns `None`) if the host is gone or its
    /// [`Host::on_inc_strong_attempted`] policy denies the promotion.
    pub fn promote(&self) -> Option<Strong<T>> {
        if unsafe { attempt_inc_strong(self.ptr, self.id()) } {
            Some(Strong { ptr: self.ptr })
        } else {
            None
        }
    }

    /// Switches the host to the given lifetime mode; see
    /// [`Strong::extend_lifetime`].
    pub fn extend_lifetime(&self, mode: Lifetime) {
        unsafe { self.ptr.as_ref() }
            .flags
            .fetch_or(mode.bits(), Ordering::Relaxed);
    }
}

impl<T: Host> Clone for Weak<T> {
    fn clone(&self) -> Self {
        let handle = Weak { ptr: self.ptr };
        unsafe { inc_weak(handle.ptr, handle.id()) };
        handle
    }
}

impl<T: Host> Drop for Weak<T> {
    fn drop(&mut self) {
        unsafe { dec_weak(self.ptr, self.id()) };
    }
}
