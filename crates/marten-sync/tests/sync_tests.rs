//! Synchronization primitive integration tests
//!
//! Cross-thread scenarios: recursive ownership counting, guard release on
//! abnormal exits, and racing the lazy singleton's first touch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use marten_sync::{LazyInstance, LockGuard, Lockable, Mutex, RecursiveMutex};

fn try_lock_from_other_thread<M>(mutex: &Arc<M>) -> bool
where
    M: Lockable + Send + Sync + 'static,
{
    let mutex = Arc::clone(mutex);
    std::thread::spawn(move || {
        if mutex.try_lock() {
            // SAFETY: this thread just acquired the lock.
            unsafe { mutex.unlock() };
            true
        } else {
            false
        }
    })
    .join()
    .unwrap()
}

#[test]
fn test_recursive_mutex_matching_unlock_count() {
    let mutex = Arc::new(RecursiveMutex::new());
    let depth = 4;

    for _ in 0..depth {
        mutex.lock();
    }
    for released in 1..depth {
        // SAFETY: this thread owns the mutex at depth `depth - released + 1`.
        unsafe { mutex.unlock() };
        assert!(
            !try_lock_from_other_thread(&mutex),
            "still owned after {released} of {depth} unlocks"
        );
    }
    // SAFETY: final level of ownership.
    unsafe { mutex.unlock() };
    assert!(try_lock_from_other_thread(&mutex));
}

#[test]
fn test_lock_guard_releases_on_panic_unwind() {
    let mutex = Arc::new(Mutex::new());

    let panicking = {
        let mutex = Arc::clone(&mutex);
        std::thread::spawn(move || {
            let _guard = LockGuard::new(&*mutex);
            panic!("abnormal exit while holding the lock");
        })
    };
    assert!(panicking.join().is_err());

    // The unwind released the lock.
    assert!(try_lock_from_other_thread(&mutex));
}

#[test]
fn test_lock_guard_with_recursive_mutex() {
    let mutex = Arc::new(RecursiveMutex::new());
    {
        let _outer = LockGuard::new(&*mutex);
        let _inner = LockGuard::new(&*mutex);
        assert!(!try_lock_from_other_thread(&mutex));
    }
    assert!(try_lock_from_other_thread(&mutex));
}

#[test]
fn test_lazy_instance_races_to_one_construction() {
    static SLOT: LazyInstance<AtomicUsize> = LazyInstance::new();

    let addresses: Vec<usize> = (0..16)
        .map(|_| {
            std::thread::spawn(|| {
                let instance = SLOT.get();
                instance.fetch_add(1, Ordering::Relaxed);
                instance as *const AtomicUsize as usize
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(addresses.iter().all(|&address| address == addresses[0]));
    assert_eq!(16, SLOT.get().load(Ordering::Relaxed));
}
