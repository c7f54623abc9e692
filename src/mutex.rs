//! Cache population and replacement for a given logical name must
//! never run concurrently within a process: two readers racing to
//! fill the same cached copy would download it twice, and a writer
//! creating a cached copy while a reader fills it would publish
//! garbage.  The `FileMutexRegistry` hands out one mutex per name.
//!
//! Entries are created on first use and never evicted: the key space
//! is bounded by the file names a directory ever touches.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Per-name mutual exclusion, scoped to one directory instance.
#[derive(Debug, Default)]
pub struct FileMutexRegistry {
    mutexes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileMutexRegistry {
    /// Returns an empty registry.
    pub fn new() -> FileMutexRegistry {
        FileMutexRegistry::default()
    }

    /// Returns the mutex for `name`, creating it if necessary.
    pub fn grab(&self, name: &str) -> Arc<Mutex<()>> {
        let mut mutexes = self
            .mutexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match mutexes.get(name) {
            Some(mutex) => mutex.clone(),
            None => {
                let mutex = Arc::new(Mutex::new(()));
                mutexes.insert(name.to_owned(), mutex.clone());
                mutex
            }
        }
    }

    /// Runs `f` while holding the mutex for `name`.
    ///
    /// The mutex only guards a `()`, so a panic in an earlier critical
    /// section leaves nothing inconsistent behind: poisoning is
    /// ignored.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let mutex = self.grab(name);
        let _guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);

        f()
    }

    /// Returns the number of names with a mutex.
    pub fn len(&self) -> usize {
        self.mutexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns whether no mutex was ever handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[test]
fn test_same_name_same_mutex() {
    let registry = FileMutexRegistry::new();

    let a = registry.grab("_0.cfs");
    let b = registry.grab("_0.cfs");
    let c = registry.grab("_1.cfs");

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(registry.len(), 2);
}

/// Many threads increment a counter in two steps under the same name;
/// no update may be lost.
#[test]
fn test_with_lock_serializes() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let registry = Arc::new(FileMutexRegistry::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    registry.with_lock("segments.gen", || {
                        let current = counter.load(Ordering::SeqCst);
                        std::thread::yield_now();
                        counter.store(current + 1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker must not panic");
    }

    assert_eq!(counter.load(Ordering::SeqCst), 800);
}

/// A panic inside one critical section doesn't wedge the name.
#[test]
fn test_poison_ignored() {
    let registry = FileMutexRegistry::new();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        registry.with_lock("name", || panic!("boom"))
    }));
    assert!(result.is_err());

    assert_eq!(registry.with_lock("name", || 42), 42);
}
