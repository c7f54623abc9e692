//! Advisory distributed locks built from nothing but object store
//! primitives.  A lock is a single object whose body is
//! `$expiry%$lease_id`: `$expiry` is an absolute time in milliseconds
//! since the Unix epoch, and `$lease_id` a random 35-character
//! alphanumeric token.  Whoever holds the lease id currently stored
//! owns the lock until the expiry passes.
//!
//! Acquiring a lock checks that no live lease exists, writes a fresh
//! lease, and reads it back: object stores resolve concurrent puts
//! with last-writer-wins, so the read-back is how a loser notices it
//! lost the race.  A background thread rewrites the lease with a new
//! expiry every `renew_interval` (half the lease duration by default)
//! for as long as the lock is held.  Anyone who observes an expired
//! lease may delete it.
//!
//! There is no fencing: a holder that stalls for longer than the
//! lease duration can lose the lock without noticing until its next
//! renewal.
use std::fmt;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use derivative::Derivative;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::blob::BlobStore;
use crate::error::BlobError;

/// Lease ids have exactly this many characters.
pub const LEASE_ID_LENGTH: usize = 35;

/// Separates the expiry from the lease id in a lock object's body.
/// Lease ids never contain it.
pub const LEASE_SEPARATOR: char = '%';

/// Leases last this long unless configured otherwise.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Returns the current time, in lease expiry ticks.
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns a fresh random lease id.
pub fn new_lease_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(LEASE_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// How long leases last, and how often holders renew them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    pub duration: Duration,
    /// `None` disables background renewal: the lease simply lapses
    /// `duration` after it was obtained.
    pub renew_interval: Option<Duration>,
}

impl Default for LeaseConfig {
    fn default() -> LeaseConfig {
        LeaseConfig::new(DEFAULT_LEASE_DURATION)
    }
}

impl LeaseConfig {
    /// Returns a configuration for leases of `duration`, renewed at
    /// half that period.
    pub fn new(duration: Duration) -> LeaseConfig {
        LeaseConfig {
            duration,
            renew_interval: Some(duration / 2),
        }
    }

    /// Renews every `interval` instead.
    pub fn renew_every(mut self, interval: Duration) -> LeaseConfig {
        self.renew_interval = Some(interval);
        self
    }

    /// Never renews leases.
    pub fn without_renewal(mut self) -> LeaseConfig {
        self.renew_interval = None;
        self
    }
}

/// The contents of a lock object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Expiry, in [`now_ticks`] units.
    pub expiry: u64,
    pub lease_id: String,
}

impl Lease {
    /// Returns a lease for `lease_id` that expires `duration` from now.
    pub fn new(lease_id: String, duration: Duration) -> Lease {
        Lease {
            expiry: now_ticks().saturating_add(duration.as_millis() as u64),
            lease_id,
        }
    }

    /// Parses a lock object body, or returns `None` if it isn't a
    /// well-formed lease.
    pub fn parse(body: &str) -> Option<Lease> {
        let idx = body.find(LEASE_SEPARATOR)?;
        let expiry = body[..idx].parse::<u64>().ok()?;
        let lease_id = &body[idx + 1..];

        if lease_id.is_empty() || lease_id.contains(LEASE_SEPARATOR) {
            return None;
        }

        Some(Lease {
            expiry,
            lease_id: lease_id.to_owned(),
        })
    }

    /// Returns whether the lease expired at time `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expiry
    }

    /// Returns whether the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ticks())
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.expiry, LEASE_SEPARATOR, self.lease_id)
    }
}

/// Who holds a lock, as far as the object store says.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    HeldByUs,
    HeldByOther,
}

/// Cross-process mutual exclusion.  Failing to obtain a lock is an
/// expected outcome, not an error: callers decide whether to retry.
pub trait DistributedLock: Send + Sync {
    /// Attempts to take the lock; returns whether we now hold it.
    fn obtain(&self) -> bool;

    /// Returns whether anyone holds the lock.
    fn is_locked(&self) -> bool;

    /// Releases the lock; returns false if someone else holds it.
    fn release(&self) -> bool;

    /// Forcibly clears the lock, whoever holds it.
    fn break_lock(&self);
}

/// What we found at the lock key.
enum Stored {
    Absent,
    Unreadable,
    Present(Lease),
}

struct Renewal {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Renewal {
    /// Stops the renewal thread and waits for any in-flight renewal
    /// to finish.
    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::warn!("lease renewal thread panicked");
        }
    }
}

#[derive(Default)]
struct LeaseState {
    lease_id: Option<String>,
    renewal: Option<Renewal>,
}

/// State shared with the renewal thread.  The renewal thread never
/// takes `state`: holders stop and join it while holding that mutex.
#[derive(Derivative)]
#[derivative(Debug)]
struct Shared {
    key: String,
    #[derivative(Debug = "ignore")]
    store: Arc<dyn BlobStore>,
    config: LeaseConfig,
    #[derivative(Debug = "ignore")]
    state: Mutex<LeaseState>,
    // Set by the renewal thread when another holder took over.
    #[derivative(Debug = "ignore")]
    lost: std::sync::atomic::AtomicBool,
}

impl Shared {
    fn read(&self) -> Result<Stored, BlobError> {
        match self.store.get_bytes(&self.key) {
            Ok(bytes) => Ok(std::str::from_utf8(&bytes)
                .ok()
                .and_then(Lease::parse)
                .map_or(Stored::Unreadable, Stored::Present)),
            Err(e) if e.is_not_found() => Ok(Stored::Absent),
            Err(e) => Err(e),
        }
    }

    /// Writes `lease` and reads it back.  Returns whether the stored
    /// lease is exactly the one we wrote.
    fn write_verified(&self, lease: &Lease) -> Result<bool, BlobError> {
        self.store.put_bytes(&self.key, lease.to_string().as_bytes())?;

        match self.read()? {
            Stored::Present(stored) => Ok(&stored == lease),
            Stored::Absent | Stored::Unreadable => Ok(false),
        }
    }

    fn delete(&self) -> bool {
        match self.store.delete(&self.key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to delete lock object");
                false
            }
        }
    }

    /// Renews `lease_id`.  Returns false once renewal should stop.
    fn renew(&self, lease_id: &str) -> bool {
        match self.read() {
            Ok(Stored::Present(current))
                if current.lease_id != lease_id && !current.is_expired() =>
            {
                tracing::warn!(key = %self.key, lease_id, "lease lost to another holder");
                self.lost.store(true, std::sync::atomic::Ordering::SeqCst);
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to read lease before renewal");
                return true;
            }
        }

        let lease = Lease::new(lease_id.to_owned(), self.config.duration);
        match self.write_verified(&lease) {
            Ok(true) => tracing::debug!(key = %self.key, expiry = lease.expiry, "renewed lease"),
            Ok(false) => tracing::warn!(key = %self.key, "renewed lease did not read back"),
            Err(e) => tracing::warn!(key = %self.key, error = %e, "failed to renew lease"),
        }

        true
    }
}

fn renewal_loop(
    shared: Weak<Shared>,
    lease_id: String,
    interval: Duration,
    stop: mpsc::Receiver<()>,
) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            // Explicit stop, or the lock went away.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        if !shared.renew(&lease_id) {
            return;
        }
    }
}

/// A lease-based lock on one object key.
///
/// Dropping a held `LeaseLock` releases it.
#[derive(Debug)]
pub struct LeaseLock {
    shared: Arc<Shared>,
}

/// Releases its [`LeaseLock`] when dropped.
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    lock: &'a LeaseLock,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if !self.lock.release() {
            tracing::warn!(key = %self.lock.key(), "lease guard failed to release lock");
        }
    }
}

impl LeaseLock {
    /// Returns a lock on the object `key` in `store`.  Creating a
    /// `LeaseLock` does not touch the store.
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, config: LeaseConfig) -> LeaseLock {
        LeaseLock {
            shared: Arc::new(Shared {
                key: key.into(),
                store,
                config,
                state: Mutex::new(LeaseState::default()),
                lost: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Returns the lock object's key.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Returns the lease id we currently hold, if any.
    pub fn lease_id(&self) -> Option<String> {
        self.state().lease_id.clone()
    }

    fn state(&self) -> MutexGuard<'_, LeaseState> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Forget a lease the renewal thread saw someone else take.
        if self
            .shared
            .lost
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            state.lease_id = None;
            if let Some(renewal) = state.renewal.take() {
                renewal.stop();
            }
        }

        state
    }

    /// Attempts to take the lock.  Returns true if the store still
    /// holds our unexpired lease, or if we could write a fresh lease
    /// and read it back.
    pub fn obtain(&self) -> bool {
        let mut state = self.state();
        let stored = self.shared.read();

        if let Some(ours) = state.lease_id.as_deref() {
            match &stored {
                Ok(Stored::Present(current)) if current.lease_id == ours && !current.is_expired() => {
                    return true;
                }
                Ok(_) => {
                    tracing::debug!(key = %self.key(), lease_id = ours, "forgetting stale lease");
                    if let Some(renewal) = state.renewal.take() {
                        renewal.stop();
                    }
                    state.lease_id = None;
                }
                Err(e) => {
                    tracing::warn!(key = %self.key(), error = %e, "failed to read lock object");
                    return false;
                }
            }
        }

        match stored {
            Ok(Stored::Present(current)) if !current.is_expired() => {
                tracing::debug!(key = %self.key(), "lock held by another lease");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key = %self.key(), error = %e, "failed to read lock object");
                return false;
            }
        }

        let lease = Lease::new(new_lease_id(), self.shared.config.duration);
        match self.shared.write_verified(&lease) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key = %self.key(), "lost race for lock");
                return false;
            }
            Err(e) => {
                tracing::warn!(key = %self.key(), error = %e, "failed to write lease");
                return false;
            }
        }

        tracing::debug!(key = %self.key(), lease_id = %lease.lease_id, expiry = lease.expiry, "obtained lock");
        if let Some(interval) = self.shared.config.renew_interval {
            state.renewal = self.spawn_renewal(lease.lease_id.clone(), interval);
        }
        state.lease_id = Some(lease.lease_id);
        true
    }

    fn spawn_renewal(&self, lease_id: String, interval: Duration) -> Option<Renewal> {
        let (stop, receiver) = mpsc::channel();
        let shared = Arc::downgrade(&self.shared);

        match std::thread::Builder::new()
            .name("blobdir-lease-renewal".into())
            .spawn(move || renewal_loop(shared, lease_id, interval, receiver))
        {
            Ok(handle) => Some(Renewal { stop, handle }),
            Err(e) => {
                tracing::warn!(key = %self.key(), error = %e, "failed to start lease renewal");
                None
            }
        }
    }

    /// Polls [`LeaseLock::obtain`] every `poll` until it succeeds or
    /// `timeout` elapses.
    pub fn obtain_within(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.obtain() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            std::thread::sleep(poll.min(deadline - now));
        }
    }

    /// Takes the lock if possible, and returns a guard that releases
    /// it on drop.
    pub fn try_guard(&self) -> Option<LeaseGuard<'_>> {
        if self.obtain() {
            Some(LeaseGuard { lock: self })
        } else {
            None
        }
    }

    /// Reads the lock object to find out who holds the lock.  Expired
    /// or malformed leases are deleted on sight.
    pub fn status(&self) -> LockStatus {
        let ours = self.lease_id();

        match self.shared.read() {
            Ok(Stored::Absent) => LockStatus::Unlocked,
            Ok(Stored::Present(current)) if !current.is_expired() => {
                if Some(&current.lease_id) == ours.as_ref() {
                    LockStatus::HeldByUs
                } else {
                    LockStatus::HeldByOther
                }
            }
            Ok(Stored::Present(_)) | Ok(Stored::Unreadable) => {
                tracing::debug!(key = %self.key(), "deleting expired lock object");
                self.shared.delete();
                LockStatus::Unlocked
            }
            Err(e) => {
                tracing::warn!(key = %self.key(), error = %e, "failed to read lock object");
                LockStatus::Unlocked
            }
        }
    }

    /// Returns whether anyone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.status() != LockStatus::Unlocked
    }

    /// Releases the lock.  Succeeds if the lock object is absent,
    /// expired, or ours; refuses (returns false) while another live
    /// lease holds it.
    ///
    /// Renewal always stops.  If the store can't be read, the local
    /// lease is forgotten, the call returns false, and the remote
    /// lease lapses at its expiry.
    pub fn release(&self) -> bool {
        let mut state = self.state();
        if let Some(renewal) = state.renewal.take() {
            renewal.stop();
        }

        let ours = state.lease_id.take();
        let released = match self.shared.read() {
            Ok(Stored::Absent) => true,
            Ok(Stored::Present(current))
                if Some(&current.lease_id) != ours.as_ref() && !current.is_expired() =>
            {
                tracing::debug!(key = %self.key(), "lock held by another lease, not releasing");
                false
            }
            Ok(_) => self.shared.delete(),
            Err(e) => {
                tracing::warn!(key = %self.key(), error = %e, "failed to read lock object");
                false
            }
        };

        if released {
            tracing::debug!(key = %self.key(), "released lock");
        }
        released
    }

    /// Deletes the lock object unconditionally and forgets any lease
    /// we held.  This is the operator's way out when a holder crashed.
    pub fn break_lock(&self) {
        let mut state = self.state();
        if let Some(renewal) = state.renewal.take() {
            renewal.stop();
        }

        tracing::debug!(key = %self.key(), lease_id = ?state.lease_id, "breaking lock");
        state.lease_id = None;
        self.shared.delete();
    }
}

impl DistributedLock for LeaseLock {
    fn obtain(&self) -> bool {
        LeaseLock::obtain(self)
    }

    fn is_locked(&self) -> bool {
        LeaseLock::is_locked(self)
    }

    fn release(&self) -> bool {
        LeaseLock::release(self)
    }

    fn break_lock(&self) {
        LeaseLock::break_lock(self)
    }
}

impl fmt::Display for LeaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lease_id() {
            Some(lease_id) => write!(f, "LeaseLock@{}.{}", self.key(), lease_id),
            None => write!(f, "LeaseLock@{}", self.key()),
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        let held = self.state().lease_id.is_some();

        if held {
            self.release();
        } else if let Some(renewal) = self.state().renewal.take() {
            renewal.stop();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::error::BlobError;

    const KEY: &str = "index/write.lock";

    fn pair(config: LeaseConfig) -> (Arc<MemoryBlobStore>, LeaseLock, LeaseLock) {
        let store = Arc::new(MemoryBlobStore::new());
        let a = LeaseLock::new(store.clone(), KEY, config);
        let b = LeaseLock::new(store.clone(), KEY, config);
        (store, a, b)
    }

    #[test]
    fn test_parse() {
        let lease = Lease::parse("1700000000000%abcDEF123").expect("must parse");
        assert_eq!(lease.expiry, 1_700_000_000_000);
        assert_eq!(lease.lease_id, "abcDEF123");
        assert_eq!(lease.to_string(), "1700000000000%abcDEF123");

        for body in &["", "12345", "%abc", "abc%def", "12%", "12%a%b", "-1%abc"] {
            assert_eq!(Lease::parse(body), None, "{:?} must not parse", body);
        }
    }

    #[test]
    fn test_expiry() {
        let lease = Lease {
            expiry: 1000,
            lease_id: "x".into(),
        };

        assert!(!lease.is_expired_at(999));
        assert!(!lease.is_expired_at(1000));
        assert!(lease.is_expired_at(1001));
        assert!(!Lease::new("x".into(), Duration::from_secs(60)).is_expired());
    }

    #[test]
    fn test_lease_id() {
        let a = new_lease_id();
        let b = new_lease_id();

        assert_eq!(a.len(), LEASE_ID_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!a.contains(LEASE_SEPARATOR));
        assert_ne!(a, b);
    }

    #[test]
    fn test_config() {
        let config = LeaseConfig::default();
        assert_eq!(config.duration, Duration::from_secs(60));
        assert_eq!(config.renew_interval, Some(Duration::from_secs(30)));

        assert_eq!(config.without_renewal().renew_interval, None);
        assert_eq!(
            LeaseConfig::new(Duration::from_secs(10))
                .renew_every(Duration::from_secs(1))
                .renew_interval,
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_mutual_exclusion() {
        let (store, a, b) = pair(LeaseConfig::default().without_renewal());

        assert_eq!(a.status(), LockStatus::Unlocked);
        assert!(a.obtain());
        // Obtaining again is a no-op.
        assert!(a.obtain());
        assert_eq!(a.status(), LockStatus::HeldByUs);

        assert!(!b.obtain());
        assert_eq!(b.status(), LockStatus::HeldByOther);
        assert!(b.is_locked());
        assert!(!b.release());

        let body = String::from_utf8(store.get_bytes(KEY).expect("lock object must exist"))
            .expect("body must be utf-8");
        let lease = Lease::parse(&body).expect("body must parse");
        assert_eq!(Some(lease.lease_id), a.lease_id());

        assert!(a.release());
        assert_eq!(a.lease_id(), None);
        assert!(!store.exists(KEY).expect("exists must succeed"));

        assert!(b.obtain());
        assert!(!a.obtain());
        assert!(b.release());
        // Releasing an absent lock succeeds.
        assert!(b.release());
    }

    #[test]
    fn test_expiry_recovery() {
        let (_store, a, b) = pair(LeaseConfig::new(Duration::from_millis(100)).without_renewal());

        assert!(a.obtain());
        assert!(!b.obtain());

        std::thread::sleep(Duration::from_millis(250));
        assert!(b.obtain());
        assert_eq!(a.status(), LockStatus::HeldByOther);
        // `a` can't release what `b` now legitimately holds.
        assert!(!a.release());
        assert_eq!(b.status(), LockStatus::HeldByUs);
    }

    #[test]
    fn test_stale_holder_does_not_obtain() {
        let (_store, a, b) = pair(LeaseConfig::new(Duration::from_millis(100)).without_renewal());

        assert!(a.obtain());
        std::thread::sleep(Duration::from_millis(250));
        assert!(b.obtain());

        // `a` still remembers its expired lease, but the store disagrees.
        assert!(!a.obtain());
        assert_eq!(a.lease_id(), None);
        assert!(b.obtain());
        assert_eq!(b.status(), LockStatus::HeldByUs);
    }

    #[test]
    fn test_expired_own_lease_is_replaced() {
        let (_store, a, _b) = pair(LeaseConfig::new(Duration::from_millis(100)).without_renewal());

        assert!(a.obtain());
        let first = a.lease_id();
        std::thread::sleep(Duration::from_millis(250));

        // Nobody took over, so `a` gets a fresh lease.
        assert!(a.obtain());
        assert_ne!(a.lease_id(), first);
        assert_eq!(a.status(), LockStatus::HeldByUs);
    }

    #[test]
    fn test_renewal_keeps_lease() {
        let (_store, a, b) = pair(
            LeaseConfig::new(Duration::from_millis(400)).renew_every(Duration::from_millis(100)),
        );

        assert!(a.obtain());
        std::thread::sleep(Duration::from_millis(1000));
        assert!(!b.obtain());
        assert_eq!(a.status(), LockStatus::HeldByUs);

        assert!(a.release());
        assert!(b.obtain());
    }

    #[test]
    fn test_lost_lease_is_forgotten() {
        let (store, a, _b) = pair(
            LeaseConfig::new(Duration::from_millis(400)).renew_every(Duration::from_millis(50)),
        );

        assert!(a.obtain());
        // Another holder takes over behind our back.
        let usurper = Lease::new(new_lease_id(), Duration::from_secs(60));
        store.insert(KEY, usurper.to_string());

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(a.lease_id(), None);
        assert_eq!(a.status(), LockStatus::HeldByOther);
        // The usurper's lease is intact.
        assert_eq!(
            store.get_bytes(KEY).expect("lock object must exist"),
            usurper.to_string().into_bytes()
        );
    }

    #[test]
    fn test_expired_lock_deleted_on_sight() {
        let (store, a, _b) = pair(LeaseConfig::default());

        let stale = Lease {
            expiry: now_ticks() - 1000,
            lease_id: new_lease_id(),
        };
        store.insert(KEY, stale.to_string());

        assert!(!a.is_locked());
        assert!(!store.exists(KEY).expect("exists must succeed"));

        store.insert(KEY, "garbage");
        assert!(!a.is_locked());
        assert!(!store.exists(KEY).expect("exists must succeed"));

        store.insert(KEY, "garbage");
        assert!(a.obtain());
        assert_eq!(a.status(), LockStatus::HeldByUs);
    }

    #[test]
    fn test_break_lock() {
        let (store, a, b) = pair(LeaseConfig::default());

        assert!(a.obtain());
        b.break_lock();
        assert!(!store.exists(KEY).expect("exists must succeed"));

        assert!(b.obtain());
        assert_eq!(a.status(), LockStatus::HeldByOther);

        a.break_lock();
        assert!(!b.is_locked());
    }

    #[test]
    fn test_guard() {
        let (store, a, b) = pair(LeaseConfig::default());

        {
            let _guard = a.try_guard().expect("lock must be free");
            assert!(b.try_guard().is_none());
        }

        assert!(!store.exists(KEY).expect("exists must succeed"));
        assert!(b.try_guard().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let (store, a, b) = pair(LeaseConfig::default());

        assert!(a.obtain());
        drop(a);
        assert!(!store.exists(KEY).expect("exists must succeed"));
        assert!(b.obtain());
    }

    #[test]
    fn test_obtain_within() {
        let (_store, a, b) = pair(LeaseConfig::new(Duration::from_millis(150)).without_renewal());

        assert!(a.obtain());
        assert!(!b.obtain_within(Duration::from_millis(20), Duration::from_millis(5)));
        assert!(b.obtain_within(Duration::from_secs(2), Duration::from_millis(20)));
    }

    #[test]
    fn test_offline() {
        let (store, a, _b) = pair(LeaseConfig::default());

        store.set_offline(true);
        assert!(!a.obtain());
        assert!(!a.is_locked());
        assert!(!a.release());

        store.set_offline(false);
        assert!(a.obtain());
    }

    /// A store where a competing writer always wins the race for the
    /// lock key right after our put.
    #[derive(Debug, Default)]
    struct Contended {
        inner: MemoryBlobStore,
    }

    impl BlobStore for Contended {
        fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<crate::ListPage, BlobError> {
            self.inner.list_page(prefix, marker)
        }

        fn head(&self, key: &str) -> Result<u64, BlobError> {
            self.inner.head(key)
        }

        fn get(&self, key: &str, dst: &mut dyn std::io::Write) -> Result<u64, BlobError> {
            self.inner.get(key, dst)
        }

        fn put(&self, key: &str, src: &mut dyn std::io::Read) -> Result<u64, BlobError> {
            let len = self.inner.put(key, src)?;
            let winner = Lease::new(new_lease_id(), Duration::from_secs(60));
            self.inner.insert(key, winner.to_string());
            Ok(len)
        }

        fn delete(&self, key: &str) -> Result<(), BlobError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_verification_mismatch() {
        let lock = LeaseLock::new(Arc::new(Contended::default()), KEY, LeaseConfig::default());

        assert!(!lock.obtain());
        assert_eq!(lock.lease_id(), None);
        assert_eq!(lock.status(), LockStatus::HeldByOther);
    }

    #[derive(Arbitrary, Clone, Copy, Debug)]
    enum LockOp {
        Obtain(bool),
        Release(bool),
        Status(bool),
        Break(bool),
    }

    proptest! {
        // Whatever two instances do, at most one believes it holds a
        // lease that the store agrees is live.
        #[test]
        fn test_at_most_one_holder(ops in proptest::collection::vec(any::<LockOp>(), 1..40)) {
            let (_store, a, b) = pair(LeaseConfig::default().without_renewal());
            let pick = |first: bool| if first { &a } else { &b };

            for op in ops {
                match op {
                    LockOp::Obtain(which) => { pick(which).obtain(); }
                    LockOp::Release(which) => { pick(which).release(); }
                    LockOp::Status(which) => { pick(which).status(); }
                    LockOp::Break(which) => pick(which).break_lock(),
                }

                let holders = [&a, &b]
                    .iter()
                    .filter(|lock| lock.status() == LockStatus::HeldByUs)
                    .count();
                prop_assert!(holders <= 1);
            }
        }
    }
}
