//! Process-wide admission counters.
//!
//! Three limits are enforced at upgrade time:
//!
//! - a per-client-IP cap, tracked in a mutex-guarded map keyed by address;
//! - a global cap on concurrent tunnels, tracked with an atomic counter;
//! - a per-session cap, tracked in a mutex-guarded map keyed by session id.
//!
//! Each successful acquire returns a permit. Permits release in `Drop`, so a
//! tunnel stays counted exactly as long as its task owns the permit.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Why an acquire was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("max connections per ip exceeded")]
    IpLimit,
    #[error("max connections exceeded")]
    GlobalLimit,
    #[error("max tunnels per session exceeded")]
    SessionLimit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Concurrent tunnels across the process; 0 = unbounded.
    pub max_connections: u64,
    /// Concurrent tunnels per session id; 0 = unbounded.
    pub max_tunnels_per_session: u64,
    /// Concurrent tunnels per client IP; 0 = unbounded.
    pub max_connections_per_ip: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    sessions: Mutex<HashMap<String, u64>>,
    ips: Mutex<HashMap<IpAddr, u64>>,
}

impl Counters {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        lock(&self.sessions)
    }

    fn ips(&self) -> MutexGuard<'_, HashMap<IpAddr, u64>> {
        lock(&self.ips)
    }
}

// A panic while holding the lock cannot leave a map half-updated, so a
// poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Count one more holder of `key` unless that would exceed `max` (0 = unbounded).
fn increment<K: Hash + Eq>(counts: &mut HashMap<K, u64>, key: K, max: u64) -> bool {
    let count = counts.entry(key).or_insert(0);
    if max != 0 && *count >= max {
        return false;
    }
    *count += 1;
    true
}

fn decrement<K: Hash + Eq>(counts: &mut HashMap<K, u64>, key: &K) {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// Shared admission state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    counters: Arc<Counters>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Take one slot from the global pool.
    pub fn try_acquire_global(&self) -> Result<GlobalPermit, AdmissionDenied> {
        let max = self.limits.max_connections;
        let active = &self.counters.active;
        let mut current = active.load(Ordering::Acquire);
        loop {
            if max != 0 && current >= max {
                return Err(AdmissionDenied::GlobalLimit);
            }
            match active.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        debug!(active = current + 1, "global permit acquired");
        Ok(GlobalPermit {
            counters: Some(self.counters.clone()),
        })
    }

    /// Take one slot for session `sid`.
    pub fn try_acquire_session(&self, sid: &str) -> Result<SessionPermit, AdmissionDenied> {
        let max = self.limits.max_tunnels_per_session;
        if !increment(&mut self.counters.sessions(), sid.to_string(), max) {
            return Err(AdmissionDenied::SessionLimit);
        }
        Ok(SessionPermit {
            counters: Some(self.counters.clone()),
            sid: sid.to_string(),
        })
    }

    /// Take one slot for client address `ip`.
    pub fn try_acquire_ip(&self, ip: IpAddr) -> Result<IpPermit, AdmissionDenied> {
        if !increment(&mut self.counters.ips(), ip, self.limits.max_connections_per_ip) {
            return Err(AdmissionDenied::IpLimit);
        }
        Ok(IpPermit {
            counters: Some(self.counters.clone()),
            ip,
        })
    }

    pub fn active_connections(&self) -> u64 {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Live tunnels for `sid`; 0 when the session holds none.
    pub fn session_tunnels(&self, sid: &str) -> u64 {
        self.counters.sessions().get(sid).copied().unwrap_or(0)
    }

    /// Number of sessions holding at least one permit.
    pub fn tracked_sessions(&self) -> usize {
        self.counters.sessions().len()
    }

    /// Live tunnels opened from `ip`.
    pub fn connections_from(&self, ip: IpAddr) -> u64 {
        self.counters.ips().get(&ip).copied().unwrap_or(0)
    }
}

/// One slot in the global pool.
#[derive(Debug)]
pub struct GlobalPermit {
    counters: Option<Arc<Counters>>,
}

impl GlobalPermit {
    /// Give the slot back now. Later calls and the eventual drop do nothing.
    pub fn release(&mut self) {
        if let Some(counters) = self.counters.take() {
            counters.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// One slot in a session's pool.
#[derive(Debug)]
pub struct SessionPermit {
    counters: Option<Arc<Counters>>,
    sid: String,
}

impl SessionPermit {
    /// Give the slot back now, removing the session entry when it reaches zero.
    pub fn release(&mut self) {
        if let Some(counters) = self.counters.take() {
            decrement(&mut counters.sessions(), &self.sid);
        }
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// One slot in a client address's pool.
#[derive(Debug)]
pub struct IpPermit {
    counters: Option<Arc<Counters>>,
    ip: IpAddr,
}

impl IpPermit {
    pub fn release(&mut self) {
        if let Some(counters) = self.counters.take() {
            decrement(&mut counters.ips(), &self.ip);
        }
    }
}

impl Drop for IpPermit {
    fn drop(&mut self) {
        self.release();
    }
}
