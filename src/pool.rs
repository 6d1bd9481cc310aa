//! Keyed pool of remote sessions.
//!
//! The pool keeps idle sessions per [`Identity`] value. A borrowed session
//! is moved out of the pool and owned by exactly one caller until it is
//! released or invalidated, so no two borrowers can ever share one.
//!
//! Structural changes (borrowing, returning, sweeping, shutdown) happen
//! under one short-lived lock that is never held across a network call.
//! Session construction is serialised per identity by a creation gate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::{PoolConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::session::Session;
use crate::transport::Transport;

/// An idle session under examination by the eviction sweep.
pub struct EvictionCandidate<'a> {
    pub session: &'a Session,
    /// How long the session has been idle.
    pub idle_for: Duration,
    /// Idle sessions for the same identity still in the pool, this one included.
    pub idle_count: usize,
}

/// Decides whether an idle session should be evicted.
#[async_trait]
pub trait EvictionPolicy: Send + Sync {
    async fn evict(&self, candidate: &EvictionCandidate<'_>) -> bool;
}

/// Idle-time and idle-count thresholds.
///
/// A session is evicted once idle longer than `min_evictable_idle`, or once
/// idle longer than `soft_min_evictable_idle` while more than `min_idle`
/// sessions sit idle for its identity.
#[derive(Debug, Clone)]
pub struct IdleEvictionPolicy {
    pub min_evictable_idle: Duration,
    pub soft_min_evictable_idle: Duration,
    pub min_idle: usize,
}

impl IdleEvictionPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            min_evictable_idle: config.min_evictable_idle(),
            soft_min_evictable_idle: config.soft_min_evictable_idle(),
            min_idle: config.min_idle_per_identity,
        }
    }

    fn should_evict(&self, idle_for: Duration, idle_count: usize) -> bool {
        idle_for > self.min_evictable_idle
            || (idle_for > self.soft_min_evictable_idle && idle_count > self.min_idle)
    }
}

#[async_trait]
impl EvictionPolicy for IdleEvictionPolicy {
    async fn evict(&self, candidate: &EvictionCandidate<'_>) -> bool {
        self.should_evict(candidate.idle_for, candidate.idle_count)
    }
}

/// Evicts when the inner policy says so, or when the session is dead.
///
/// A terminated session or one failing its liveness probe is evicted
/// even if the inner policy would keep it.
pub struct LivenessEvictionPolicy<P = IdleEvictionPolicy> {
    inner: P,
}

impl<P: EvictionPolicy> LivenessEvictionPolicy<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P: EvictionPolicy> EvictionPolicy for LivenessEvictionPolicy<P> {
    async fn evict(&self, candidate: &EvictionCandidate<'_>) -> bool {
        self.inner.evict(candidate).await
            || candidate.session.is_terminated()
            || !candidate.session.check_liveness().await
    }
}

/// Snapshot of pool bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions sitting idle in the pool.
    pub idle: usize,
    /// Sessions currently borrowed.
    pub active: usize,
    /// Sessions constructed over the pool's lifetime.
    pub created: u64,
    /// Sessions destroyed over the pool's lifetime.
    pub destroyed: u64,
}

struct IdleSession {
    session: Session,
    idle_since: Instant,
}

#[derive(Default)]
struct Slot {
    /// Oldest at the front; borrowers take from the back.
    idle: VecDeque<IdleSession>,
    active: usize,
    creating: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<Identity, Slot>,
    closed: bool,
    created: u64,
    destroyed: u64,
}

/// A pool of remote sessions keyed by identity.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    session_config: SessionConfig,
    config: PoolConfig,
    policy: Box<dyn EvictionPolicy>,
    state: Mutex<PoolState>,
}

impl SessionPool {
    /// Creates a pool using the default liveness-aware eviction policy.
    pub fn new(
        transport: Arc<dyn Transport>,
        session_config: SessionConfig,
        config: PoolConfig,
    ) -> Self {
        let policy = LivenessEvictionPolicy::new(IdleEvictionPolicy::from_config(&config));
        Self::with_policy(transport, session_config, config, Box::new(policy))
    }

    /// Creates a pool with a custom eviction policy.
    pub fn with_policy(
        transport: Arc<dyn Transport>,
        session_config: SessionConfig,
        config: PoolConfig,
        policy: Box<dyn EvictionPolicy>,
    ) -> Self {
        Self {
            transport,
            session_config,
            config,
            policy,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Borrows a live session for `identity`, constructing one if none is idle.
    pub async fn acquire(&self, identity: &Identity) -> Result<Session> {
        if let Some(session) = self.borrow_idle(identity).await? {
            return Ok(session);
        }

        let gate = {
            let mut state = self.state();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            Arc::clone(&state.slots.entry(identity.clone()).or_default().creating)
        };
        let _creating = gate.lock().await;

        // A session may have been returned while this caller waited.
        if let Some(session) = self.borrow_idle(identity).await? {
            return Ok(session);
        }

        self.create(identity).await
    }

    async fn borrow_idle(&self, identity: &Identity) -> Result<Option<Session>> {
        loop {
            let idle = {
                let mut state = self.state();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                let slot = state.slots.entry(identity.clone()).or_default();
                let idle = slot.idle.pop_back();
                if idle.is_some() {
                    slot.active += 1;
                }
                idle
            };

            let Some(IdleSession { session, .. }) = idle else {
                return Ok(None);
            };

            if !self.config.test_on_borrow || session.check_liveness().await {
                tracing::debug!(identity = %identity, session = %session.id(), "borrowed pooled session");
                return Ok(Some(session));
            }

            tracing::warn!(identity = %identity, session = %session.id(), "pooled session failed validation on borrow");
            self.destroy(identity, session).await;
        }
    }

    async fn create(&self, identity: &Identity) -> Result<Session> {
        let mut session = Session::create_remote(
            identity.clone(),
            Arc::clone(&self.transport),
            self.session_config.clone(),
        )
        .await?;

        let closed = {
            let mut state = self.state();
            if !state.closed {
                state.slots.entry(identity.clone()).or_default().active += 1;
                state.created += 1;
            }
            state.closed
        };

        if closed {
            session.terminate().await;
            return Err(Error::PoolClosed);
        }
        Ok(session)
    }

    /// Returns a borrowed session to the pool for reuse.
    ///
    /// The session is not probed or terminated; dead sessions are caught by
    /// the next borrow validation or eviction sweep. A session returned
    /// after shutdown is terminated.
    pub async fn release(&self, identity: &Identity, session: Session) {
        let leftover = {
            let mut state = self.state();
            let closed = state.closed;
            let slot = state.slots.entry(identity.clone()).or_default();
            slot.active = slot.active.saturating_sub(1);
            if closed || session.is_terminated() {
                Some(session)
            } else {
                slot.idle.push_back(IdleSession {
                    session,
                    idle_since: Instant::now(),
                });
                None
            }
        };

        if let Some(mut session) = leftover {
            if !session.is_terminated() {
                session.terminate().await;
            }
            self.state().destroyed += 1;
        }
    }

    /// Destroys a borrowed session the caller found to be dead.
    pub async fn invalidate(&self, identity: &Identity, session: Session) {
        tracing::info!(identity = %identity, session = %session.id(), "invalidating session");
        self.destroy(identity, session).await;
    }

    async fn destroy(&self, identity: &Identity, mut session: Session) {
        {
            let mut state = self.state();
            if let Some(slot) = state.slots.get_mut(identity) {
                slot.active = slot.active.saturating_sub(1);
            }
            state.destroyed += 1;
        }
        session.terminate().await;
    }

    /// Runs one eviction sweep and returns the number of sessions evicted.
    ///
    /// Idle sessions are taken out of the pool while they are examined, so
    /// a borrower never receives a session that is being probed. Sessions
    /// beyond `max_idle_per_identity` are evicted oldest first.
    pub async fn evict(&self) -> usize {
        let batches: Vec<(Identity, Vec<IdleSession>)> = {
            let mut state = self.state();
            if state.closed {
                return 0;
            }
            state
                .slots
                .iter_mut()
                .filter(|(_, slot)| !slot.idle.is_empty())
                .map(|(identity, slot)| (identity.clone(), slot.idle.drain(..).collect()))
                .collect()
        };

        let now = Instant::now();
        let mut evicted = 0;

        for (identity, entries) in batches {
            let mut remaining = entries.len();
            let mut batch_evicted = 0;
            let mut kept = Vec::new();

            for entry in entries {
                let candidate = EvictionCandidate {
                    session: &entry.session,
                    idle_for: now.saturating_duration_since(entry.idle_since),
                    idle_count: remaining,
                };
                let surplus = remaining > self.config.max_idle_per_identity;

                if surplus || self.policy.evict(&candidate).await {
                    let mut session = entry.session;
                    tracing::info!(identity = %identity, session = %session.id(), surplus, "evicting idle session");
                    session.terminate().await;
                    remaining -= 1;
                    batch_evicted += 1;
                } else {
                    kept.push(entry);
                }
            }

            evicted += batch_evicted;
            let orphaned = {
                let mut state = self.state();
                state.destroyed += batch_evicted as u64;
                if state.closed {
                    kept
                } else {
                    let slot = state.slots.entry(identity.clone()).or_default();
                    for entry in kept.into_iter().rev() {
                        slot.idle.push_front(entry);
                    }
                    Vec::new()
                }
            };

            for entry in orphaned {
                let mut session = entry.session;
                session.terminate().await;
                self.state().destroyed += 1;
            }
        }

        evicted
    }

    /// Spawns the background eviction sweep.
    ///
    /// The task stops once the pool is shut down or dropped.
    pub fn spawn_evictor(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.eviction_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                let evicted = pool.evict().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "eviction sweep finished");
                }
            }
        })
    }

    /// Terminates every idle session and closes the pool.
    ///
    /// Sessions still borrowed are terminated when they are released.
    /// Calling this again is a no-op.
    pub async fn shutdown(&self) {
        let drained: Vec<IdleSession> = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state
                .slots
                .values_mut()
                .flat_map(|slot| slot.idle.drain(..))
                .collect()
        };

        let count = drained.len();
        for entry in drained {
            let mut session = entry.session;
            session.terminate().await;
        }
        {
            let mut state = self.state();
            state.destroyed += count as u64;
            state.slots.retain(|_, slot| slot.active > 0);
        }

        tracing::info!(terminated = count, "session pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Returns a snapshot of pool bookkeeping.
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            idle: state.slots.values().map(|s| s.idle.len()).sum(),
            active: state.slots.values().map(|s| s.active).sum(),
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    /// Number of idle sessions held for `identity`.
    pub fn idle_count(&self, identity: &Identity) -> usize {
        self.state()
            .slots
            .get(identity)
            .map(|s| s.idle.len())
            .unwrap_or(0)
    }
}
