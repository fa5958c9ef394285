//! User registry - authentication and per-second bandwidth budgets.
//!
//! Users come from `users.list` plus the locally configured credential pair.
//! The registry is built at init; after that the only mutation is the live
//! usage counters, charged lock-free from every relaying session and zeroed
//! by a 1 Hz ticker task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Traffic direction for accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → origin
    Tx,
    /// Origin → client
    Rx,
}

/// One authorized user.
///
/// Budgets are bytes per second; 0 means unlimited.
pub struct User {
    pub id: String,
    pub password_hash: String,
    pub tx_budget: u64,
    pub rx_budget: u64,
    tx_used: AtomicU64,
    rx_used: AtomicU64,
    failed_attempts: AtomicU64,
}

impl User {
    pub fn new(id: impl Into<String>, password: &str, tx_budget: u64, rx_budget: u64) -> Self {
        Self {
            id: id.into(),
            password_hash: hash_password(password),
            tx_budget,
            rx_budget,
            tx_used: AtomicU64::new(0),
            rx_used: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
        }
    }

    /// Parse a `users.list` line: `id:password[:tx_bps[:rx_bps]]`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.trim().split(':');
        let id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config(format!("invalid user line: {}", line)))?;
        let password = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config(format!("user {} has no password", id)))?;
        let tx_budget = parse_budget(parts.next(), id)?;
        let rx_budget = parse_budget(parts.next(), id)?;
        Ok(User::new(id, password, tx_budget, rx_budget))
    }

    /// Atomically check the budget and charge `n` bytes.
    ///
    /// The CAS loop makes concurrent admits for one user linearizable;
    /// different users never contend.
    pub fn admit(&self, direction: Direction, n: u64) -> Result<()> {
        let (used, budget) = match direction {
            Direction::Tx => (&self.tx_used, self.tx_budget),
            Direction::Rx => (&self.rx_used, self.rx_budget),
        };
        if budget == 0 {
            used.fetch_add(n, Ordering::Relaxed);
            return Ok(());
        }
        let mut current = used.load(Ordering::Relaxed);
        loop {
            if current >= budget {
                return Err(Error::RateLimited(self.id.clone()));
            }
            match used.compare_exchange_weak(
                current,
                current + n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn reset_used(&self) {
        self.tx_used.store(0, Ordering::Relaxed);
        self.rx_used.store(0, Ordering::Relaxed);
    }

    pub fn used(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Tx => self.tx_used.load(Ordering::Relaxed),
            Direction::Rx => self.rx_used.load(Ordering::Relaxed),
        }
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }
}

fn parse_budget(field: Option<&str>, id: &str) -> Result<u64> {
    match field {
        None | Some("") => Ok(0),
        Some(s) => s
            .parse()
            .map_err(|_| Error::Config(format!("user {}: bad budget {}", id, s))),
    }
}

/// SHA-256 hex digest; the hash travels on the AUTH line.
pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Process-wide table of authorized users.
pub struct UserRegistry {
    users: HashMap<String, Arc<User>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Build from `users.list` lines. Bad lines fail the whole load.
    pub fn from_lines(lines: &[String]) -> Result<Self> {
        let mut registry = Self::new();
        for line in lines {
            registry.insert(User::parse(line)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, user: User) {
        self.users.insert(user.id.clone(), Arc::new(user));
    }

    pub fn get(&self, id: &str) -> Option<Arc<User>> {
        self.users.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check an AUTH line's credentials.
    pub fn authenticate(&self, id: &str, password_hash: &str) -> Result<Arc<User>> {
        let user = self.users.get(id).ok_or(Error::AuthFailed)?;
        if user.password_hash != password_hash {
            user.failed_attempts.fetch_add(1, Ordering::Relaxed);
            warn!("auth failed for user {}", id);
            return Err(Error::AuthFailed);
        }
        Ok(user.clone())
    }

    /// 1 Hz ticker zeroing every user's usage counters. Runs until the
    /// shutdown channel fires.
    pub async fn run_ticker(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for user in self.users.values() {
                        user.reset_used();
                    }
                }
                _ = shutdown.recv() => {
                    debug!("user ticker stopping");
                    break;
                }
            }
        }
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
