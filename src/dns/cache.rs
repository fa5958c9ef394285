//! Single-flight DNS cache.
//!
//! One in-flight resolution per domain: the first caller for a domain gets
//! `created == true` and must finish the node with [`CacheNode::publish`] or
//! [`CacheNode::fail`]; everyone else suspends in [`CacheNode::wait`] and
//! observes the same terminal result. Failed nodes are evicted so the next
//! request retries instead of caching the error.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum NodeState {
    Pending,
    Ready(IpAddr),
    Failed(String),
}

/// Coordination object shared by the resolving creator and all waiters.
pub struct CacheNode {
    state: watch::Sender<NodeState>,
}

impl CacheNode {
    fn new() -> Self {
        let (tx, _) = watch::channel(NodeState::Pending);
        Self { state: tx }
    }

    /// Suspend until the node is terminal. Every waiter sees the same
    /// result. A node dropped while pending (cache torn down) yields
    /// `Cancelled`.
    pub async fn wait(&self) -> Result<IpAddr> {
        let mut rx = self.state.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                NodeState::Ready(ip) => return Ok(*ip),
                NodeState::Failed(msg) => return Err(Error::Resolve(msg.clone())),
                NodeState::Pending => {}
            }
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    /// Terminal: PENDING → READY. Wakes all waiters.
    pub fn publish(&self, ip: IpAddr) {
        self.state.send_replace(NodeState::Ready(ip));
    }

    /// Terminal: PENDING → FAILED. Wakes all waiters with the error; the
    /// owning cache must evict the node afterwards.
    pub fn fail(&self, reason: &str) {
        self.state.send_replace(NodeState::Failed(reason.to_string()));
    }
}

/// Concurrent domain → CacheNode map.
pub struct DnsCache {
    nodes: Mutex<HashMap<String, Arc<CacheNode>>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Return the node for `domain`, inserting a fresh pending node when
    /// absent. `created == true` makes the caller the resolver; everyone
    /// else only waits.
    pub fn get_or_create(&self, domain: &str) -> (Arc<CacheNode>, bool) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get(domain) {
            return (node.clone(), false);
        }
        let node = Arc::new(CacheNode::new());
        nodes.insert(domain.to_string(), node.clone());
        debug!("dns cache: new node for {}", domain);
        (node, true)
    }

    /// Evict a failed node so the next request retries.
    pub fn remove(&self, domain: &str) {
        self.nodes.lock().unwrap().remove(domain);
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_flag_is_set_once() {
        let cache = DnsCache::new();
        let (_, created) = cache.get_or_create("a.test");
        assert!(created);
        let (_, created) = cache.get_or_create("a.test");
        assert!(!created);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn waiters_observe_published_ip() {
        let cache = Arc::new(DnsCache::new());
        let (node, created) = cache.get_or_create("x.test");
        assert!(created);

        let mut waiters = Vec::new();
        for _ in 0..100 {
            let (node, created) = cache.get_or_create("x.test");
            assert!(!created);
            waiters.push(tokio::spawn(async move { node.wait().await }));
        }

        node.publish("10.0.0.1".parse().unwrap());
        for handle in waiters {
            let ip = handle.await.unwrap().unwrap();
            assert_eq!(ip.to_string(), "10.0.0.1");
        }
    }

    #[tokio::test]
    async fn waiters_observe_failure_and_cache_retries() {
        let cache = Arc::new(DnsCache::new());
        let (node, _) = cache.get_or_create("y.test");

        let waiter = {
            let (node, _) = cache.get_or_create("y.test");
            tokio::spawn(async move { node.wait().await })
        };

        node.fail("no such host");
        cache.remove("y.test");

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));

        // Eviction lets a later caller become creator again
        let (_, created) = cache.get_or_create("y.test");
        assert!(created);
    }

    #[tokio::test]
    async fn wait_after_terminal_returns_immediately() {
        let cache = DnsCache::new();
        let (node, _) = cache.get_or_create("z.test");
        node.publish("192.0.2.7".parse().unwrap());
        assert_eq!(node.wait().await.unwrap().to_string(), "192.0.2.7");
    }
}
