//! Node selection: script-based filtering, exclusion sets, multi-host
//! reservation, and the FREE/BUSY transitions around task execution.
//!
//! The FREE -> BUSY flip happens under the pool lock, so two concurrent
//! selection calls can never double-book a node. Predicate evaluation runs
//! outside the lock: a candidate stays FREE while its script executes and
//! is reserved only if it is still FREE when the script comes back true.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RmConfig;
use crate::error::{Result, SchedulerError};
use crate::events::EventSink;
use crate::executor::script::Script;
use crate::rm::node::{NodeClient, NodeState, RmNode};

/// Node filter for one selection request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// Any FREE node qualifies.
    NoFilter,
    /// Evaluated once per node against node metadata; the verdict is cached
    /// per (script, node).
    Static(Script),
    /// Executed freshly on every candidate node, bounded by the selection
    /// timeout. A timeout or script error skips the node.
    Dynamic(Script),
}

/// The reservation handed back to a caller: the nodes actually booked, which
/// may be fewer than requested, releasable as one atomic unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSet {
    token: Uuid,
    urls: Vec<String>,
}

impl NodeSet {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.iter().any(|u| u == url)
    }
}

struct NodePool {
    nodes: HashMap<String, RmNode>,
    /// Registration order, the iteration tie-break within a source.
    order: Vec<String>,
    /// Higher priority sources are tried first.
    source_priority: HashMap<String, i32>,
}

impl NodePool {
    fn candidate_urls(&self, exclude: &HashSet<String>) -> Vec<String> {
        let mut candidates: Vec<(i32, usize, &String)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(position, url)| {
                let node = self.nodes.get(url)?;
                if node.state != NodeState::Free || exclude.contains(url) {
                    return None;
                }
                let priority = self.source_priority.get(&node.source).copied().unwrap_or(0);
                Some((priority, position, url))
            })
            .collect();
        // Source priority descending, then registration order.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, _, url)| url.clone()).collect()
    }
}

/// Resource selector over a shared node pool. The one cross-job critical
/// section in the system.
pub struct ResourceSelector<C: NodeClient> {
    pool: Mutex<NodePool>,
    client: C,
    config: RmConfig,
    events: EventSink,
    static_cache: Mutex<HashMap<(u64, String), bool>>,
}

impl<C: NodeClient> ResourceSelector<C> {
    pub fn new(client: C, config: RmConfig, events: EventSink) -> Self {
        Self {
            pool: Mutex::new(NodePool {
                nodes: HashMap::new(),
                order: Vec::new(),
                source_priority: HashMap::new(),
            }),
            client,
            config,
            events,
            static_cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pool(&self) -> Result<std::sync::MutexGuard<'_, NodePool>> {
        self.pool
            .lock()
            .map_err(|_| SchedulerError::NoConnection("node pool lock poisoned".into()))
    }

    pub fn register_source(&self, name: impl Into<String>, priority: i32) -> Result<()> {
        let mut pool = self.lock_pool()?;
        pool.source_priority.insert(name.into(), priority);
        Ok(())
    }

    pub fn add_node(&self, node: RmNode) -> Result<()> {
        let mut pool = self.lock_pool()?;
        let url = node.url.clone();
        if pool.nodes.insert(url.clone(), node).is_none() {
            pool.order.push(url);
        }
        Ok(())
    }

    pub fn remove_node(&self, url: &str) -> Result<()> {
        let mut pool = self.lock_pool()?;
        pool.nodes.remove(url);
        pool.order.retain(|u| u != url);
        drop(pool);
        if let Ok(mut cache) = self.static_cache.lock() {
            cache.retain(|(_, cached_url), _| cached_url != url);
        }
        Ok(())
    }

    pub fn node_state(&self, url: &str) -> Result<Option<NodeState>> {
        Ok(self.lock_pool()?.nodes.get(url).map(|n| n.state))
    }

    pub fn free_node_count(&self) -> Result<usize> {
        Ok(self
            .lock_pool()?
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Free)
            .count())
    }

    pub fn busy_node_count(&self) -> Result<usize> {
        Ok(self
            .lock_pool()?
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Busy)
            .count())
    }

    /// Reserves at most `max_count` eligible nodes (0 means all available).
    ///
    /// Returns however many nodes qualified, never blocking to wait for
    /// more; the caller decides whether a partial set is usable and
    /// releases it with [`release_nodes`](Self::release_nodes) if not.
    pub async fn select_nodes(
        &self,
        max_count: usize,
        policy: &SelectionPolicy,
        exclude: &HashSet<String>,
    ) -> Result<NodeSet> {
        let target = if max_count == 0 { usize::MAX } else { max_count };
        let token = Uuid::new_v4();
        let mut reserved: Vec<String> = Vec::new();

        let candidates = self.lock_pool()?.candidate_urls(exclude);

        for url in candidates {
            if reserved.len() >= target {
                break;
            }
            if !self.evaluate_predicate(&url, policy).await {
                continue;
            }
            // The node stayed FREE (and unreserved) while the predicate
            // ran; book it only if nobody else took it meanwhile.
            let mut pool = self.lock_pool()?;
            if let Some(node) = pool.nodes.get_mut(&url) {
                if node.state == NodeState::Free {
                    node.state = NodeState::Busy;
                    node.owner = Some(token);
                    drop(pool);
                    self.events.node_state_changed(&url, NodeState::Busy);
                    reserved.push(url);
                }
            }
        }

        tracing::debug!(
            requested = max_count,
            reserved = reserved.len(),
            "Node selection completed"
        );
        Ok(NodeSet {
            token,
            urls: reserved,
        })
    }

    async fn evaluate_predicate(&self, url: &str, policy: &SelectionPolicy) -> bool {
        match policy {
            SelectionPolicy::NoFilter => true,
            SelectionPolicy::Static(script) => {
                let key = (script.digest(), url.to_string());
                if let Ok(cache) = self.static_cache.lock() {
                    if let Some(&verdict) = cache.get(&key) {
                        return verdict;
                    }
                }
                let verdict = self.run_selection_script(url, script).await;
                if let Ok(mut cache) = self.static_cache.lock() {
                    cache.insert(key, verdict);
                }
                verdict
            }
            SelectionPolicy::Dynamic(script) => self.run_selection_script(url, script).await,
        }
    }

    /// Script errors and timeouts exclude the candidate, they never fail
    /// the selection as a whole.
    async fn run_selection_script(&self, url: &str, script: &Script) -> bool {
        let evaluation = tokio::time::timeout(
            self.config.selection_script_timeout,
            self.client.execute_script(url, script),
        )
        .await;
        match evaluation {
            Ok(Ok(eligible)) => eligible,
            Ok(Err(e)) => {
                tracing::warn!(node_url = %url, error = %e, "Selection script failed, skipping node");
                false
            }
            Err(_) => {
                tracing::warn!(node_url = %url, "Selection script timed out, skipping node");
                false
            }
        }
    }

    /// Releases a whole reservation atomically: every node of the set goes
    /// back to FREE under one lock hold.
    pub fn release_nodes(&self, set: &NodeSet) -> Result<()> {
        let mut released = Vec::with_capacity(set.len());
        {
            let mut pool = self.lock_pool()?;
            for url in set.urls() {
                if let Some(node) = pool.nodes.get_mut(url) {
                    if node.owner == Some(set.token)
                        && matches!(node.state, NodeState::Busy | NodeState::ToBeReleased)
                    {
                        node.state = NodeState::Free;
                        node.owner = None;
                        released.push(url.clone());
                    }
                }
            }
        }
        for url in released {
            self.events.node_state_changed(&url, NodeState::Free);
        }
        Ok(())
    }

    /// Administrative FREE -> LOCKED transition.
    pub fn lock_nodes(&self, urls: &[String]) -> Result<()> {
        let mut locked = Vec::new();
        {
            let mut pool = self.lock_pool()?;
            for url in urls {
                if let Some(node) = pool.nodes.get_mut(url) {
                    if node.state == NodeState::Free {
                        node.state = NodeState::Locked;
                        locked.push(url.clone());
                    }
                }
            }
        }
        for url in locked {
            self.events.node_state_changed(&url, NodeState::Locked);
        }
        Ok(())
    }

    pub fn mark_down(&self, url: &str) -> Result<()> {
        let changed = {
            let mut pool = self.lock_pool()?;
            match pool.nodes.get_mut(url) {
                Some(node) if node.state != NodeState::Down => {
                    node.state = NodeState::Down;
                    node.owner = None;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.events.node_state_changed(url, NodeState::Down);
        }
        Ok(())
    }

    /// Heartbeats every node; unresponsive ones are marked DOWN.
    pub async fn check_nodes(&self) -> Result<Vec<String>> {
        let urls: Vec<String> = self.lock_pool()?.order.clone();
        let mut down = Vec::new();
        for url in urls {
            let alive = tokio::time::timeout(
                self.config.node_timeout,
                self.client.heartbeat(&url),
            )
            .await;
            if !matches!(alive, Ok(Ok(()))) {
                self.mark_down(&url)?;
                down.push(url);
            }
        }
        Ok(down)
    }
}
