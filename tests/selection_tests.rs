//! Resource selection tests: filtering, reservation atomicity, the static
//! verdict cache, and node state transitions.


use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gridsched::error::{Result, SchedulerError};
use gridsched::events::{EventSink, SchedulerEvent};
use gridsched::executor::script::Script;
use gridsched::rm::node::{NodeClient, NodeState, RmNode};
use gridsched::rm::selection::{ResourceSelector, SelectionPolicy};
use test_harness::{exclude, test_config, test_selector};

/// Scripted client: counts evaluations and answers from a fixed predicate.
#[derive(Clone)]
struct StubClient {
    calls: Arc<AtomicUsize>,
    eligible: fn(&str) -> Result<bool>,
    delay: Duration,
}

impl StubClient {
    fn accepting_all() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            eligible: |_| Ok(true),
            delay: Duration::ZERO,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeClient for StubClient {
    async fn execute_script(&self, node_url: &str, _script: &Script) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.eligible)(node_url)
    }

    async fn heartbeat(&self, _node_url: &str) -> Result<()> {
        Ok(())
    }
}

fn stub_selector(client: StubClient, count: usize) -> Arc<ResourceSelector<StubClient>> {
    let selector = ResourceSelector::new(client, test_config().rm, EventSink::default());
    selector.register_source("local", 0).unwrap();
    for i in 0..count {
        selector
            .add_node(RmNode::new(format!("node://{i}"), "local"))
            .unwrap();
    }
    Arc::new(selector)
}

#[tokio::test]
async fn excluded_nodes_are_never_reserved() {
    let selector = test_selector(5);
    let set = selector
        .select_nodes(5, &SelectionPolicy::NoFilter, &exclude(&["node://2"]))
        .await
        .unwrap();

    assert_eq!(set.len(), 4);
    assert!(!set.contains("node://2"));
    assert_eq!(
        selector.node_state("node://2").unwrap(),
        Some(NodeState::Free)
    );
    assert_eq!(selector.busy_node_count().unwrap(), 4);
}

#[tokio::test]
async fn concurrent_selections_never_double_book() {
    let selector = test_selector(4);
    let mut workers = Vec::new();
    for _ in 0..8 {
        let selector = selector.clone();
        workers.push(tokio::spawn(async move {
            selector
                .select_nodes(1, &SelectionPolicy::NoFilter, &HashSet::new())
                .await
                .unwrap()
        }));
    }

    let mut booked = Vec::new();
    for worker in workers {
        booked.extend(worker.await.unwrap().urls().to_vec());
    }

    // Every node handed out exactly once; the extra requests came up empty.
    booked.sort();
    let unique: HashSet<&String> = booked.iter().collect();
    assert_eq!(unique.len(), booked.len(), "a node was double-booked");
    assert_eq!(booked.len(), 4);
    assert_eq!(selector.free_node_count().unwrap(), 0);
}

#[tokio::test]
async fn dynamic_script_filters_on_node_url() {
    let selector = test_selector(4);
    let policy = SelectionPolicy::Dynamic(Script::new("test \"$GS_NODE_URL\" = node://2"));

    let set = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    assert_eq!(set.urls(), ["node://2".to_string()]);
}

#[tokio::test]
async fn max_count_zero_takes_every_eligible_node() {
    let selector = test_selector(3);
    let set = selector
        .select_nodes(0, &SelectionPolicy::NoFilter, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(set.len(), 3);
    assert_eq!(selector.free_node_count().unwrap(), 0);
}

#[tokio::test]
async fn static_verdicts_are_cached_per_script_and_node() {
    let client = StubClient::accepting_all();
    let selector = stub_selector(client.clone(), 3);
    let policy = SelectionPolicy::Static(Script::new("probe"));

    let first = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(client.call_count(), 3);

    selector.release_nodes(&first).unwrap();

    // Same script, same nodes: no re-evaluation.
    let second = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    assert_eq!(second.len(), 3);
    assert_eq!(client.call_count(), 3);

    // A different script misses the cache.
    let other = SelectionPolicy::Static(Script::new("other probe"));
    selector.release_nodes(&second).unwrap();
    selector.select_nodes(0, &other, &HashSet::new()).await.unwrap();
    assert_eq!(client.call_count(), 6);
}

#[tokio::test]
async fn dynamic_scripts_are_reevaluated_every_time() {
    let client = StubClient::accepting_all();
    let selector = stub_selector(client.clone(), 2);
    let policy = SelectionPolicy::Dynamic(Script::new("probe"));

    let set = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    selector.release_nodes(&set).unwrap();
    selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    assert_eq!(client.call_count(), 4);
}

#[tokio::test]
async fn removing_a_node_purges_its_cached_verdicts() {
    let client = StubClient::accepting_all();
    let selector = stub_selector(client.clone(), 2);
    let policy = SelectionPolicy::Static(Script::new("probe"));

    let set = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    selector.release_nodes(&set).unwrap();
    assert_eq!(client.call_count(), 2);

    selector.remove_node("node://0").unwrap();
    selector
        .add_node(RmNode::new("node://0", "local"))
        .unwrap();

    // The re-registered node is evaluated afresh; node://1 stays cached.
    let set = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn failing_selection_script_skips_the_node() {
    let client = StubClient {
        calls: Arc::new(AtomicUsize::new(0)),
        eligible: |url| {
            if url == "node://1" {
                Err(SchedulerError::NoConnection("unreachable".into()))
            } else {
                Ok(true)
            }
        },
        delay: Duration::ZERO,
    };
    let selector = stub_selector(client, 3);
    let policy = SelectionPolicy::Dynamic(Script::new("probe"));

    let set = selector.select_nodes(0, &policy, &HashSet::new()).await.unwrap();
    assert_eq!(set.len(), 2);
    assert!(!set.contains("node://1"));
    // The failing node is skipped, not failed or marked busy.
    assert_eq!(
        selector.node_state("node://1").unwrap(),
        Some(NodeState::Free)
    );
}

#[tokio::test]
async fn selection_script_timeout_skips_the_node() {
    let client = StubClient {
        calls: Arc::new(AtomicUsize::new(0)),
        eligible: |_| Ok(true),
        delay: Duration::from_secs(5),
    };
    // test_config's selection timeout is 500ms, well under the stub's delay.
    let selector = stub_selector(client, 1);
    let policy = SelectionPolicy::Dynamic(Script::new("probe"));

    let set = selector.select_nodes(1, &policy, &HashSet::new()).await.unwrap();
    assert!(set.is_empty());
    assert_eq!(selector.free_node_count().unwrap(), 1);
}

#[tokio::test]
async fn release_frees_only_the_owning_reservation() {
    let selector = test_selector(4);
    let first = selector
        .select_nodes(2, &SelectionPolicy::NoFilter, &HashSet::new())
        .await
        .unwrap();
    let second = selector
        .select_nodes(2, &SelectionPolicy::NoFilter, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(selector.busy_node_count().unwrap(), 4);

    selector.release_nodes(&first).unwrap();
    assert_eq!(selector.free_node_count().unwrap(), 2);
    for url in second.urls() {
        assert_eq!(selector.node_state(url).unwrap(), Some(NodeState::Busy));
    }

    // Releasing the same set twice is harmless.
    selector.release_nodes(&first).unwrap();
    assert_eq!(selector.free_node_count().unwrap(), 2);
}

#[tokio::test]
async fn locked_and_down_nodes_are_not_candidates() {
    let selector = test_selector(3);
    selector.lock_nodes(&["node://0".to_string()]).unwrap();
    selector.mark_down("node://1").unwrap();

    let set = selector
        .select_nodes(0, &SelectionPolicy::NoFilter, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(set.urls(), ["node://2".to_string()]);
}

#[tokio::test]
async fn busy_is_observable_before_the_matching_free() {
    let events = EventSink::default();
    let mut rx = events.subscribe();
    let selector = ResourceSelector::new(LocalClient, test_config().rm, events);
    selector.register_source("local", 0).unwrap();
    selector.add_node(RmNode::new("node://0", "local")).unwrap();

    let set = selector
        .select_nodes(1, &SelectionPolicy::NoFilter, &HashSet::new())
        .await
        .unwrap();
    selector.release_nodes(&set).unwrap();

    assert_eq!(
        rx.recv().await.unwrap(),
        SchedulerEvent::NodeStateChanged {
            node_url: "node://0".to_string(),
            new_state: NodeState::Busy,
        }
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        SchedulerEvent::NodeStateChanged {
            node_url: "node://0".to_string(),
            new_state: NodeState::Free,
        }
    );
}

#[tokio::test]
async fn higher_priority_sources_are_tried_first() {
    let selector = ResourceSelector::new(LocalClient, test_config().rm, EventSink::default());
    selector.register_source("spot", 0).unwrap();
    selector.register_source("reserved", 10).unwrap();
    selector.add_node(RmNode::new("node://spot-0", "spot")).unwrap();
    selector
        .add_node(RmNode::new("node://reserved-0", "reserved"))
        .unwrap();

    let set = selector
        .select_nodes(1, &SelectionPolicy::NoFilter, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(set.urls(), ["node://reserved-0".to_string()]);
}

/// Trivial always-eligible client for tests that never run scripts.
#[derive(Clone, Copy)]
struct LocalClient;

impl NodeClient for LocalClient {
    async fn execute_script(&self, _node_url: &str, _script: &Script) -> Result<bool> {
        Ok(true)
    }

    async fn heartbeat(&self, _node_url: &str) -> Result<()> {
        Ok(())
    }
}
