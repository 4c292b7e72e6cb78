//! Topic naming and discovery.
//!
//! All topics are tenant-prefixed. The subscription set is the two fixed
//! topics plus every per-view topic discovered under the view prefix, and
//! a background watcher re-discovers on an interval and notifies the
//! pipeline when the set changes.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use crate::broker::TopicAdmin;

/// Shared subscription topic for raw view records.
pub fn view_topic(tenant: &str) -> String {
    format!("{tenant}.mdl.view")
}

/// Per-view topics are named under this prefix.
pub fn view_topic_prefix(tenant: &str) -> String {
    format!("{tenant}.mdl.view.")
}

/// Topic where atomic events are republished for aggregate models.
pub fn atomic_event_topic(tenant: &str) -> String {
    format!("{tenant}.mdl.atomic_event")
}

/// Topic consumed by the persistence service.
pub fn persistence_topic(tenant: &str) -> String {
    format!("{tenant}.sdp.mdl-model-persistence.input")
}

/// The topics this service creates on startup when absent.
pub fn required_topics(tenant: &str) -> Vec<String> {
    vec![view_topic(tenant), atomic_event_topic(tenant)]
}

/// Build the current subscription set: the fixed topics plus every
/// broker topic under the view prefix.
pub fn discover_topics(
    admin: &dyn TopicAdmin,
    tenant: &str,
) -> Result<Vec<String>, crate::broker::BrokerError> {
    let prefix = view_topic_prefix(tenant);
    let mut topics = required_topics(tenant);
    for topic in admin.list_topics()? {
        if topic.starts_with(&prefix) {
            topics.push(topic);
        }
    }
    Ok(topics)
}

/// Spawn the discovery watcher. Every `interval` it re-lists the broker
/// topics and, when more than the fixed set is present and it differs
/// from the snapshot, publishes the new set on the channel.
///
/// The watcher only reads the snapshot; the pipeline writes it once a
/// resubscribe succeeds. A set that failed to subscribe therefore still
/// differs on the next tick and is sent again.
pub fn spawn_topic_watcher(
    admin: Arc<dyn TopicAdmin>,
    tenant: String,
    interval: std::time::Duration,
    current: Arc<RwLock<Vec<String>>>,
    sender: mpsc::Sender<Vec<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let discovered = match discover_topics(admin.as_ref(), &tenant) {
                Ok(topics) => topics,
                Err(err) => {
                    error!(error = %err, "topic discovery failed");
                    continue;
                }
            };
            if discovered.len() <= required_topics(&tenant).len() {
                debug!("no per-view topics yet");
                continue;
            }
            let changed = {
                let snapshot = current.read().await;
                !same_set(&snapshot, &discovered)
            };
            if !changed {
                continue;
            }
            info!(count = discovered.len(), "topic set changed");
            if sender.send(discovered).await.is_err() {
                // Pipeline is gone, stop watching.
                return;
            }
        }
    })
}

fn same_set(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}
