use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::types::NodeRecord;

/// Per-process table of known nodes.
///
/// Ready nodes refresh their `last_seen_at`; a node not seen Ready within
/// the departure timeout is dropped and reported once. It is tracked again
/// only after it shows up Ready.
#[derive(Debug, Clone)]
pub struct NodeTracker {
    nodes: HashMap<String, NodeRecord>,
    departed: HashSet<String>,
    departure_timeout: Duration,
}

fn key(node: &NodeRecord) -> String {
    node.id.clone().unwrap_or_else(|| node.address.to_string())
}

impl NodeTracker {
    pub fn new(departure_timeout: std::time::Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            departed: HashSet::new(),
            departure_timeout: Duration::from_std(departure_timeout).unwrap_or(Duration::days(1)),
        }
    }

    /// Fold a fresh listing in and return the nodes that departed.
    pub fn observe(&mut self, listing: &[NodeRecord], now: DateTime<Utc>) -> Vec<NodeRecord> {
        let listed: HashSet<String> = listing.iter().map(key).collect();
        self.departed.retain(|k| listed.contains(k));

        for node in listing {
            if self.departed.contains(&key(node)) {
                if !node.healthy {
                    continue;
                }
                self.departed.remove(&key(node));
            }
            let mut record = node.clone();
            match self.nodes.get(&key(node)) {
                _ if node.healthy => record.last_seen_at = now,
                Some(previous) => record.last_seen_at = previous.last_seen_at,
                None => {}
            }
            self.nodes.insert(key(node), record);
        }

        let timeout = self.departure_timeout;
        let departed: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| now - n.last_seen_at > timeout)
            .map(|(k, _)| k.clone())
            .collect();
        self.departed.extend(departed.iter().cloned());
        departed
            .iter()
            .filter_map(|k| self.nodes.remove(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }
}
