//! Topic registry and the topic broadcast envelope
//!
//! The registry keeps both directions of the subscription relation (topic to
//! subscribers, connection to topics) and only ever changes them together.

use crate::config::TopicRetention;
use crate::server::connections::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Wire envelope for topic-scoped broadcasts: `{"topic": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEnvelope {
    pub topic: String,
    pub data: String,
}

impl TopicEnvelope {
    pub fn new(topic: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Bidirectional topic membership index
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
    retention: TopicRetention,
}

impl TopicRegistry {
    pub fn new(retention: TopicRetention) -> Self {
        Self {
            topics: HashMap::new(),
            memberships: HashMap::new(),
            retention,
        }
    }

    /// Link a connection and a topic. Returns false if already linked.
    pub fn subscribe(&mut self, id: ConnectionId, topic: &str) -> bool {
        let added = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id);
        if added {
            self.memberships
                .entry(id)
                .or_default()
                .insert(topic.to_string());
        }
        added
    }

    /// Remove the link. Returns false if it did not exist.
    pub fn unsubscribe(&mut self, id: ConnectionId, topic: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(subscribers) => subscribers.remove(&id),
            None => false,
        };
        if !removed {
            return false;
        }

        if let Some(topics) = self.memberships.get_mut(&id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.memberships.remove(&id);
            }
        }
        self.prune(topic);
        true
    }

    /// Drop every link of a connection, returning the topics it left
    pub fn remove_connection(&mut self, id: ConnectionId) -> Vec<String> {
        let Some(topics) = self.memberships.remove(&id) else {
            return Vec::new();
        };

        let mut left: Vec<String> = topics.into_iter().collect();
        left.sort();
        for topic in &left {
            if let Some(subscribers) = self.topics.get_mut(topic) {
                subscribers.remove(&id);
            }
            self.prune(topic);
        }
        left
    }

    fn prune(&mut self, topic: &str) {
        if self.retention == TopicRetention::Prune
            && self.topics.get(topic).is_some_and(|s| s.is_empty())
        {
            self.topics.remove(topic);
        }
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashSet::len)
    }

    pub fn is_subscribed(&self, id: ConnectionId, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|s| s.contains(&id))
    }

    /// All known topic names, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Topics a connection is subscribed to, sorted
    pub fn topics_of(&self, id: ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .memberships
            .get(&id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.memberships.clear();
    }

    /// Both directions of the index agree
    pub fn is_consistent(&self) -> bool {
        let forward = self.topics.iter().all(|(topic, subs)| {
            subs.iter()
                .all(|id| self.memberships.get(id).is_some_and(|t| t.contains(topic)))
        });
        let backward = self.memberships.iter().all(|(id, topics)| {
            topics
                .iter()
                .all(|t| self.topics.get(t).is_some_and(|s| s.contains(id)))
        });
        forward && backward
    }
}
