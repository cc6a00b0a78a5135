use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::TbusError;
use crate::topics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Sync,
    Async,
}

/// Topic registry, connected nodes and per-topic subscriber sets.
///
/// Generic over the node handle so routing decisions can be tested
/// without sockets. Subscriber sets hold node names; the handle lives
/// once in `nodes`.
#[derive(Debug)]
pub(crate) struct BrokerState<N> {
    sync_topics: HashSet<String>,
    async_topics: HashSet<String>,
    subscriptions: HashMap<String, BTreeSet<String>>,
    nodes: HashMap<String, N>,
}

impl<N: Clone> BrokerState<N> {
    pub fn new<S, A>(sync_topics: S, async_topics: A) -> Self
    where
        S: IntoIterator<Item = String>,
        A: IntoIterator<Item = String>,
    {
        let mut state = Self {
            sync_topics: [topics::SUBSCRIBE, topics::UNSUBSCRIBE]
                .into_iter()
                .map(str::to_string)
                .collect(),
            async_topics: [topics::HEARTBEAT.to_string()].into_iter().collect(),
            subscriptions: HashMap::new(),
            nodes: HashMap::new(),
        };
        state.add_topics(TopicKind::Sync, sync_topics);
        state.add_topics(TopicKind::Async, async_topics);
        state
    }

    pub fn topic_kind(&self, topic: &str) -> Option<TopicKind> {
        if self.sync_topics.contains(topic) {
            Some(TopicKind::Sync)
        } else if self.async_topics.contains(topic) {
            Some(TopicKind::Async)
        } else {
            None
        }
    }

    /// Register topics of `kind`. Topics already known under either kind
    /// are skipped. Returns the newly added ones.
    pub fn add_topics<I>(&mut self, kind: TopicKind, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = Vec::new();
        for topic in names {
            if topic.is_empty() || self.topic_kind(&topic).is_some() {
                continue;
            }
            match kind {
                TopicKind::Sync => self.sync_topics.insert(topic.clone()),
                TopicKind::Async => self.async_topics.insert(topic.clone()),
            };
            added.push(topic);
        }
        added
    }

    /// Drop topics of `kind` and their subscriber sets. Reserved topics
    /// and topics of the other kind are skipped. Returns the removed ones.
    pub fn remove_topics<I>(&mut self, kind: TopicKind, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut removed = Vec::new();
        for topic in names {
            if topics::is_reserved(&topic) {
                continue;
            }
            let was_present = match kind {
                TopicKind::Sync => self.sync_topics.remove(&topic),
                TopicKind::Async => self.async_topics.remove(&topic),
            };
            if was_present {
                self.subscriptions.remove(&topic);
                removed.push(topic);
            }
        }
        removed
    }

    /// User topics (reserved ones excluded), sorted.
    pub fn served_topics(&self) -> Vec<String> {
        let mut served: Vec<String> = self
            .sync_topics
            .iter()
            .chain(&self.async_topics)
            .filter(|t| !topics::is_reserved(t))
            .cloned()
            .collect();
        served.sort();
        served
    }

    pub fn insert_node(&mut self, name: &str, node: N) -> Result<(), TbusError> {
        if self.nodes.contains_key(name) {
            return Err(TbusError::DuplicateNodeName {
                name: name.to_string(),
            });
        }
        self.nodes.insert(name.to_string(), node);
        Ok(())
    }

    /// Remove a node and every subscription it held. Returns the topics it
    /// was subscribed to.
    pub fn remove_node(&mut self, name: &str) -> Option<(N, Vec<String>)> {
        let node = self.nodes.remove(name)?;
        let mut dropped = Vec::new();
        for (topic, subscribers) in self.subscriptions.iter_mut() {
            if subscribers.remove(name) {
                dropped.push(topic.clone());
            }
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        dropped.sort();
        Some((node, dropped))
    }

    pub fn node(&self, name: &str) -> Option<&N> {
        self.nodes.get(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_handles(&self) -> Vec<N> {
        self.nodes.values().cloned().collect()
    }

    pub fn subscribe(&mut self, name: &str, topic: &str) -> Result<(), TbusError> {
        self.check_subscribable(topic)?;
        let inserted = self
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(name.to_string());
        if !inserted {
            return Err(TbusError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, name: &str, topic: &str) -> Result<(), TbusError> {
        let removed = self
            .subscriptions
            .get_mut(topic)
            .is_some_and(|subscribers| subscribers.remove(name));
        if !removed {
            return Err(TbusError::NotSubscribed {
                topic: topic.to_string(),
            });
        }
        if self.subscriptions.get(topic).is_some_and(BTreeSet::is_empty) {
            self.subscriptions.remove(topic);
        }
        Ok(())
    }

    /// Handles of every node subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<N> {
        self.subscriptions
            .get(topic)
            .map(|names| names.iter().filter_map(|n| self.nodes.get(n).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn subscriber_names(&self, topic: &str) -> Vec<String> {
        self.subscriptions
            .get(topic)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_subscribable(&self, topic: &str) -> Result<(), TbusError> {
        if topics::is_reserved(topic) || self.topic_kind(topic).is_none() {
            return Err(TbusError::UnknownTopic {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BrokerState<u32> {
        BrokerState::new(vec!["orders".to_string()], vec!["events".to_string()])
    }

    #[test]
    fn reserved_topics_are_registered() {
        let state = state();
        assert_eq!(state.topic_kind(topics::SUBSCRIBE), Some(TopicKind::Sync));
        assert_eq!(state.topic_kind(topics::UNSUBSCRIBE), Some(TopicKind::Sync));
        assert_eq!(state.topic_kind(topics::HEARTBEAT), Some(TopicKind::Async));
        assert_eq!(state.topic_kind("orders"), Some(TopicKind::Sync));
        assert_eq!(state.topic_kind("events"), Some(TopicKind::Async));
        assert_eq!(state.topic_kind("nope"), None);
        assert_eq!(state.served_topics(), vec!["events", "orders"]);
    }

    #[test]
    fn duplicate_node_name_rejected() {
        let mut state = state();
        state.insert_node("a", 1).unwrap();
        assert!(matches!(
            state.insert_node("a", 2),
            Err(TbusError::DuplicateNodeName { .. })
        ));
        assert_eq!(state.node("a"), Some(&1));
    }

    #[test]
    fn fan_out_targets_every_subscriber() {
        let mut state = state();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            state.insert_node(name, i as u32).unwrap();
            state.subscribe(name, "events").unwrap();
        }
        let mut targets = state.subscribers("events");
        targets.sort();
        assert_eq!(targets, vec![0, 1, 2]);
        assert!(state.subscribers("orders").is_empty());
    }

    #[test]
    fn subscribe_twice_is_an_error() {
        let mut state = state();
        state.insert_node("a", 1).unwrap();
        state.subscribe("a", "orders").unwrap();
        assert!(matches!(
            state.subscribe("a", "orders"),
            Err(TbusError::AlreadySubscribed { .. })
        ));
    }

    #[test]
    fn unknown_and_reserved_topics_cannot_be_subscribed() {
        let mut state = state();
        state.insert_node("a", 1).unwrap();
        assert!(matches!(
            state.subscribe("a", "nope"),
            Err(TbusError::UnknownTopic { .. })
        ));
        assert!(state.subscribe("a", topics::HEARTBEAT).is_err());
    }

    #[test]
    fn unsubscribe_not_subscribed_leaves_set_unchanged() {
        let mut state = state();
        state.insert_node("a", 1).unwrap();
        state.insert_node("b", 2).unwrap();
        state.subscribe("b", "events").unwrap();

        assert!(matches!(
            state.unsubscribe("a", "events"),
            Err(TbusError::NotSubscribed { .. })
        ));
        assert_eq!(state.subscriber_names("events"), vec!["b"]);

        state.unsubscribe("b", "events").unwrap();
        assert!(state.subscriber_names("events").is_empty());
    }

    #[test]
    fn remove_node_drops_all_its_subscriptions() {
        let mut state = state();
        state.insert_node("a", 1).unwrap();
        state.insert_node("b", 2).unwrap();
        state.subscribe("a", "events").unwrap();
        state.subscribe("a", "orders").unwrap();
        state.subscribe("b", "events").unwrap();

        let (handle, dropped) = state.remove_node("a").unwrap();
        assert_eq!(handle, 1);
        assert_eq!(dropped, vec!["events", "orders"]);
        assert_eq!(state.subscriber_names("events"), vec!["b"]);
        assert!(state.subscriber_names("orders").is_empty());
        assert!(state.remove_node("a").is_none());
        assert_eq!(state.node_count(), 1);
    }

    #[test]
    fn topic_registry_edits() {
        let mut state = state();
        assert_eq!(
            state.add_topics(TopicKind::Sync, vec!["orders".into(), "billing".into()]),
            vec!["billing"]
        );
        assert!(state
            .add_topics(TopicKind::Async, vec!["billing".into()])
            .is_empty());

        state.insert_node("a", 1).unwrap();
        state.subscribe("a", "billing").unwrap();
        assert!(state
            .remove_topics(TopicKind::Async, vec!["billing".into()])
            .is_empty());
        assert_eq!(
            state.remove_topics(TopicKind::Sync, vec!["billing".into(), topics::SUBSCRIBE.into()]),
            vec!["billing"]
        );
        assert!(state.subscribers("billing").is_empty());
        assert_eq!(state.topic_kind(topics::SUBSCRIBE), Some(TopicKind::Sync));
    }
}
