use std::collections::HashMap;

use tbus_transport::Endpoint;

/// Topic → broker endpoint table.
///
/// Registration is last-writer-wins: the resolver is a directory, not an
/// arbiter of topic ownership.
#[derive(Debug, Default)]
pub struct TopicDirectory {
    topics: HashMap<String, Endpoint>,
}

impl TopicDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point every topic in `topics` at `endpoint`, overwriting earlier
    /// registrations. Returns how many topics changed owner or were new.
    pub fn register<I, S>(&mut self, endpoint: &Endpoint, topics: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = 0;
        for topic in topics {
            let previous = self.topics.insert(topic.into(), endpoint.clone());
            if previous.as_ref() != Some(endpoint) {
                changed += 1;
            }
        }
        changed
    }

    /// Remove topics. Absent topics are ignored. Returns how many were removed.
    pub fn deregister<I, S>(&mut self, topics: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        topics
            .into_iter()
            .filter(|t| self.topics.remove(t.as_ref()).is_some())
            .count()
    }

    pub fn resolve(&self, topic: &str) -> Option<&Endpoint> {
        self.topics.get(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}
