//! Bookkeeping of the subscriptions of a client.
//!
//! A destination is identified by its topic pattern and an optional share name. Private
//! destinations have no share. The registry is read by the calling threads (`receive`,
//! `unsubscribe`) and by the connection manager when it resubscribes after a reconnect.

use crate::model::Qos;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Key of a destination in the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub topic_pattern: String,
    pub share: Option<String>,
}

impl DestinationKey {
    pub fn new(topic_pattern: &str, share: Option<&str>) -> Self {
        Self {
            topic_pattern: topic_pattern.to_owned(),
            share: share.map(str::to_owned),
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.share {
            Some(share) => write!(f, "share:{}:{}", share, self.topic_pattern),
            None => write!(f, "private:{}", self.topic_pattern),
        }
    }
}

/// An active subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub key: DestinationKey,
    pub qos: Qos,
    /// How long the server keeps the destination after the last subscriber left (ms).
    pub ttl: u64,
    /// Messages are confirmed by the client as soon as they are received.
    pub auto_confirm: bool,
}

/// Match a topic against a topic pattern. Levels are separated by `/`, `+` matches exactly one
/// level and `#` matches any number of levels (including none).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let topic: Vec<&str> = topic.split('/').collect();

    match_levels(&pattern, &topic)
}

fn match_levels(pattern: &[&str], topic: &[&str]) -> bool {
    match (pattern.split_first(), topic.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            // `#` swallows zero or more levels
            (0..=topic.len()).any(|skip| match_levels(rest, &topic[skip..]))
        }
        (Some((&"+", rest)), Some((_, topic_rest))) => match_levels(rest, topic_rest),
        (Some((level, rest)), Some((topic_level, topic_rest))) => {
            level == topic_level && match_levels(rest, topic_rest)
        }
        _ => false,
    }
}

/// A registered destination and the signal fired when it is unsubscribed.
#[derive(Debug)]
struct Entry {
    destination: Destination,
    detached: CancellationToken,
}

/// Registry of the active destinations of a client.
#[derive(Debug, Default)]
pub struct DestinationRegistry {
    destinations: RwLock<HashMap<DestinationKey, Entry>>,
}

impl DestinationRegistry {
    pub fn contains(&self, key: &DestinationKey) -> bool {
        self.destinations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// The destination and a token which is cancelled once the destination is removed, so a
    /// blocked receive can notice an unsubscribe.
    pub fn get(&self, key: &DestinationKey) -> Option<(Destination, CancellationToken)> {
        self.destinations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| (e.destination.clone(), e.detached.clone()))
    }

    /// Register a destination. Returns false if a destination with the same key was already
    /// there, in that case the registry is not changed.
    pub fn insert(&self, destination: Destination) -> bool {
        let mut destinations = self.destinations.write().unwrap_or_else(PoisonError::into_inner);

        if destinations.contains_key(&destination.key) {
            return false;
        }

        destinations.insert(
            destination.key.clone(),
            Entry {
                destination,
                detached: CancellationToken::new(),
            },
        );

        true
    }

    pub fn remove(&self, key: &DestinationKey) -> Option<Destination> {
        let entry = self
            .destinations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)?;

        entry.detached.cancel();

        Some(entry.destination)
    }

    pub fn clear(&self) {
        for (_, entry) in self.destinations.write().unwrap_or_else(PoisonError::into_inner).drain() {
            entry.detached.cancel();
        }
    }

    /// Copy of the active destinations, used for resubscribing after a reconnect.
    pub fn snapshot(&self) -> Vec<Destination> {
        self.destinations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.destination.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.destinations.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
