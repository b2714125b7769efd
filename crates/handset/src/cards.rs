//! Registry of remote handsfree audio cards
//!
//! Cards are announced by the manager as bus objects; the registry keys
//! them by object path, one entry per path. Population from CardAdded /
//! CardRemoved signals is future work (the backend subscribes but does not
//! handle them yet); the registry itself is complete and is released at
//! teardown.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One remote handsfree audio card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandsfreeCard {
    /// Bus object path of the card, unique
    pub path: String,
    /// Address of the remote device
    pub remote: String,
    /// Address of the local adapter
    pub local: String,
    /// Codecs the card supports
    pub codecs: Vec<u8>,
}

/// Cards known to the backend, keyed by object path
#[derive(Debug, Default)]
pub struct CardRegistry {
    cards: HashMap<String, HandsfreeCard>,
}

impl CardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a card; an existing entry for the same path is replaced and
    /// returned
    pub fn insert(&mut self, card: HandsfreeCard) -> Option<HandsfreeCard> {
        self.cards.insert(card.path.clone(), card)
    }

    pub fn get(&self, path: &str) -> Option<&HandsfreeCard> {
        self.cards.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<HandsfreeCard> {
        self.cards.remove(path)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn clear(&mut self) {
        self.cards.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandsfreeCard> {
        self.cards.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(path: &str) -> HandsfreeCard {
        HandsfreeCard {
            path: path.to_string(),
            remote: "AA:BB:CC:DD:EE:FF".to_string(),
            local: "00:11:22:33:44:55".to_string(),
            codecs: vec![crate::config::CODEC_CVSD],
        }
    }

    #[test]
    fn one_entry_per_path() {
        let mut reg = CardRegistry::new();
        assert!(reg.insert(card("/card0")).is_none());
        assert!(reg.insert(card("/card1")).is_none());
        assert_eq!(reg.len(), 2);

        // same path replaces, never duplicates
        let replaced = reg.insert(card("/card0"));
        assert!(replaced.is_some());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_and_clear() {
        let mut reg = CardRegistry::new();
        reg.insert(card("/card0"));
        assert!(reg.remove("/card0").is_some());
        assert!(reg.remove("/card0").is_none());

        reg.insert(card("/card1"));
        reg.clear();
        assert!(reg.is_empty());
    }
}
