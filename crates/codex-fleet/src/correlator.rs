//! Id lookup tables used to attribute events that carry partial identifiers.

use std::collections::HashMap;

use codex_ws_client::EventIds;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Correlator {
    item_turn: HashMap<String, String>,
    item_thread: HashMap<String, String>,
    turn_thread: HashMap<String, String>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_turn(&mut self, turn_id: &str, thread_id: &str) {
        self.turn_thread.insert(turn_id.to_string(), thread_id.to_string());
    }

    pub fn record_item(&mut self, item_id: &str, turn_id: Option<&str>, thread_id: Option<&str>) {
        if let Some(turn_id) = turn_id {
            self.item_turn.insert(item_id.to_string(), turn_id.to_string());
        }
        if let Some(thread_id) = thread_id {
            self.item_thread.insert(item_id.to_string(), thread_id.to_string());
        }
    }

    /// Record every pairing `ids` and the resolved thread allow.
    pub fn observe(&mut self, ids: &EventIds, thread_id: Option<&str>) {
        let turn_id = ids.turn_id.as_deref().or_else(|| {
            ids.item_id
                .as_deref()
                .and_then(|item| self.item_turn.get(item).map(String::as_str))
        });
        let turn_id = turn_id.map(str::to_string);
        if let (Some(turn_id), Some(thread_id)) = (turn_id.as_deref(), thread_id) {
            self.record_turn(turn_id, thread_id);
        }
        if let Some(item_id) = ids.item_id.as_deref() {
            self.record_item(item_id, turn_id.as_deref(), thread_id);
        }
    }

    pub fn thread_for_turn(&self, turn_id: &str) -> Option<&str> {
        self.turn_thread.get(turn_id).map(String::as_str)
    }

    pub fn thread_for_item(&self, item_id: &str) -> Option<&str> {
        self.item_thread.get(item_id).map(String::as_str)
    }

    pub fn turn_for_item(&self, item_id: &str) -> Option<&str> {
        self.item_turn.get(item_id).map(String::as_str)
    }

    /// Explicit id, then the turn's own thread id, then the turn and item
    /// tables, then `current`.
    pub fn resolve_thread(&self, ids: &EventIds, current: Option<&str>) -> Option<String> {
        ids.thread_id
            .clone()
            .or_else(|| ids.turn_thread_id.clone())
            .or_else(|| {
                ids.turn_id
                    .as_deref()
                    .and_then(|turn| self.thread_for_turn(turn))
                    .map(str::to_string)
            })
            .or_else(|| {
                ids.item_id
                    .as_deref()
                    .and_then(|item| self.thread_for_item(item))
                    .map(str::to_string)
            })
            .or_else(|| current.map(str::to_string))
    }

    /// Drop every entry that points at `thread_id`.
    pub fn remove_thread(&mut self, thread_id: &str) {
        let turns: Vec<String> = self
            .turn_thread
            .iter()
            .filter(|(_, owner)| owner.as_str() == thread_id)
            .map(|(turn, _)| turn.clone())
            .collect();
        self.turn_thread.retain(|_, owner| owner != thread_id);
        self.item_thread.retain(|_, owner| owner != thread_id);
        self.item_turn.retain(|_, turn| !turns.contains(turn));
    }

    pub fn clear(&mut self) {
        self.item_turn.clear();
        self.item_thread.clear();
        self.turn_thread.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.item_turn.is_empty() && self.item_thread.is_empty() && self.turn_thread.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(thread: Option<&str>, turn: Option<&str>, item: Option<&str>) -> EventIds {
        EventIds {
            thread_id: thread.map(str::to_string),
            turn_thread_id: None,
            turn_id: turn.map(str::to_string),
            item_id: item.map(str::to_string),
        }
    }

    #[test]
    fn resolution_follows_priority_order() {
        let mut correlator = Correlator::new();
        correlator.record_turn("turn-1", "thread-from-turn");
        correlator.record_item("item-1", None, Some("thread-from-item"));

        let explicit = ids(Some("explicit"), Some("turn-1"), Some("item-1"));
        assert_eq!(
            correlator.resolve_thread(&explicit, Some("current")).as_deref(),
            Some("explicit")
        );

        let mut nested = ids(None, Some("turn-1"), Some("item-1"));
        nested.turn_thread_id = Some("nested".to_string());
        assert_eq!(correlator.resolve_thread(&nested, None).as_deref(), Some("nested"));

        let by_turn = ids(None, Some("turn-1"), Some("item-1"));
        assert_eq!(
            correlator.resolve_thread(&by_turn, None).as_deref(),
            Some("thread-from-turn")
        );

        let by_item = ids(None, Some("turn-unknown"), Some("item-1"));
        assert_eq!(
            correlator.resolve_thread(&by_item, None).as_deref(),
            Some("thread-from-item")
        );

        let fallback = ids(None, None, Some("item-unknown"));
        assert_eq!(
            correlator.resolve_thread(&fallback, Some("current")).as_deref(),
            Some("current")
        );
        assert_eq!(correlator.resolve_thread(&fallback, None), None);
    }

    #[test]
    fn observe_links_items_through_their_turn() {
        let mut correlator = Correlator::new();
        correlator.observe(&ids(Some("thread-1"), Some("turn-1"), None), Some("thread-1"));
        correlator.observe(&ids(None, Some("turn-1"), Some("item-1")), Some("thread-1"));

        assert_eq!(correlator.turn_for_item("item-1"), Some("turn-1"));
        assert_eq!(correlator.thread_for_item("item-1"), Some("thread-1"));

        // A later delta carrying only the item id still resolves.
        let delta = ids(None, None, Some("item-1"));
        assert_eq!(correlator.resolve_thread(&delta, None).as_deref(), Some("thread-1"));
    }

    #[test]
    fn remove_thread_only_touches_that_thread() {
        let mut correlator = Correlator::new();
        correlator.observe(&ids(None, Some("turn-a"), Some("item-a")), Some("thread-a"));
        correlator.observe(&ids(None, Some("turn-b"), Some("item-b")), Some("thread-b"));

        correlator.remove_thread("thread-a");
        assert_eq!(correlator.thread_for_turn("turn-a"), None);
        assert_eq!(correlator.thread_for_item("item-a"), None);
        assert_eq!(correlator.turn_for_item("item-a"), None);
        assert_eq!(correlator.thread_for_turn("turn-b"), Some("thread-b"));
        assert_eq!(correlator.turn_for_item("item-b"), Some("turn-b"));

        correlator.clear();
        assert!(correlator.is_empty());
    }
}
