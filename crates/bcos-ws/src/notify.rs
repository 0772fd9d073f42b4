//! Block-number tracking.
//!
//! Nodes report the latest block of each group in the handshake and then push
//! a BlockNotify whenever a new block lands. The pool keeps the highest number
//! seen per group and fans increases out to registered notifiers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Payload of a BlockNotify frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNotification {
    /// Group the block belongs to.
    pub group: String,
    /// Node that produced the notification.
    #[serde(default)]
    pub node_name: String,
    /// New block height.
    pub block_number: i64,
}

/// Called with `(group, block_number)` when a group's height increases.
pub type BlockNotifier = Arc<dyn Fn(&str, i64) + Send + Sync>;

/// Highest block number per group.
#[derive(Default)]
pub struct BlockNumbers {
    numbers: RwLock<HashMap<String, i64>>,
    notifiers: RwLock<HashMap<String, Vec<BlockNotifier>>>,
}

impl BlockNumbers {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `number` for `group` if it is higher than what is known.
    /// Returns whether it was, in which case the group's notifiers ran.
    pub fn update(&self, group: &str, number: i64) -> bool {
        {
            let mut numbers = self.numbers.write();
            match numbers.get_mut(group) {
                Some(current) if *current >= number => return false,
                Some(current) => *current = number,
                None => {
                    let _ = numbers.insert(group.to_owned(), number);
                }
            }
        }
        let notifiers: Vec<BlockNotifier> = self
            .notifiers
            .read()
            .get(group)
            .cloned()
            .unwrap_or_default();
        for notifier in notifiers {
            notifier(group, number);
        }
        true
    }

    /// Apply a handshake's `groupBlockNumber` list.
    pub fn seed(&self, entries: &[HashMap<String, i64>]) {
        for entry in entries {
            for (group, number) in entry {
                let _ = self.update(group, *number);
            }
        }
    }

    /// Highest number seen for `group`.
    pub fn get(&self, group: &str) -> Option<i64> {
        self.numbers.read().get(group).copied()
    }

    /// Run `notifier` on every increase for `group`.
    pub fn register(&self, group: impl Into<String>, notifier: BlockNotifier) {
        self.notifiers
            .write()
            .entry(group.into())
            .or_default()
            .push(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn notification_json_shape() {
        let n: BlockNotification =
            serde_json::from_str(r#"{"group":"group0","nodeName":"n1","blockNumber":42}"#).unwrap();
        assert_eq!(n.group, "group0");
        assert_eq!(n.node_name, "n1");
        assert_eq!(n.block_number, 42);

        let n: BlockNotification = serde_json::from_str(r#"{"group":"g","blockNumber":1}"#).unwrap();
        assert!(n.node_name.is_empty());
        assert!(serde_json::from_str::<BlockNotification>(r#"{"group":"g"}"#).is_err());
    }

    #[test]
    fn update_is_monotonic() {
        let blocks = BlockNumbers::new();
        assert_eq!(blocks.get("group0"), None);
        assert!(blocks.update("group0", 5));
        assert!(!blocks.update("group0", 5));
        assert!(!blocks.update("group0", 3));
        assert!(blocks.update("group0", 9));
        assert_eq!(blocks.get("group0"), Some(9));
    }

    #[test]
    fn notifiers_fire_on_increase_only() {
        let blocks = BlockNumbers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        blocks.register(
            "group0",
            Arc::new(move |group: &str, n: i64| sink.lock().push((group.to_owned(), n))),
        );

        let _ = blocks.update("group0", 1);
        let _ = blocks.update("group0", 1);
        let _ = blocks.update("group1", 7);
        let _ = blocks.update("group0", 2);
        assert_eq!(
            *seen.lock(),
            vec![("group0".to_owned(), 1), ("group0".to_owned(), 2)]
        );
    }

    #[test]
    fn seed_takes_highest() {
        let blocks = BlockNumbers::new();
        let entries = vec![
            HashMap::from([("group0".to_owned(), 10)]),
            HashMap::from([("group0".to_owned(), 4), ("group1".to_owned(), 2)]),
        ];
        blocks.seed(&entries);
        assert_eq!(blocks.get("group0"), Some(10));
        assert_eq!(blocks.get("group1"), Some(2));
    }
}
