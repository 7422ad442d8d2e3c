use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;

use timekeep_protocol::{ChangeNotice, EntityKind, PersistedEntry};

use super::{CacheChannel, Subscribers};
use crate::error::ChannelError;

/// In-process channel. Notices are delivered synchronously from `publish`.
#[derive(Default)]
pub struct MemoryChannel {
    entries: Mutex<HashMap<EntityKind, PersistedEntry>>,
    subscribers: Subscribers,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl CacheChannel for MemoryChannel {
    fn load(&self, kind: EntityKind) -> Result<PersistedEntry, ChannelError> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| PersistedEntry::empty(kind)))
    }

    fn publish(&self, notice: ChangeNotice) -> Result<(), ChannelError> {
        {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .entry(notice.kind)
                .or_insert_with(|| PersistedEntry::empty(notice.kind))
                .apply(&notice);
        }
        self.subscribers.broadcast(&notice);
        Ok(())
    }

    fn subscribe(&self) -> Receiver<ChangeNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.add(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use timekeep_protocol::NoticeReason;

    #[test]
    fn publish_persists_and_broadcasts() {
        let channel = MemoryChannel::new();
        let rx = channel.subscribe();
        let notice = ChangeNotice {
            kind: EntityKind::Tasks,
            origin: "a".to_string(),
            reason: NoticeReason::Fetched,
            snapshot: Some(vec![serde_json::json!({"id": "t1"})]),
            updated_at: Utc::now(),
        };

        channel.publish(notice.clone()).expect("publish");

        assert_eq!(rx.try_recv().expect("notice delivered"), notice);
        let entry = channel.load(EntityKind::Tasks).expect("load");
        assert_eq!(entry.snapshot.len(), 1);
        assert!(channel.load(EntityKind::Clients).expect("load").snapshot.is_empty());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let channel = MemoryChannel::new();
        drop(channel.subscribe());
        let _kept = channel.subscribe();
        channel
            .publish(ChangeNotice {
                kind: EntityKind::Tasks,
                origin: "a".to_string(),
                reason: NoticeReason::FetchStarted,
                snapshot: None,
                updated_at: Utc::now(),
            })
            .expect("publish");
        assert_eq!(channel.subscriber_count(), 1);
    }
}
