//! Cross-instance cache channel.
//!
//! Every UI instance persists its cache entries through a channel and listens
//! to it for peers' [`ChangeNotice`]s. The file channel is what ships; the
//! memory channel connects several registries inside one process (tests, and
//! hosts that run more than one window).

mod file;
mod memory;

pub use file::FileChannel;
pub use memory::MemoryChannel;

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use timekeep_protocol::{ChangeNotice, EntityKind, PersistedEntry};

use crate::error::ChannelError;

pub trait CacheChannel: Send + Sync {
    /// The persisted entry for `kind`; empty when nothing was stored yet.
    fn load(&self, kind: EntityKind) -> Result<PersistedEntry, ChannelError>;

    /// Folds `notice` into the persisted entry and broadcasts it to every
    /// subscriber, including those in the publishing process.
    fn publish(&self, notice: ChangeNotice) -> Result<(), ChannelError>;

    fn subscribe(&self) -> Receiver<ChangeNotice>;
}

/// Subscriber list shared by both backends. Dropped receivers are pruned on
/// the next broadcast.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Vec<Sender<ChangeNotice>>>,
}

impl Subscribers {
    pub(crate) fn add(&self, sender: Sender<ChangeNotice>) {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
    }

    pub(crate) fn broadcast(&self, notice: &ChangeNotice) {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|sender| sender.send(notice.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
