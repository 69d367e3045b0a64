//! The set of channels an engine sends on.
//!
//! The pool does not own its channels. Watchdogs do, and a channel whose
//! owner dropped it silently leaves the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::channel::{Channel, ChannelId};
use crate::config::Routing;

pub(crate) struct ChannelPool {
    routing: Routing,
    channels: RwLock<Vec<(ChannelId, Weak<dyn Channel>)>>,
    cursor: AtomicUsize,
}

impl ChannelPool {
    pub(crate) fn new(routing: Routing) -> Self {
        Self {
            routing,
            channels: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Add a channel. A single-routed pool replaces its channel instead.
    pub(crate) fn attach(&self, channel: Arc<dyn Channel>) {
        let member = (channel.id(), Arc::downgrade(&channel));
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        match self.routing {
            Routing::Single => *channels = vec![member],
            Routing::Pool => {
                channels.retain(|(_, c)| c.strong_count() > 0);
                if !channels.iter().any(|(id, _)| *id == member.0) {
                    channels.push(member);
                }
            }
        }
    }

    pub(crate) fn detach(&self, id: ChannelId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let before = channels.len();
        channels.retain(|(member, _)| *member != id);
        channels.len() != before
    }

    /// Current members. The lock is released before anything is sent.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(_, c)| c.upgrade())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, c)| c.strong_count() > 0)
            .count()
    }

    /// Round-robin pick among `members`.
    pub(crate) fn pick<'a>(&self, members: &'a [Arc<dyn Channel>]) -> Option<&'a Arc<dyn Channel>> {
        if members.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
        members.get(index)
    }
}
