use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

/// Channel every connection is placed into on accept.
pub const DEFAULT_CHANNEL: &str = "none";

/// Stable handle for a live connection; never reused within a server run.
pub type ConnId = u64;

/// Pre-encoded frames queued for a connection's writer task.
pub type Outbound = mpsc::UnboundedSender<Vec<u8>>;

struct Member {
    channel: String,
    outbound: Outbound,
}

/// In-memory map of live connections and their channel membership.
///
/// Invariant: every registered connection appears in the member set of
/// exactly one channel. Channels are created lazily on first join and are
/// never destroyed; an empty channel simply persists.
pub struct Registry {
    members: HashMap<ConnId, Member>,
    channels: HashMap<String, HashSet<ConnId>>,
    next_id: ConnId,
}

impl Registry {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(DEFAULT_CHANNEL.to_string(), HashSet::new());
        Self {
            members: HashMap::new(),
            channels,
            next_id: 1,
        }
    }

    /// Registers a freshly accepted connection in the default channel and
    /// returns its handle.
    pub fn insert(&mut self, outbound: Outbound) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        self.members.insert(
            id,
            Member {
                channel: DEFAULT_CHANNEL.to_string(),
                outbound,
            },
        );
        self.channels
            .entry(DEFAULT_CHANNEL.to_string())
            .or_default()
            .insert(id);
        id
    }

    pub fn channel_of(&self, id: ConnId) -> Option<&str> {
        self.members.get(&id).map(|member| member.channel.as_str())
    }

    /// All connections sharing `id`'s channel, `id` itself included.
    pub fn peers_of(&self, id: ConnId) -> Vec<ConnId> {
        let Some(channel) = self.channel_of(id) else {
            return Vec::new();
        };
        self.channels
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn sender(&self, id: ConnId) -> Option<&Outbound> {
        self.members.get(&id).map(|member| &member.outbound)
    }

    /// Moves a connection out of its current channel set and into
    /// `channel`'s, creating the target set if this is its first member.
    /// Unknown handles are ignored.
    pub fn move_to_channel(&mut self, id: ConnId, channel: &str) {
        let Some(member) = self.members.get_mut(&id) else {
            return;
        };
        if let Some(set) = self.channels.get_mut(&member.channel) {
            set.remove(&id);
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        member.channel = channel.to_string();
    }

    /// Drops the connection from its channel set and the registry. Returns
    /// whether the handle was registered. The outbound sender drops with the
    /// entry, which ends the connection's writer task.
    pub fn remove(&mut self, id: ConnId) -> bool {
        let Some(member) = self.members.remove(&id) else {
            return false;
        };
        if let Some(set) = self.channels.get_mut(&member.channel) {
            set.remove(&id);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
