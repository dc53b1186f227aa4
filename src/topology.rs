//! Stream layout: key derivation and consumer-group topology.
//!
//! Three streams carry a bus. The anycast stream has a single group shared by
//! every instance, which turns it into a competitive work queue. The
//! broadcast stream carries one group per instance, so each instance sees
//! each record once. The unicast stream is per-instance and doubles as the
//! liveness witness for broadcast-group collection: its TTL is renewed only
//! by its owner, so its disappearance marks the owner dead.

/// Root segment of every bus key.
const KEY_ROOT: &str = "eventbus";

/// Name of the group shared by all instances on the anycast stream.
const SHARED_GROUP_SUFFIX: &str = "group";

/// The three streams an instance participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Anycast,
    Broadcast,
    Unicast,
}

impl StreamKind {
    /// All kinds, in the order readers are started.
    pub const ALL: [StreamKind; 3] = [StreamKind::Anycast, StreamKind::Broadcast, StreamKind::Unicast];

    /// XREADGROUP COUNT for this stream.
    ///
    /// Anycast reads one record at a time so a slow consumer cannot hoard a
    /// batch and starve faster peers. Unicast has a single consumer, so
    /// throughput wins.
    pub fn batch_size(&self) -> usize {
        match self {
            StreamKind::Anycast => 1,
            StreamKind::Broadcast => 1,
            StreamKind::Unicast => 10,
        }
    }
}

/// Key and group derivation for one instance's view of a bus.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    prefix: String,
    instance: String,
}

impl StreamLayout {
    /// Build the layout for a bus `name` as seen by `instance`.
    pub fn new(name: &str, instance: &str) -> Self {
        Self {
            prefix: format!("{}:{}:", KEY_ROOT, name),
            instance: instance.to_string(),
        }
    }

    /// This instance's id, also its consumer name in every group.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The shared competitive-consumption stream.
    pub fn anycast_stream(&self) -> String {
        format!("{}anycast", self.prefix)
    }

    /// The shared fan-out stream.
    pub fn broadcast_stream(&self) -> String {
        format!("{}broadcast", self.prefix)
    }

    /// This instance's private inbox.
    pub fn unicast_stream(&self) -> String {
        self.unicast_stream_for(&self.instance)
    }

    /// The inbox of an arbitrary instance; publishers address it by id.
    pub fn unicast_stream_for(&self, instance: &str) -> String {
        format!("{}unicast:{}", self.prefix, instance)
    }

    /// The single group all instances join on the anycast stream.
    pub fn shared_group(&self) -> String {
        format!("{}{}", self.prefix, SHARED_GROUP_SUFFIX)
    }

    /// This instance's own group, used on both broadcast and unicast streams.
    pub fn instance_group(&self) -> String {
        format!("{}{}", self.prefix, self.instance)
    }

    /// Stream key for a kind, from this instance's perspective.
    pub fn stream(&self, kind: StreamKind) -> String {
        match kind {
            StreamKind::Anycast => self.anycast_stream(),
            StreamKind::Broadcast => self.broadcast_stream(),
            StreamKind::Unicast => self.unicast_stream(),
        }
    }

    /// Consumer group for a kind, from this instance's perspective.
    pub fn group(&self, kind: StreamKind) -> String {
        match kind {
            StreamKind::Anycast => self.shared_group(),
            StreamKind::Broadcast | StreamKind::Unicast => self.instance_group(),
        }
    }

    /// Extract the owning instance id from a per-instance group name.
    ///
    /// Returns `None` for group names outside this bus's namespace and for
    /// the shared anycast group.
    pub fn group_instance<'a>(&self, group: &'a str) -> Option<&'a str> {
        group
            .strip_prefix(&self.prefix)
            .filter(|suffix| !suffix.is_empty() && *suffix != SHARED_GROUP_SUFFIX)
    }
}
