//! Outbound message types held in client queues.

use crate::core::time;

/// Reserved packet identifier for entries that are queued but not in flight.
pub const NO_PACKET_ID: u16 = 0;

/// Fixed per-publish overhead used for in-memory size estimation, covering
/// the struct itself and the payload handle.
const PUBLISH_BASE_SIZE: u64 = 88;

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn as_number(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    pub fn from_number(qos: u8) -> Option<Self> {
        match qos {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

/// An outbound application message. The payload body lives in the external
/// payload store; the queue only carries its handle and size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Handle into the reference-counted payload store.
    pub payload_id: u64,
    /// Size of the referenced payload in bytes.
    pub payload_size: u32,
    pub topic: String,
    pub qos: Qos,
    /// Message expiry interval in seconds; `MESSAGE_EXPIRY_NOT_SET` for none.
    pub message_expiry_interval: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Broker-wide unique id, used to guard against stale acknowledgements.
    pub unique_id: String,
    /// `NO_PACKET_ID` until the message is handed out by `read_new`.
    pub packet_id: u16,
    /// Set when the message is re-delivered after a reconnect.
    pub duplicate_delivery: bool,
}

impl Publish {
    /// Approximate in-memory footprint, used for the QoS 0 byte budget and
    /// for per-read byte limits.
    pub fn estimated_size(&self) -> u64 {
        PUBLISH_BASE_SIZE
            + self.topic.len() as u64
            + self.unique_id.len() as u64
            + u64::from(self.payload_size)
    }

    pub fn has_expired_at(&self, now_millis: u64) -> bool {
        time::is_expired_at(self.timestamp, self.message_expiry_interval, now_millis)
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(time::unix_now_millis())
    }
}

/// Release marker replacing a QoS 2 publish once the receiver has
/// acknowledged receipt (PUBREC) but not yet release (PUBCOMP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
}

/// A queue entry: either a publish or the release marker that replaced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageWithId {
    Publish(Publish),
    PubRel(PubRel),
}

impl MessageWithId {
    pub fn packet_id(&self) -> u16 {
        match self {
            MessageWithId::Publish(publish) => publish.packet_id,
            MessageWithId::PubRel(pubrel) => pubrel.packet_id,
        }
    }

    pub fn as_publish(&self) -> Option<&Publish> {
        match self {
            MessageWithId::Publish(publish) => Some(publish),
            MessageWithId::PubRel(_) => None,
        }
    }
}
