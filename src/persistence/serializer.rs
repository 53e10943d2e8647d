//! Wire formats for client queue entry keys and values.
//!
//! Entry keys concatenate the queue id bytes, a one-byte shared flag, and a
//! monotone 64-bit entry index in big-endian order, so that all entries of
//! one queue form a contiguous, index-sorted range in the store. Entry values
//! are tagged records; the packet identifier sits at a fixed offset so it can
//! be rewritten without re-serializing the rest of the record.

use crate::message::{MessageWithId, PubRel, Publish, Qos, NO_PACKET_ID};
use crate::persistence::{PersistenceError, QueueKey};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// First entry index assigned by a fresh store. Starting halfway through the
/// index space leaves room on either side for future schemes.
pub const FIRST_ENTRY_INDEX: u64 = i64::MAX as u64 / 2;

const SHARED_FLAG: u8 = 0x01;
const NOT_SHARED_FLAG: u8 = 0x00;
const KEY_SUFFIX_LEN: usize = 1 + 8;

const PUBLISH_TAG: u8 = 0x01;
const PUBREL_TAG: u8 = 0x02;
const PACKET_ID_OFFSET: usize = 1;
const PUBLISH_BASE_LEN: usize = 36;

/// Result of comparing a scan position against a queue key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// The queue id bytes match but the key belongs to a different queue
    /// (shared flag differs, or the id continues). Step over it.
    SamePrefix,
    /// The key belongs to the reference queue.
    Match,
    /// The key is past the reference queue's range.
    NoMatch,
}

/// Stateful codec for entry keys and values. Owns the monotone entry index
/// counter; the bootstrap scan restores its watermark after a restart.
pub struct ClientQueueSerializer {
    /// Last assigned entry index.
    entry_index: AtomicU64,
}

impl Default for ClientQueueSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientQueueSerializer {
    pub fn new() -> Self {
        Self {
            entry_index: AtomicU64::new(FIRST_ENTRY_INDEX),
        }
    }

    /// Raise the index watermark to the maximum observed on disk. New entries
    /// are always assigned indices above the watermark.
    pub fn restore_entry_index(&self, max_observed: u64) {
        self.entry_index.fetch_max(max_observed, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn entry_index_watermark(&self) -> u64 {
        self.entry_index.load(Ordering::SeqCst)
    }

    fn allocate_index(&self) -> u64 {
        self.entry_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn flag_byte(shared: bool) -> u8 {
        if shared {
            SHARED_FLAG
        } else {
            NOT_SHARED_FLAG
        }
    }

    /// Queue key prefix: the starting point for a range scan over one queue.
    pub fn serialize_queue_key(&self, key: &QueueKey) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(key.queue_id.len() + 1);
        buf.put_slice(key.queue_id.as_bytes());
        buf.put_u8(Self::flag_byte(key.shared));
        buf.to_vec()
    }

    /// Entry key for a newly queued publish, with a freshly allocated index.
    pub fn serialize_new_publish_key(&self, key: &QueueKey) -> Vec<u8> {
        self.serialize_entry_key(key, self.allocate_index())
    }

    /// Entry key for a release marker whose packet id was not found in the
    /// queue. Appended at the tail like a new publish.
    pub fn serialize_unknown_pubrel_key(&self, key: &QueueKey) -> Vec<u8> {
        self.serialize_entry_key(key, self.allocate_index())
    }

    fn serialize_entry_key(&self, key: &QueueKey, index: u64) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(key.queue_id.len() + KEY_SUFFIX_LEN);
        buf.put_slice(key.queue_id.as_bytes());
        buf.put_u8(Self::flag_byte(key.shared));
        buf.put_u64(index);
        buf.to_vec()
    }

    pub fn deserialize_queue_key(&self, bytes: &[u8]) -> Result<QueueKey, PersistenceError> {
        if bytes.len() <= KEY_SUFFIX_LEN {
            return Err(PersistenceError::CorruptKey("entry key too short"));
        }
        let id_end = bytes.len() - KEY_SUFFIX_LEN;
        let queue_id = std::str::from_utf8(&bytes[..id_end])
            .map_err(|_| PersistenceError::CorruptKey("queue id is not valid utf-8"))?;
        Ok(QueueKey {
            queue_id: queue_id.to_string(),
            shared: bytes[id_end] == SHARED_FLAG,
        })
    }

    pub fn deserialize_index(&self, bytes: &[u8]) -> Result<u64, PersistenceError> {
        if bytes.len() <= KEY_SUFFIX_LEN {
            return Err(PersistenceError::CorruptKey("entry key too short"));
        }
        let mut suffix = &bytes[bytes.len() - 8..];
        Ok(suffix.get_u64())
    }

    /// Compare an entry key found by a range scan against a queue key prefix
    /// produced by `serialize_queue_key`. Because keys carry no length
    /// prefix, a scan can land on a queue whose id starts with the reference
    /// id, or on the other shared-flag namespace of the same id; both yield
    /// `SamePrefix` and must be stepped over.
    pub fn compare_client_id(&self, reference: &[u8], candidate: &[u8]) -> KeyMatch {
        let ref_id_len = reference.len() - 1;
        if candidate.len() < reference.len() + 8 {
            return KeyMatch::NoMatch;
        }
        if candidate[..ref_id_len] != reference[..ref_id_len] {
            return KeyMatch::NoMatch;
        }
        if candidate.len() > reference.len() + 8 {
            return KeyMatch::SamePrefix;
        }
        if candidate[ref_id_len] == reference[ref_id_len] {
            KeyMatch::Match
        } else {
            KeyMatch::SamePrefix
        }
    }

    /// Serialize a publish with the packet id slot set to `NO_PACKET_ID`.
    pub fn serialize_publish_without_packet_id(&self, publish: &Publish) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            PUBLISH_BASE_LEN + publish.topic.len() + publish.unique_id.len(),
        );
        buf.put_u8(PUBLISH_TAG);
        buf.put_u16(NO_PACKET_ID);
        buf.put_u64(publish.payload_id);
        buf.put_u32(publish.payload_size);
        buf.put_u8(publish.qos.as_number());
        buf.put_u64(publish.timestamp);
        buf.put_u64(publish.message_expiry_interval);
        buf.put_u16(publish.topic.len() as u16);
        buf.put_slice(publish.topic.as_bytes());
        buf.put_u16(publish.unique_id.len() as u16);
        buf.put_slice(publish.unique_id.as_bytes());
        buf.to_vec()
    }

    /// Re-emit an existing serialized entry with only the packet id slot
    /// overwritten.
    pub fn serialize_and_set_packet_id(
        &self,
        value: &[u8],
        packet_id: u16,
    ) -> Result<Vec<u8>, PersistenceError> {
        if value.len() < PACKET_ID_OFFSET + 2 {
            return Err(PersistenceError::CorruptEntry("entry value too short"));
        }
        let mut patched = value.to_vec();
        patched[PACKET_ID_OFFSET..PACKET_ID_OFFSET + 2].copy_from_slice(&packet_id.to_be_bytes());
        Ok(patched)
    }

    pub fn serialize_pubrel(&self, pubrel: &PubRel) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(PUBREL_TAG);
        buf.put_u16(pubrel.packet_id);
        buf.to_vec()
    }

    /// Read only the packet id slot, shared by both entry kinds.
    pub fn deserialize_packet_id(&self, value: &[u8]) -> Result<u16, PersistenceError> {
        if value.len() < PACKET_ID_OFFSET + 2 {
            return Err(PersistenceError::CorruptEntry("entry value too short"));
        }
        let mut slot = &value[PACKET_ID_OFFSET..PACKET_ID_OFFSET + 2];
        Ok(slot.get_u16())
    }

    pub fn deserialize_value(&self, value: &[u8]) -> Result<MessageWithId, PersistenceError> {
        if value.is_empty() {
            return Err(PersistenceError::CorruptEntry("empty entry value"));
        }
        match value[0] {
            PUBLISH_TAG => self.deserialize_publish(value).map(MessageWithId::Publish),
            PUBREL_TAG => {
                let packet_id = self.deserialize_packet_id(value)?;
                Ok(MessageWithId::PubRel(PubRel { packet_id }))
            }
            _ => Err(PersistenceError::CorruptEntry("unknown entry tag")),
        }
    }

    fn deserialize_publish(&self, value: &[u8]) -> Result<Publish, PersistenceError> {
        if value.len() < PUBLISH_BASE_LEN {
            return Err(PersistenceError::CorruptEntry("publish entry too short"));
        }
        let mut buf = &value[1..];
        let packet_id = buf.get_u16();
        let payload_id = buf.get_u64();
        let payload_size = buf.get_u32();
        let qos = Qos::from_number(buf.get_u8())
            .ok_or(PersistenceError::CorruptEntry("invalid qos level"))?;
        let timestamp = buf.get_u64();
        let message_expiry_interval = buf.get_u64();
        let topic = read_string(&mut buf)?;
        let unique_id = read_string(&mut buf)?;
        Ok(Publish {
            payload_id,
            payload_size,
            topic,
            qos,
            message_expiry_interval,
            timestamp,
            unique_id,
            packet_id,
            duplicate_delivery: false,
        })
    }
}

fn read_string(buf: &mut &[u8]) -> Result<String, PersistenceError> {
    if buf.remaining() < 2 {
        return Err(PersistenceError::CorruptEntry("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(PersistenceError::CorruptEntry("truncated string"));
    }
    let raw = &buf[..len];
    let parsed = std::str::from_utf8(raw)
        .map_err(|_| PersistenceError::CorruptEntry("string is not valid utf-8"))?
        .to_string();
    buf.advance(len);
    Ok(parsed)
}
