//! Object headers
//!
//! Every user key maps to one meta entry whose value starts with a fixed
//! 42-byte header followed by a type-specific payload:
//!
//! ```text
//! [type(1)][encoding(1)][created_at(8)][updated_at(8)][expire_at(8)][id(16)]
//! ```
//!
//! The id is a random uuid assigned when the object is created and stable for
//! the object's lifetime. Deleting and re-creating the same user key yields a
//! different id, which is what lets stale expire-index entries become no-ops.

use crate::error::DbError;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Encoded header length.
pub const OBJECT_HEADER_LEN: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    String = 0,
    List = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
}

impl ObjectType {
    fn from_u8(b: u8) -> Result<ObjectType, DbError> {
        match b {
            0 => Ok(ObjectType::String),
            1 => Ok(ObjectType::List),
            2 => Ok(ObjectType::Hash),
            3 => Ok(ObjectType::Set),
            4 => Ok(ObjectType::ZSet),
            _ => Err(DbError::InvalidLength),
        }
    }

    /// Name as reported by `TYPE`.
    pub fn name(self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Hash => "hash",
            ObjectType::Set => "set",
            ObjectType::ZSet => "zset",
        }
    }
}

/// Storage-encoding hint. Informative only; semantics never depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectEncoding {
    Raw = 0,
    HashTable = 1,
    SkipList = 2,
}

impl ObjectEncoding {
    fn from_u8(b: u8) -> Result<ObjectEncoding, DbError> {
        match b {
            0 => Ok(ObjectEncoding::Raw),
            1 => Ok(ObjectEncoding::HashTable),
            2 => Ok(ObjectEncoding::SkipList),
            _ => Err(DbError::InvalidLength),
        }
    }
}

/// Common object header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub id: [u8; 16],
    pub object_type: ObjectType,
    pub encoding: ObjectEncoding,
    pub created_at: i64,
    pub updated_at: i64,
    pub expire_at: i64,
}

impl Object {
    /// Fresh header for a newly-created object.
    pub fn new(object_type: ObjectType, encoding: ObjectEncoding) -> Object {
        let now = now_ns();
        Object {
            id: *Uuid::new_v4().as_bytes(),
            object_type,
            encoding,
            created_at: now,
            updated_at: now,
            expire_at: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OBJECT_HEADER_LEN);
        buf.push(self.object_type as u8);
        buf.push(self.encoding as u8);
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        buf.extend_from_slice(&self.updated_at.to_be_bytes());
        buf.extend_from_slice(&self.expire_at.to_be_bytes());
        buf.extend_from_slice(&self.id);
        buf
    }

    pub fn decode(b: &[u8]) -> Result<Object, DbError> {
        if b.len() < OBJECT_HEADER_LEN {
            return Err(DbError::InvalidLength);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&b[26..42]);
        Ok(Object {
            object_type: ObjectType::from_u8(b[0])?,
            encoding: ObjectEncoding::from_u8(b[1])?,
            created_at: i64::from_be_bytes(b[2..10].try_into().unwrap()),
            updated_at: i64::from_be_bytes(b[10..18].try_into().unwrap()),
            expire_at: i64::from_be_bytes(b[18..26].try_into().unwrap()),
            id,
        })
    }

    /// True when the object carries an expiry that has already passed.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_at != 0 && self.expire_at <= now
    }
}

/// Patch the expire-at field of an encoded meta value in place.
///
/// Used by key-level expiry commands so they can rewrite the header without
/// knowing the type-specific payload that follows it.
pub fn patch_expire_at(encoded: &mut [u8], expire_at: i64) -> Result<(), DbError> {
    if encoded.len() < OBJECT_HEADER_LEN {
        return Err(DbError::InvalidLength);
    }
    encoded[18..26].copy_from_slice(&expire_at.to_be_bytes());
    Ok(())
}

/// Current wall-clock time in nanoseconds since the UNIX epoch.
///
/// The same clock source is used for writing `expire_at` and for comparing
/// against it, so a clock step never deletes data that was written as
/// non-expired under the same clock.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
