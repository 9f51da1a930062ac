//! Key construction and order-preserving encodings
//!
//! The whole data model lives in one flat, lexicographically-ordered
//! keyspace. Layout, with `NS` = namespace, `D` = db id (3 bytes big-endian),
//! `ID` = object uuid:
//!
//! ```text
//! NS:D:M:<user key>                  object meta (+ inline payload)
//! NS:D:D:ID:<member|field>           element-level data
//! NS:D:S:ID:<score8>:<member>        zset score index
//! $sys:0:at:NNNN:<ts8>:<meta key>    sharded expire index (NNNN = crc32 % 256)
//! $sys:0:at:<ts8>:<meta key>         legacy unsharded expire index
//! $sys:0:EXL:EXLeader                reaper leader lease
//! ```
//!
//! Timestamps and scores are encoded so that `memcmp` order equals numeric
//! order, which is what makes the expire index and the score index scannable
//! as ranges.

use crate::error::DbError;

/// Number of expire-index shards.
pub const EXPIRE_SHARD_COUNT: u32 = 256;

/// `$sys:0:at:` — legacy unsharded expire-index prefix.
pub const EXPIRE_KEY_PREFIX: &[u8] = b"$sys:0:at:";
/// `$sys:0:at` — sharded prefixes append `NNNN:` to this.
pub const EXPIRE_HASH_KEY_PREFIX: &[u8] = b"$sys:0:at";
/// Reaper leader lease record.
pub const SYS_EXPIRE_LEADER: &[u8] = b"$sys:0:EXL:EXLeader";

/// Offset of the timestamp inside a legacy expire-index key.
pub const EXPIRE_TIMESTAMP_OFFSET: usize = EXPIRE_KEY_PREFIX.len();
/// Offset of the embedded meta key inside a legacy expire-index key.
pub const EXPIRE_METAKEY_OFFSET: usize = EXPIRE_TIMESTAMP_OFFSET + 8 + 1;

/// A database id inside a namespace (Redis `SELECT`, 0..=15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbId(pub u32);

impl DbId {
    /// 3-byte big-endian encoding (low 24 bits).
    pub fn bytes(self) -> [u8; 3] {
        let b = self.0.to_be_bytes();
        [b[1], b[2], b[3]]
    }

    pub fn from_bytes(b: &[u8]) -> DbId {
        DbId(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }
}

/// Build a meta key: `NS:D:M:<user key>`.
pub fn meta_key(namespace: &str, db_id: DbId, key: &[u8]) -> Vec<u8> {
    let mut mkey = Vec::with_capacity(namespace.len() + 8 + key.len());
    mkey.extend_from_slice(namespace.as_bytes());
    mkey.push(b':');
    mkey.extend_from_slice(&db_id.bytes());
    mkey.extend_from_slice(b":M:");
    mkey.extend_from_slice(key);
    mkey
}

/// Build a data-key prefix: `NS:D:D:<id>`.
pub fn data_key(namespace: &str, db_id: DbId, id: &[u8]) -> Vec<u8> {
    let mut dkey = Vec::with_capacity(namespace.len() + 8 + id.len());
    dkey.extend_from_slice(namespace.as_bytes());
    dkey.push(b':');
    dkey.extend_from_slice(&db_id.bytes());
    dkey.extend_from_slice(b":D:");
    dkey.extend_from_slice(id);
    dkey
}

/// Build a score-index prefix: `NS:D:S:<id>`.
pub fn score_prefix(namespace: &str, db_id: DbId, id: &[u8]) -> Vec<u8> {
    let mut skey = Vec::with_capacity(namespace.len() + 8 + id.len());
    skey.extend_from_slice(namespace.as_bytes());
    skey.push(b':');
    skey.extend_from_slice(&db_id.bytes());
    skey.extend_from_slice(b":S:");
    skey.extend_from_slice(id);
    skey
}

/// `<dkey>:<member>` — one element subkey.
pub fn element_key(dkey: &[u8], member: &[u8]) -> Vec<u8> {
    let mut ekey = Vec::with_capacity(dkey.len() + 1 + member.len());
    ekey.extend_from_slice(dkey);
    ekey.push(b':');
    ekey.extend_from_slice(member);
    ekey
}

/// `<score prefix>:<score8>:<member>` — one score-index subkey.
pub fn score_key(sprefix: &[u8], score: &[u8; 8], member: &[u8]) -> Vec<u8> {
    let mut skey = Vec::with_capacity(sprefix.len() + 10 + member.len());
    skey.extend_from_slice(sprefix);
    skey.push(b':');
    skey.extend_from_slice(score);
    skey.push(b':');
    skey.extend_from_slice(member);
    skey
}

/// Split a meta key into (namespace, db id, user key).
///
/// Only the first colon separates the namespace; the user key may itself
/// contain colons and is never re-split.
pub fn split_meta_key(mkey: &[u8]) -> Result<(&[u8], DbId, &[u8]), DbError> {
    let idx = mkey
        .iter()
        .position(|&b| b == b':')
        .ok_or(DbError::InvalidLength)?;
    if mkey.len() < idx + 6 {
        return Err(DbError::InvalidLength);
    }
    let namespace = &mkey[..idx];
    let db_id = DbId::from_bytes(&mkey[idx + 1..idx + 4]);
    let key = &mkey[idx + 6..];
    Ok((namespace, db_id, key))
}

/// Expire-index shard for a meta key, `[0, EXPIRE_SHARD_COUNT)`.
pub fn expire_shard(mkey: &[u8]) -> u32 {
    crc32fast::hash(mkey) % EXPIRE_SHARD_COUNT
}

/// Sharded expire-index prefix: `$sys:0:at:NNNN:`.
pub fn expire_shard_prefix(shard: u32) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(EXPIRE_HASH_KEY_PREFIX.len() + 6);
    prefix.extend_from_slice(EXPIRE_HASH_KEY_PREFIX);
    prefix.extend_from_slice(format!(":{shard:04}:").as_bytes());
    prefix
}

/// `$sys:0:at:NNNN:<ts8>:<meta key>` — the expire-index entry for `mkey`.
pub fn expire_key(mkey: &[u8], ts: i64) -> Vec<u8> {
    let mut ekey = expire_shard_prefix(expire_shard(mkey));
    ekey.extend_from_slice(&encode_i64(ts));
    ekey.push(b':');
    ekey.extend_from_slice(mkey);
    ekey
}

/// Order-preserving i64 encoding: flip the sign bit, store big-endian.
/// Byte order then equals numeric order across negative and positive values.
pub fn encode_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_i64(b: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

/// Order-preserving f64 encoding.
///
/// Non-negative values get the sign bit flipped; negative values get all 64
/// bits flipped. Stored big-endian, this yields
/// `-inf < negatives < -0 = +0 is ordered < positives < +inf` under memcmp.
/// NaN must be rejected before reaching this function.
pub fn encode_f64(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let encoded = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    encoded.to_be_bytes()
}

pub fn decode_f64(b: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    let encoded = u64::from_be_bytes(buf);
    let bits = if encoded & (1 << 63) != 0 {
        encoded ^ (1 << 63)
    } else {
        !encoded
    };
    f64::from_bits(bits)
}

/// Shortest decimal representation that round-trips, Redis reply style.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{score}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_key_roundtrip() {
        let mkey = meta_key("tenant", DbId(3), b"user:key:with:colons");
        let (ns, id, key) = split_meta_key(&mkey).unwrap();
        assert_eq!(ns, b"tenant");
        assert_eq!(id, DbId(3));
        assert_eq!(key, b"user:key:with:colons");
    }

    #[test]
    fn test_split_meta_key_truncated() {
        assert!(split_meta_key(b"short").is_err());
        assert!(split_meta_key(b"ns:ab").is_err());
    }

    #[test]
    fn test_i64_order() {
        let samples = [i64::MIN, -1_000_000, -1, 0, 1, 42, i64::MAX];
        for window in samples.windows(2) {
            assert!(encode_i64(window[0]) < encode_i64(window[1]));
        }
        for v in samples {
            assert_eq!(decode_i64(&encode_i64(v)), v);
        }
    }

    #[test]
    fn test_f64_order() {
        let samples = [
            f64::NEG_INFINITY,
            f64::MIN,
            -1.5,
            -f64::MIN_POSITIVE,
            -0.0,
            0.0,
            f64::MIN_POSITIVE,
            1.0,
            1.5,
            f64::MAX,
            f64::INFINITY,
        ];
        for window in samples.windows(2) {
            let a = encode_f64(window[0]);
            let b = encode_f64(window[1]);
            // -0.0 sorts immediately before +0.0, nothing in between
            assert!(a < b, "{} !< {}", window[0], window[1]);
        }
    }

    #[test]
    fn test_f64_roundtrip() {
        for v in [
            0.0,
            -0.0,
            1.0,
            -1.0,
            3.14159,
            -2.5e300,
            f64::MIN_POSITIVE,
            f64::INFINITY,
            f64::NEG_INFINITY,
        ] {
            let decoded = decode_f64(&encode_f64(v));
            assert_eq!(decoded.to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_expire_key_shape() {
        let mkey = meta_key("ns", DbId(0), b"k");
        let ekey = expire_key(&mkey, 12345);
        let shard = expire_shard(&mkey);
        let prefix = expire_shard_prefix(shard);
        assert!(ekey.starts_with(&prefix));
        let ts = decode_i64(&ekey[prefix.len()..prefix.len() + 8]);
        assert_eq!(ts, 12345);
        assert_eq!(&ekey[prefix.len() + 9..], mkey.as_slice());
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(1.0), "1");
        assert_eq!(format_score(2.5), "2.5");
        assert_eq!(format_score(f64::INFINITY), "inf");
        assert_eq!(format_score(f64::NEG_INFINITY), "-inf");
    }
}
