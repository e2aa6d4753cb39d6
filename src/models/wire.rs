//! On-disk encoding of metadata records.
//!
//! Records are msgpack maps keyed by a one-byte field tag. Object fields:
//! 1 content-md5 (16 raw bytes), 2 size, 3 cache-control, 4 last-modified,
//! 5 content-type, 6 version-id, 7 user-defined map. Bucket fields:
//! 1 creation-date. Timestamps use the msgpack timestamp extension
//! (type -1, 4/8/12-byte forms).

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Read;
use thiserror::Error;

use crate::models::metadata::{BucketMetadata, ObjectMetadata};

const BUCKET_CREATION: u8 = 1;

const OBJECT_CONTENT_MD5: u8 = 1;
const OBJECT_SIZE: u8 = 2;
const OBJECT_CACHE_CONTROL: u8 = 3;
const OBJECT_LAST_MODIFIED: u8 = 4;
const OBJECT_CONTENT_TYPE: u8 = 5;
const OBJECT_VERSION_ID: u8 = 6;
const OBJECT_USER_DEFINED: u8 = 7;

const TIMESTAMP_EXT: i8 = -1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("content-md5 is not hex: {0}")]
    Md5(#[from] hex::FromHexError),
    #[error("string field is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unexpected field tag {0}")]
    UnknownField(u8),
    #[error("timestamp extension has invalid length {0}")]
    TimestampLen(u32),
    #[error("unexpected extension type {0}")]
    ExtensionType(i8),
    #[error("timestamp out of range")]
    TimestampRange,
}

fn rd_err(err: impl std::fmt::Display) -> WireError {
    WireError::Malformed(err.to_string())
}

fn wr_err(err: impl std::fmt::Display) -> WireError {
    WireError::Encode(err.to_string())
}

pub fn encode_bucket(data: &BucketMetadata) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    rmp::encode::write_map_len(&mut buf, 1).map_err(wr_err)?;
    rmp::encode::write_uint(&mut buf, u64::from(BUCKET_CREATION)).map_err(wr_err)?;
    write_time(&mut buf, data.creation_date)?;
    Ok(buf)
}

pub fn decode_bucket(bytes: &[u8]) -> Result<BucketMetadata, WireError> {
    let mut rd = bytes;
    let mut creation_date = DateTime::UNIX_EPOCH;
    let fields = rmp::decode::read_map_len(&mut rd).map_err(rd_err)?;
    for _ in 0..fields {
        let tag: u8 = rmp::decode::read_int(&mut rd).map_err(rd_err)?;
        match tag {
            BUCKET_CREATION => creation_date = read_time(&mut rd)?,
            other => return Err(WireError::UnknownField(other)),
        }
    }
    Ok(BucketMetadata { creation_date })
}

pub fn encode_object(data: &ObjectMetadata) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    rmp::encode::write_map_len(&mut buf, 7).map_err(wr_err)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_CONTENT_MD5)).map_err(wr_err)?;
    let md5 = hex::decode(&data.content_md5)?;
    rmp::encode::write_bin(&mut buf, &md5).map_err(wr_err)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_SIZE)).map_err(wr_err)?;
    rmp::encode::write_sint(&mut buf, data.size).map_err(wr_err)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_CACHE_CONTROL)).map_err(wr_err)?;
    rmp::encode::write_str(&mut buf, &data.cache_control).map_err(wr_err)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_LAST_MODIFIED)).map_err(wr_err)?;
    write_time(&mut buf, data.last_modified)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_CONTENT_TYPE)).map_err(wr_err)?;
    rmp::encode::write_str(&mut buf, &data.content_type).map_err(wr_err)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_VERSION_ID)).map_err(wr_err)?;
    rmp::encode::write_str(&mut buf, &data.version_id).map_err(wr_err)?;

    rmp::encode::write_uint(&mut buf, u64::from(OBJECT_USER_DEFINED)).map_err(wr_err)?;
    rmp::encode::write_map_len(&mut buf, data.user_defined.len() as u32).map_err(wr_err)?;
    for (key, value) in &data.user_defined {
        rmp::encode::write_str(&mut buf, key).map_err(wr_err)?;
        rmp::encode::write_str(&mut buf, value).map_err(wr_err)?;
    }

    Ok(buf)
}

pub fn decode_object(bytes: &[u8]) -> Result<ObjectMetadata, WireError> {
    let mut rd = bytes;
    let mut data = ObjectMetadata::default();
    let fields = rmp::decode::read_map_len(&mut rd).map_err(rd_err)?;
    for _ in 0..fields {
        let tag: u8 = rmp::decode::read_int(&mut rd).map_err(rd_err)?;
        match tag {
            OBJECT_CONTENT_MD5 => {
                let len = rmp::decode::read_bin_len(&mut rd).map_err(rd_err)?;
                data.content_md5 = hex::encode(read_exact(&mut rd, len)?);
            }
            OBJECT_SIZE => data.size = rmp::decode::read_int(&mut rd).map_err(rd_err)?,
            OBJECT_CACHE_CONTROL => data.cache_control = read_string(&mut rd)?,
            OBJECT_LAST_MODIFIED => data.last_modified = read_time(&mut rd)?,
            OBJECT_CONTENT_TYPE => data.content_type = read_string(&mut rd)?,
            OBJECT_VERSION_ID => data.version_id = read_string(&mut rd)?,
            OBJECT_USER_DEFINED => data.user_defined = read_string_map(&mut rd)?,
            other => return Err(WireError::UnknownField(other)),
        }
    }
    Ok(data)
}

fn read_string(rd: &mut &[u8]) -> Result<String, WireError> {
    let len = rmp::decode::read_str_len(rd).map_err(rd_err)?;
    Ok(String::from_utf8(read_exact(rd, len)?)?)
}

fn read_string_map(rd: &mut &[u8]) -> Result<BTreeMap<String, String>, WireError> {
    let len = rmp::decode::read_map_len(rd).map_err(rd_err)?;
    let mut map = BTreeMap::new();
    for _ in 0..len {
        let key = read_string(rd)?;
        let value = read_string(rd)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_exact(rd: &mut &[u8], len: u32) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0u8; len as usize];
    rd.read_exact(&mut buf)?;
    Ok(buf)
}

/// Append a msgpack timestamp extension, choosing the shortest of the
/// 4-, 8- and 12-byte forms that can hold the value.
fn write_time(buf: &mut Vec<u8>, time: DateTime<Utc>) -> Result<(), WireError> {
    let sec = time.timestamp() as u64;
    let nsec = time.timestamp_subsec_nanos();

    if sec >> 34 == 0 {
        if nsec == 0 {
            rmp::encode::write_ext_meta(buf, 4, TIMESTAMP_EXT).map_err(wr_err)?;
            buf.extend_from_slice(&(sec as u32).to_be_bytes());
        } else {
            rmp::encode::write_ext_meta(buf, 8, TIMESTAMP_EXT).map_err(wr_err)?;
            buf.extend_from_slice(&((u64::from(nsec) << 34) | sec).to_be_bytes());
        }
    } else {
        rmp::encode::write_ext_meta(buf, 12, TIMESTAMP_EXT).map_err(wr_err)?;
        buf.extend_from_slice(&nsec.to_be_bytes());
        buf.extend_from_slice(&sec.to_be_bytes());
    }
    Ok(())
}

fn read_time(rd: &mut &[u8]) -> Result<DateTime<Utc>, WireError> {
    let meta = rmp::decode::read_ext_meta(rd).map_err(rd_err)?;
    if meta.typeid != TIMESTAMP_EXT {
        return Err(WireError::ExtensionType(meta.typeid));
    }
    let payload = read_exact(rd, meta.size)?;
    let (sec, nsec) = match payload.len() {
        4 => (u64::from(u32::from_be_bytes(payload[..4].try_into().unwrap())), 0),
        8 => {
            let packed = u64::from_be_bytes(payload[..8].try_into().unwrap());
            (packed & 0x0000_0003_ffff_ffff, (packed >> 34) as u32)
        }
        12 => (
            u64::from_be_bytes(payload[4..12].try_into().unwrap()),
            u32::from_be_bytes(payload[..4].try_into().unwrap()),
        ),
        other => return Err(WireError::TimestampLen(other as u32)),
    };
    DateTime::from_timestamp(sec as i64, nsec).ok_or(WireError::TimestampRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_object() -> ObjectMetadata {
        ObjectMetadata {
            content_md5: "73feffa4b7f6bb68e44cf984c85f6e88".into(),
            size: 3,
            cache_control: "max-age=300".into(),
            last_modified: Utc.with_ymd_and_hms(2014, 5, 6, 3, 2, 1).unwrap(),
            content_type: "plain/text".into(),
            version_id: "v1".into(),
            user_defined: BTreeMap::from([
                ("author".to_string(), "alice".to_string()),
                ("tier".to_string(), "gold".to_string()),
            ]),
        }
    }

    #[test]
    fn object_round_trip() {
        let data = sample_object();
        let decoded = decode_object(&encode_object(&data).unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn object_round_trip_with_empty_user_defined() {
        let data = ObjectMetadata {
            user_defined: BTreeMap::new(),
            ..sample_object()
        };
        let decoded = decode_object(&encode_object(&data).unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn bucket_round_trip() {
        let data = BucketMetadata {
            creation_date: Utc.with_ymd_and_hms(2015, 6, 7, 4, 3, 2).unwrap(),
        };
        let decoded = decode_bucket(&encode_bucket(&data).unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn object_layout_is_tagged_map() {
        let encoded = encode_object(&sample_object()).unwrap();
        // fixmap(7), positive fixint tag 1, bin8 of 16 md5 bytes
        assert_eq!(encoded[0], 0x87);
        assert_eq!(encoded[1], 0x01);
        assert_eq!(encoded[2], 0xc4);
        assert_eq!(encoded[3], 16);
        assert_eq!(&encoded[4..6], &[0x73, 0xfe]);
    }

    #[test]
    fn whole_second_timestamps_use_four_bytes() {
        let mut buf = Vec::new();
        let time = Utc.with_ymd_and_hms(2014, 5, 6, 3, 2, 1).unwrap();
        write_time(&mut buf, time).unwrap();
        // fixext4, type -1
        assert_eq!(buf[0], 0xd6);
        assert_eq!(buf[1] as i8, -1);
        assert_eq!(buf.len(), 6);
        assert_eq!(read_time(&mut buf.as_slice()).unwrap(), time);
    }

    #[test]
    fn subsecond_timestamps_use_eight_bytes() {
        let mut buf = Vec::new();
        let time = Utc.timestamp_opt(1_400_000_000, 123_456_789).unwrap();
        write_time(&mut buf, time).unwrap();
        assert_eq!(buf[0], 0xd7);
        assert_eq!(buf[1] as i8, -1);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_time(&mut buf.as_slice()).unwrap(), time);
    }

    #[test]
    fn far_future_timestamps_use_twelve_bytes() {
        let mut buf = Vec::new();
        // Past 2^34 seconds since the epoch, out of the 8-byte form's range.
        let time = Utc.timestamp_opt(1 << 35, 7).unwrap();
        write_time(&mut buf, time).unwrap();
        assert_eq!(read_time(&mut buf.as_slice()).unwrap(), time);
        assert_eq!(buf.len(), 15);
    }

    #[test]
    fn unknown_field_tags_are_rejected() {
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_uint(&mut buf, 9).unwrap();
        rmp::encode::write_str(&mut buf, "?").unwrap();
        assert!(matches!(
            decode_object(&buf),
            Err(WireError::UnknownField(9))
        ));
    }
}
