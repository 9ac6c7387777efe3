//! Retry metadata header names and their wire encoding.
//!
//! The three headers below are the sole persisted state of a record's journey
//! through a retry chain. Numeric values are encoded as minimal
//! two's-complement big-endian byte arrays (the arbitrary-precision integer
//! wire form), so they round-trip byte-for-byte with existing deployments.

use crate::record::Record;

/// Attempt count so far. Absent means this is the first attempt.
pub const ATTEMPTS: &str = "retry_topic-attempts";

/// Epoch milliseconds of the first-ever attempt.
pub const ORIGINAL_TIMESTAMP: &str = "retry_topic-original-timestamp";

/// Earliest allowed redelivery time, epoch milliseconds.
pub const BACKOFF_TIMESTAMP: &str = "retry_topic-backoff-timestamp";

/// Encode a signed integer as minimal two's-complement big-endian bytes.
///
/// Leading bytes carrying no information are stripped: `0x00` runs ahead of a
/// clear sign bit, `0xFF` runs ahead of a set sign bit. Zero encodes as a
/// single `0x00` byte.
#[must_use]
pub fn encode_header_value(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let current = bytes[start];
        let next_is_negative = bytes[start + 1] & 0x80 != 0;
        let redundant =
            (current == 0x00 && !next_is_negative) || (current == 0xFF && next_is_negative);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Decode a minimal two's-complement big-endian byte array.
///
/// Inputs longer than eight bytes are truncated to their low 64 bits. Returns
/// `None` for an empty slice.
#[must_use]
pub fn decode_header_value(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }
    let negative = bytes[0] & 0x80 != 0;
    let fill = if negative && bytes.len() < 8 { 0xFF } else { 0x00 };
    let mut buf = [fill; 8];
    let src = &bytes[bytes.len().saturating_sub(8)..];
    buf[8 - src.len()..].copy_from_slice(src);
    Some(i64::from_be_bytes(buf))
}

/// The attempt count carried by `record`, defaulting to 1 when absent.
#[must_use]
pub fn attempts_for(record: &Record) -> i64 {
    record
        .headers
        .last(ATTEMPTS)
        .and_then(decode_header_value)
        .unwrap_or(1)
}

/// The raw original-timestamp header bytes, defaulting to the record's own
/// timestamp encoded on the fly.
#[must_use]
pub fn original_timestamp_bytes_for(record: &Record) -> Vec<u8> {
    record
        .headers
        .last(ORIGINAL_TIMESTAMP)
        .map_or_else(|| encode_header_value(record.timestamp), <[u8]>::to_vec)
}

/// The original timestamp in epoch milliseconds, defaulting to the record's
/// own timestamp.
#[must_use]
pub fn original_timestamp_for(record: &Record) -> i64 {
    record
        .headers
        .last(ORIGINAL_TIMESTAMP)
        .and_then(decode_header_value)
        .unwrap_or(record.timestamp)
}

/// The earliest allowed redelivery time, when a backoff header is present.
#[must_use]
pub fn backoff_timestamp_for(record: &Record) -> Option<i64> {
    record
        .headers
        .last(BACKOFF_TIMESTAMP)
        .and_then(decode_header_value)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::record::Headers;

    fn record_with_headers(headers: Headers) -> Record {
        Record {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            timestamp: 123_456,
            key: None,
            value: Vec::new(),
            headers,
        }
    }

    #[test]
    fn test_encode_minimal_representations() {
        assert_eq!(encode_header_value(0), vec![0x00]);
        assert_eq!(encode_header_value(1), vec![0x01]);
        assert_eq!(encode_header_value(127), vec![0x7F]);
        // 128 needs a leading zero so the sign bit stays clear
        assert_eq!(encode_header_value(128), vec![0x00, 0x80]);
        assert_eq!(encode_header_value(256), vec![0x01, 0x00]);
        assert_eq!(encode_header_value(-1), vec![0xFF]);
        assert_eq!(encode_header_value(-128), vec![0x80]);
        assert_eq!(encode_header_value(-129), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_encode_epoch_millis() {
        // A realistic epoch-milliseconds value occupies six bytes
        let encoded = encode_header_value(1_621_000_000_000);
        assert_eq!(encoded.len(), 6);
        assert_eq!(decode_header_value(&encoded), Some(1_621_000_000_000));
    }

    #[test]
    fn test_round_trip_boundaries() {
        for value in [
            0,
            1,
            -1,
            127,
            128,
            -128,
            -129,
            i64::from(i32::MAX),
            i64::from(i32::MIN),
            i64::MAX,
            i64::MIN,
        ] {
            let encoded = encode_header_value(value);
            assert_eq!(decode_header_value(&encoded), Some(value), "value {value}");
        }
    }

    #[test]
    fn test_decode_empty_is_none() {
        assert_eq!(decode_header_value(&[]), None);
    }

    #[test]
    fn test_decode_oversized_takes_low_bits() {
        // Nine bytes: a leading 0x01 beyond the low 64 bits is discarded
        let bytes = [0x01, 0, 0, 0, 0, 0, 0, 0, 0x05];
        assert_eq!(decode_header_value(&bytes), Some(5));
    }

    #[test]
    fn test_attempts_defaults_to_one() {
        let record = record_with_headers(Headers::new());
        assert_eq!(attempts_for(&record), 1);
    }

    #[test]
    fn test_attempts_reads_header() {
        let mut headers = Headers::new();
        headers.push(ATTEMPTS, encode_header_value(3));
        let record = record_with_headers(headers);
        assert_eq!(attempts_for(&record), 3);
    }

    #[test]
    fn test_original_timestamp_defaults_to_record_timestamp() {
        let record = record_with_headers(Headers::new());
        assert_eq!(original_timestamp_for(&record), 123_456);
        assert_eq!(
            original_timestamp_bytes_for(&record),
            encode_header_value(123_456)
        );
    }

    #[test]
    fn test_original_timestamp_propagates_header_bytes() {
        let mut headers = Headers::new();
        headers.push(ORIGINAL_TIMESTAMP, encode_header_value(999));
        let record = record_with_headers(headers);
        assert_eq!(original_timestamp_for(&record), 999);
        assert_eq!(
            original_timestamp_bytes_for(&record),
            encode_header_value(999)
        );
    }

    #[test]
    fn test_backoff_timestamp_absent() {
        let record = record_with_headers(Headers::new());
        assert_eq!(backoff_timestamp_for(&record), None);
    }
}
