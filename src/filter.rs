//! Date-window filtering over already-resolved instants.

use chrono::{DateTime, Utc};

use crate::types::{DateRange, NO_TIMESTAMP_KEY, TranscriptEntry, parse_timestamp};

/// Anything that may carry a point in time.
pub trait Timestamped {
    fn instant(&self) -> Option<DateTime<Utc>>;
}

impl Timestamped for TranscriptEntry {
    fn instant(&self) -> Option<DateTime<Utc>> {
        TranscriptEntry::instant(self)
    }
}

/// Whether a record belongs in `range`. Records without a time are
/// session-level metadata and always belong.
pub fn in_range<T: Timestamped>(record: &T, range: &DateRange) -> bool {
    match record.instant() {
        Some(instant) => range.contains(&instant),
        None => true,
    }
}

/// Keep the records that fall in `range`, preserving order.
pub fn filter_by_date<T: Timestamped>(records: Vec<T>, range: &DateRange) -> Vec<T> {
    if range.is_unbounded() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| in_range(record, range))
        .collect()
}

/// Same predicate applied to a cache timestamp key, without decoding the
/// records stored under it. `None` when the key is not a timestamp.
pub fn key_in_range(key: &str, range: &DateRange) -> Option<bool> {
    if key == NO_TIMESTAMP_KEY || range.is_unbounded() {
        return Some(true);
    }
    parse_timestamp(key).map(|instant| range.contains(&instant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RecordCodec, TranscriptCodec};
    use crate::types::timestamp_key;
    use chrono::TimeZone;

    fn entry(line: &str) -> TranscriptEntry {
        TranscriptCodec.decode_line(line).unwrap()
    }

    fn user_at(ts: &str) -> TranscriptEntry {
        entry(&format!(
            r#"{{"type":"user","timestamp":"{ts}","sessionId":"s","message":{{"role":"user","content":"hi"}}}}"#
        ))
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let records = vec![user_at("2024-01-01T00:00:00Z"), user_at("2030-01-01T00:00:00Z")];
        assert_eq!(filter_by_date(records.clone(), &DateRange::unbounded()), records);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let records = vec![
            user_at("2024-01-01T00:00:00Z"),
            user_at("2024-01-01T12:00:00Z"),
            user_at("2024-01-02T00:00:00Z"),
        ];
        let range = DateRange::new(Some(day(1, 0)), Some(day(1, 12)));
        let kept = filter_by_date(records.clone(), &range);
        assert_eq!(kept, records[..2].to_vec());
    }

    #[test]
    fn test_open_sides() {
        let records = vec![user_at("2024-01-01T00:00:00Z"), user_at("2024-01-03T00:00:00Z")];

        let from_only = DateRange::new(Some(day(2, 0)), None);
        assert_eq!(filter_by_date(records.clone(), &from_only), records[1..].to_vec());

        let to_only = DateRange::new(None, Some(day(2, 0)));
        assert_eq!(filter_by_date(records.clone(), &to_only), records[..1].to_vec());
    }

    #[test]
    fn test_summaries_always_included() {
        let summary = entry(r#"{"type":"summary","summary":"s","leafUuid":"x"}"#);
        let records = vec![summary.clone(), user_at("2020-01-01T00:00:00Z")];
        let range = DateRange::new(Some(day(1, 0)), Some(day(1, 1)));
        assert_eq!(filter_by_date(records, &range), vec![summary]);
    }

    #[test]
    fn test_offsets_compare_as_instants() {
        // 2024-01-01T01:00:00+02:00 == 2023-12-31T23:00:00Z
        let records = vec![user_at("2024-01-01T01:00:00+02:00")];
        let range = DateRange::new(Some(day(1, 0)), None);
        assert!(filter_by_date(records, &range).is_empty());
    }

    #[test]
    fn test_key_in_range() {
        let range = DateRange::new(Some(day(1, 0)), Some(day(1, 23)));
        assert_eq!(key_in_range(NO_TIMESTAMP_KEY, &range), Some(true));
        assert_eq!(key_in_range(&timestamp_key(&day(1, 5)), &range), Some(true));
        assert_eq!(key_in_range(&timestamp_key(&day(2, 5)), &range), Some(false));
        assert_eq!(key_in_range("garbage", &range), None);
    }
}
