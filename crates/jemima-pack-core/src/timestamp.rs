use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// `YYYY-MM-DDTHH:MM:SSZ`, the only timestamp shape packs carry.
///
/// # Errors
/// Returns [`time::error::Format`] when the year does not fit four digits.
pub fn utc_timestamp(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.to_offset(UtcOffset::UTC).format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z"))
}

/// `YYYYMMDD_HHMMSS`, the key shared by the two halves of a pool pair.
///
/// # Errors
/// Returns [`time::error::Format`] when the year does not fit four digits.
pub fn pool_key(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.to_offset(UtcOffset::UTC).format(format_description!("[year][month][day]_[hour][minute][second]"))
}

#[must_use]
pub fn is_pool_key(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use time::format_description::well_known::Rfc3339;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_714_557_600) + Duration::milliseconds(250)
    }

    fn formatted(result: Result<String, time::error::Format>) -> String {
        result.unwrap_or_else(|err| panic!("format failed: {err}"))
    }

    #[test]
    fn formats_pack_timestamp_without_fraction() {
        let stamp = formatted(utc_timestamp(fixture_time()));
        assert_eq!(stamp, "2024-05-01T10:00:00Z");
        let parsed = OffsetDateTime::parse(&stamp, &Rfc3339).unwrap_or_else(|err| panic!("rfc3339: {err}"));
        assert_eq!(parsed.unix_timestamp(), fixture_time().unix_timestamp());
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        let shifted = fixture_time().to_offset(time::macros::offset!(+2));
        assert_eq!(formatted(utc_timestamp(shifted)), "2024-05-01T10:00:00Z");
        assert_eq!(formatted(pool_key(shifted)), "20240501_100000");
    }

    #[test]
    fn pool_keys_sort_chronologically() {
        let earlier = formatted(pool_key(fixture_time()));
        let later = formatted(pool_key(fixture_time() + Duration::seconds(61)));
        assert_eq!(earlier, "20240501_100000");
        assert!(earlier < later);
        assert!(is_pool_key(&earlier));
        assert!(!is_pool_key("2024-05-01"));
        assert!(!is_pool_key("20240501-100000"));
    }
}
