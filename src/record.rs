//! The three-column session row and its timestamp format.

use crate::store::{Error, Row};
use std::fmt;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// A whole-second wall clock reading, stored as `YYYY-MM-DD HH:MM:SS`.
///
/// The wire form sorts lexically in time order, which is what the store's
/// range delete relies on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    pub fn new(datetime: PrimitiveDateTime) -> Self {
        Self(truncate(datetime))
    }

    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::Protocol("modified timestamp is not UTF-8".to_string()))?;
        PrimitiveDateTime::parse(text, FORMAT)
            .map(Self)
            .map_err(|err| Error::Protocol(format!("malformed modified timestamp `{text}`: {err}")))
    }

    pub fn datetime(self) -> PrimitiveDateTime {
        self.0
    }

    /// Moves the reading `seconds` into the past, clamping at the earliest
    /// representable value.
    pub fn saturating_sub_secs(self, seconds: u64) -> Self {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        self.0
            .checked_sub(time::Duration::seconds(seconds))
            .map(Self)
            .unwrap_or(Self(PrimitiveDateTime::MIN))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.0.format(FORMAT).map_err(|_| fmt::Error)?;
        f.write_str(&formatted)
    }
}

fn truncate(datetime: PrimitiveDateTime) -> PrimitiveDateTime {
    datetime.replace_nanosecond(0).unwrap_or(datetime)
}

/// The wall clock session timestamps are taken from.
///
/// The UTC offset is fixed when the clock is created so every timestamp a
/// backend writes compares consistently with the ones it wrote before.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Clock {
    offset: UtcOffset,
}

impl Clock {
    /// Server-local time. Falls back to UTC when the local offset cannot be
    /// determined (e.g. in a multi-threaded process on some Unix platforms).
    pub fn local() -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or_else(|err| {
            tracing::warn!(err = %err, "local UTC offset unavailable, session timestamps use UTC");
            UtcOffset::UTC
        });
        Self { offset }
    }

    pub fn utc() -> Self {
        Self {
            offset: UtcOffset::UTC,
        }
    }

    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    pub fn now(&self) -> Timestamp {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        Timestamp::new(PrimitiveDateTime::new(now.date(), now.time()))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::local()
    }
}

/// A stored session: `id`, `modified`, `data`.
///
/// `modified` is `None` when the column is NULL or not in the expected format
/// (e.g. MySQL's zero date `0000-00-00 00:00:00`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub modified: Option<Timestamp>,
    pub payload: Vec<u8>,
}

impl SessionRecord {
    /// Decodes a row fetched through the primary binding.
    ///
    /// Whether there is a session depends on the payload column alone: a row
    /// whose payload is missing or NULL yields `None`.
    pub fn from_row(row: Row) -> Result<Option<Self>, Error> {
        let mut columns = row.into_iter();
        let (id, modified, payload) = (columns.next(), columns.next(), columns.next());

        let Some(Some(payload)) = payload else {
            return Ok(None);
        };
        let Some(Some(id)) = id else {
            return Err(Error::Protocol("session row without an id".to_string()));
        };
        let id = String::from_utf8(id)
            .map_err(|_| Error::Protocol("session id is not UTF-8".to_string()))?;

        let modified = modified.flatten().and_then(|raw| {
            Timestamp::parse(&raw)
                .map_err(|err| tracing::debug!(err = %err, "ignoring unreadable modified column"))
                .ok()
        });

        Ok(Some(Self {
            id,
            modified,
            payload,
        }))
    }
}

/// Borrowed column values for an insert or update, in `id, modified, data`
/// order.
#[derive(Debug)]
pub struct Columns<'a> {
    id: &'a [u8],
    modified: String,
    payload: &'a [u8],
}

impl<'a> Columns<'a> {
    pub fn new(id: &'a str, modified: Timestamp, payload: &'a [u8]) -> Self {
        Self {
            id: id.as_bytes(),
            modified: modified.to_string(),
            payload,
        }
    }

    pub fn values(&self) -> [&[u8]; 3] {
        [self.id, self.modified.as_bytes(), self.payload]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_timestamp_wire_format() {
        let stamp = Timestamp::new(datetime!(2024-03-05 07:08:09.750));
        assert_eq!(stamp.to_string(), "2024-03-05 07:08:09");
        assert_eq!(Timestamp::parse(b"2024-03-05 07:08:09").unwrap(), stamp);
        assert!(matches!(
            Timestamp::parse(b"yesterday"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_wire_form_sorts_like_time() {
        let earlier = Timestamp::new(datetime!(2024-01-09 23:59:59));
        let later = Timestamp::new(datetime!(2024-01-10 00:00:00));
        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());
    }

    #[test]
    fn test_saturating_sub() {
        let stamp = Timestamp::new(datetime!(2024-01-01 01:00:00));
        assert_eq!(
            stamp.saturating_sub_secs(3600).to_string(),
            "2024-01-01 00:00:00"
        );
        assert_eq!(
            stamp.saturating_sub_secs(u64::MAX).datetime(),
            PrimitiveDateTime::MIN
        );
    }

    #[test]
    fn test_clock_offset_applies() {
        let utc = Clock::utc().now();
        let ahead = Clock::with_offset(UtcOffset::from_hms(2, 0, 0).unwrap()).now();
        let diff = ahead.datetime() - utc.datetime();
        assert!((diff.whole_seconds() - 7200).abs() <= 1);
    }

    #[test]
    fn test_record_from_row() {
        let row = vec![
            Some(b"abc123".to_vec()),
            Some(b"2024-01-01 00:00:00".to_vec()),
            Some(b"user_id=5".to_vec()),
        ];
        let record = SessionRecord::from_row(row).unwrap().unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(
            record.modified.map(|stamp| stamp.to_string()).as_deref(),
            Some("2024-01-01 00:00:00")
        );
        assert_eq!(record.payload, b"user_id=5");

        let null_payload = vec![
            Some(b"abc123".to_vec()),
            Some(b"2024-01-01 00:00:00".to_vec()),
            None,
        ];
        assert!(SessionRecord::from_row(null_payload).unwrap().is_none());
        assert!(SessionRecord::from_row(vec![Some(b"abc".to_vec())])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unreadable_modified_keeps_the_payload() {
        let zero_date = vec![
            Some(b"abc123".to_vec()),
            Some(b"0000-00-00 00:00:00".to_vec()),
            Some(b"user_id=5".to_vec()),
        ];
        let record = SessionRecord::from_row(zero_date).unwrap().unwrap();
        assert_eq!(record.modified, None);
        assert_eq!(record.payload, b"user_id=5");

        let null_modified = vec![Some(b"abc123".to_vec()), None, Some(Vec::new())];
        let record = SessionRecord::from_row(null_modified).unwrap().unwrap();
        assert_eq!(record.modified, None);
        assert!(record.payload.is_empty());
    }

    #[test]
    fn test_columns_order() {
        let stamp = Timestamp::parse(b"2024-01-01 00:00:00").unwrap();
        let columns = Columns::new("abc", stamp, b"data");
        assert_eq!(
            columns.values(),
            [&b"abc"[..], &b"2024-01-01 00:00:00"[..], &b"data"[..]]
        );
    }
}
