//! Revision selectors embedded in virtual paths.
//!
//! A virtual path may carry one path component of the form
//! `YYYY-MM-DD[THH:MM:SS[Z]]`. That component selects "the most recent
//! commit at or before this instant":
//!
//! - a bare date means the end of that calendar day in local time
//!   (everything strictly before the next day's midnight),
//! - a time narrows the cutoff to that instant, in local time,
//! - a trailing `Z` reads the time as UTC instead.
//!
//! ```text
//! /2014-01-06/notes.txt            -> <= 2014-01-06 23:59:59 local, "/notes.txt"
//! /2014-01-06T13:35:20/notes.txt   -> <= 2014-01-06 13:35:20 local, "/notes.txt"
//! /2014-01-06T13:35:20Z/notes.txt  -> <= 2014-01-06 13:35:20 UTC,   "/notes.txt"
//! /notes.txt                       -> live, "/notes.txt"
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeZone, Utc,
};
use thiserror::Error;

/// Length of `YYYY-MM-DD`
const DATE_LEN: usize = 10;
/// Length of `YYYY-MM-DDTHH:MM:SS`
const DATE_TIME_LEN: usize = 19;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectorError {
    #[error("Not a timestamp component: {0}")]
    Malformed(String),

    #[error("Timestamp is not a valid calendar date or time: {0}")]
    OutOfRange(String),
}

/// "View the tree as of this instant."
///
/// Absence of a selector (`Option::None` wherever one is carried) means the
/// live working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RevisionSelector {
    date: NaiveDate,
    time: Option<NaiveTime>,
    utc: bool,
}

impl RevisionSelector {
    /// A selector for the end of `date`, local time.
    pub fn end_of_day(date: NaiveDate) -> Self {
        Self {
            date,
            time: None,
            utc: false,
        }
    }

    /// A selector for an exact instant. `utc` reads the clock time as UTC
    /// rather than local time.
    pub fn at(date: NaiveDate, time: NaiveTime, utc: bool) -> Self {
        Self {
            date,
            time: Some(time),
            utc,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn time(&self) -> Option<NaiveTime> {
        self.time
    }

    pub fn is_utc(&self) -> bool {
        self.utc
    }

    /// The last instant (inclusive, second resolution) whose commits are
    /// visible through this selector.
    pub fn cutoff(&self) -> DateTime<FixedOffset> {
        match self.time {
            Some(time) => {
                let naive = self.date.and_time(time);
                if self.utc {
                    let at = Utc.from_utc_datetime(&naive);
                    at.with_timezone(&at.offset().fix())
                } else {
                    localize(naive)
                }
            }
            None => match self.date.succ_opt() {
                Some(next) => localize(next.and_time(NaiveTime::MIN)) - Duration::seconds(1),
                None => localize(self.date.and_time(last_second())),
            },
        }
    }

    /// The cutoff rendered the way the VCS date parser expects it,
    /// e.g. `2014-01-06 23:59:59 +0100`.
    pub fn to_query(&self) -> String {
        self.cutoff().format("%Y-%m-%d %H:%M:%S %z").to_string()
    }
}

impl fmt::Display for RevisionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date.format("%Y-%m-%d"))?;
        if let Some(time) = self.time {
            write!(f, "T{}", time.format("%H:%M:%S"))?;
            if self.utc {
                write!(f, "Z")?;
            }
        }
        Ok(())
    }
}

impl FromStr for RevisionSelector {
    type Err = SelectorError;

    /// Parse a single path component.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SelectorError::Malformed(s.to_string());
        let out_of_range = || SelectorError::OutOfRange(s.to_string());
        let bytes = s.as_bytes();

        let (with_time, utc) = match bytes.len() {
            DATE_LEN => (false, false),
            DATE_TIME_LEN => (true, false),
            n if n == DATE_TIME_LEN + 1 && bytes[DATE_TIME_LEN] == b'Z' => (true, true),
            _ => return Err(malformed()),
        };

        if !matches_shape(&bytes[..DATE_LEN], b"dddd-dd-dd") {
            return Err(malformed());
        }
        if with_time && !matches_shape(&bytes[DATE_LEN..DATE_TIME_LEN], b"Tdd:dd:dd") {
            return Err(malformed());
        }

        let date = NaiveDate::from_ymd_opt(
            number(&s[0..4]) as i32,
            number(&s[5..7]),
            number(&s[8..10]),
        )
        .ok_or_else(out_of_range)?;

        if !with_time {
            return Ok(Self::end_of_day(date));
        }

        let time = NaiveTime::from_hms_opt(number(&s[11..13]), number(&s[14..16]), number(&s[17..19]))
            .ok_or_else(out_of_range)?;

        Ok(Self::at(date, time, utc))
    }
}

/// Split a virtual path into its selector and residual path.
///
/// The first component that parses as a timestamp becomes the selector;
/// everything before it is discarded and everything after it is the
/// residual (`/` when nothing follows). Without such a component the
/// selector is absent and the residual is the whole input.
pub fn split_virtual_path(path: &str) -> (Option<RevisionSelector>, String) {
    let mut offset = 0;
    for component in path.split('/') {
        let end = offset + component.len();
        if let Ok(selector) = component.parse::<RevisionSelector>() {
            let rest = &path[end..];
            let residual = if rest.trim_matches('/').is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            };
            return (Some(selector), residual);
        }
        offset = end + 1;
    }
    (None, path.to_string())
}

/// Read a wall-clock time in the local zone.
fn localize(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(at) => at.with_timezone(&at.offset().fix()),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&earliest.offset().fix()),
        LocalResult::None => {
            // Wall time inside a DST gap: use the offset in force just after it.
            let offset = Local.offset_from_utc_datetime(&naive).fix();
            let utc = naive - Duration::seconds(offset.local_minus_utc().into());
            DateTime::from_naive_utc_and_offset(utc, offset)
        }
    }
}

fn last_second() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// `d` matches an ASCII digit, any other byte matches itself.
fn matches_shape(bytes: &[u8], shape: &[u8]) -> bool {
    bytes.len() == shape.len()
        && bytes.iter().zip(shape).all(|(b, s)| match s {
            b'd' => b.is_ascii_digit(),
            _ => b == s,
        })
}

/// Only called on slices already checked to be ASCII digits.
fn number(digits: &str) -> u32 {
    digits
        .bytes()
        .fold(0, |acc, b| acc * 10 + u32::from(b - b'0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_parse_date_only() {
        let sel: RevisionSelector = "2014-01-06".parse().unwrap();
        assert_eq!(sel.date(), date(2014, 1, 6));
        assert_eq!(sel.time(), None);
        assert!(!sel.is_utc());
    }

    #[test]
    fn test_parse_time_and_utc_marker() {
        let local: RevisionSelector = "2014-01-06T13:35:20".parse().unwrap();
        assert_eq!(local, RevisionSelector::at(date(2014, 1, 6), time(13, 35, 20), false));

        let utc: RevisionSelector = "2014-01-06T13:35:20Z".parse().unwrap();
        assert_eq!(utc, RevisionSelector::at(date(2014, 1, 6), time(13, 35, 20), true));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "2014-1-06",
            "2014-01-06T13:35",
            "2014-01-06T13:35:20z",
            "2014-01-06Z",
            "2014/01/06",
            "notes.txt",
            "",
            "2014-01-06T13:35:20ZZ",
        ] {
            assert!(
                matches!(bad.parse::<RevisionSelector>(), Err(SelectorError::Malformed(_))),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_parse_rejects_impossible_dates() {
        assert_eq!(
            "2014-13-01".parse::<RevisionSelector>(),
            Err(SelectorError::OutOfRange("2014-13-01".to_string()))
        );
        assert!("2014-02-30".parse::<RevisionSelector>().is_err());
        assert!("2014-01-06T24:00:00".parse::<RevisionSelector>().is_err());
    }

    #[test]
    fn test_date_only_means_end_of_local_day() {
        let sel = RevisionSelector::end_of_day(date(2014, 1, 6));
        let cutoff = sel.cutoff();
        assert_eq!(cutoff.naive_local(), date(2014, 1, 6).and_time(time(23, 59, 59)));

        // One second later is already the next day, which must not be visible.
        let next_midnight = localize(date(2014, 1, 7).and_time(NaiveTime::MIN));
        assert_eq!(next_midnight - cutoff, Duration::seconds(1));
    }

    #[test]
    fn test_end_of_day_does_not_slip_into_previous_day() {
        let cutoff = RevisionSelector::end_of_day(date(2014, 12, 31)).cutoff();
        assert_eq!(cutoff.date_naive(), date(2014, 12, 31));
    }

    #[test]
    fn test_local_time_uses_local_offset() {
        let sel = RevisionSelector::at(date(2014, 1, 6), time(13, 35, 20), false);
        let expected = Local
            .from_local_datetime(&date(2014, 1, 6).and_time(time(13, 35, 20)))
            .earliest()
            .unwrap();
        assert_eq!(sel.cutoff(), expected);
    }

    #[test]
    fn test_utc_marker_reads_clock_as_utc() {
        let sel = RevisionSelector::at(date(2014, 1, 6), time(13, 35, 20), true);
        let cutoff = sel.cutoff();
        assert_eq!(cutoff.offset().local_minus_utc(), 0);
        assert_eq!(
            cutoff,
            Utc.with_ymd_and_hms(2014, 1, 6, 13, 35, 20).unwrap()
        );
        assert!(sel.to_query().ends_with("+0000"));
        assert!(sel.to_query().starts_with("2014-01-06 13:35:20"));
    }

    #[test]
    fn test_display_round_trips_component() {
        for text in ["2014-01-06", "2014-01-06T13:35:20", "2014-01-06T13:35:20Z"] {
            let sel: RevisionSelector = text.parse().unwrap();
            assert_eq!(sel.to_string(), text);
        }
    }

    #[test]
    fn test_split_with_selector() {
        let (sel, residual) = split_virtual_path("/2014-01-06/x");
        assert_eq!(sel, Some(RevisionSelector::end_of_day(date(2014, 1, 6))));
        assert_eq!(residual, "/x");

        let (sel, residual) = split_virtual_path("/2014-01-06T13:35:20Z/a/b.txt");
        assert_eq!(sel, Some(RevisionSelector::at(date(2014, 1, 6), time(13, 35, 20), true)));
        assert_eq!(residual, "/a/b.txt");
    }

    #[test]
    fn test_split_residual_defaults_to_root() {
        assert_eq!(split_virtual_path("/2014-01-06").1, "/");
        assert_eq!(split_virtual_path("/2014-01-06/").1, "/");
    }

    #[test]
    fn test_split_discards_prefix() {
        let (sel, residual) = split_virtual_path("/sub/dir/2014-01-06/residual/path");
        assert_eq!(sel, Some(RevisionSelector::end_of_day(date(2014, 1, 6))));
        assert_eq!(residual, "/residual/path");
    }

    #[test]
    fn test_split_requires_whole_component() {
        let (sel, residual) = split_virtual_path("/2014-01-06-notes.txt");
        assert_eq!(sel, None);
        assert_eq!(residual, "/2014-01-06-notes.txt");

        let (sel, _) = split_virtual_path("/2014-13-06/x");
        assert_eq!(sel, None);
    }

    proptest! {
        #[test]
        fn prop_plain_paths_are_live(components in prop::collection::vec("[a-z_.]{1,12}", 0..6)) {
            let path = format!("/{}", components.join("/"));
            let (sel, residual) = split_virtual_path(&path);
            prop_assert_eq!(sel, None);
            prop_assert_eq!(residual, path);
        }

        #[test]
        fn prop_valid_dates_always_select(
            y in 1971i32..2100,
            m in 1u32..=12,
            d in 1u32..=28,
            rest in "[a-z]{1,8}",
        ) {
            let path = format!("/{y:04}-{m:02}-{d:02}/{rest}");
            let (sel, residual) = split_virtual_path(&path);
            prop_assert_eq!(sel, Some(RevisionSelector::end_of_day(date(y, m, d))));
            prop_assert_eq!(residual, format!("/{rest}"));
        }
    }
}
