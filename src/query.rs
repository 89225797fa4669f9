//! Turns raw query-string parameters into a bounded, defaulted [`MemeQuery`].

use crate::config::QueryLimits;
use serde::Deserialize;

pub const DEFAULT_SORT: &str = "random";
pub const DEFAULT_FORMAT: &str = "json";

/// Query parameters exactly as they arrive on the wire.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct RawMemeQuery {
    pub sort: Option<String>,
    pub id: Option<String>,
    pub limit: Option<String>,
    pub creator: Option<String>,
    pub skip: Option<String>,
    #[serde(alias = "return")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemeQuery {
    pub sort: String,
    pub id: Option<String>,
    pub limit: u32,
    pub creator: Option<String>,
    pub skip: u32,
    pub format: String,
}

impl RawMemeQuery {
    pub fn normalize(self, limits: QueryLimits) -> MemeQuery {
        let limit = match self.limit.as_deref().and_then(parse_saturating) {
            Some(n) => n.clamp(1, i64::from(limits.max_limit)) as u32,
            None => limits.default_limit.clamp(1, limits.max_limit),
        };
        let skip = self
            .skip
            .as_deref()
            .and_then(parse_saturating)
            .map(|n| n.clamp(0, i64::from(u32::MAX)) as u32)
            .unwrap_or(0);

        MemeQuery {
            sort: non_empty(self.sort).unwrap_or_else(|| DEFAULT_SORT.to_string()),
            id: non_empty(self.id),
            limit,
            creator: non_empty(self.creator),
            skip,
            format: non_empty(self.format).unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses an integer, saturating numerals too large for `i64` instead of
/// rejecting them. Anything that is not an optionally-signed run of digits
/// yields `None`.
fn parse_saturating(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(match raw.parse::<i64>() {
        Ok(n) => n,
        Err(_) if negative => i64::MIN,
        Err(_) => i64::MAX,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_limit(limit: &str) -> RawMemeQuery {
        RawMemeQuery { limit: Some(limit.to_string()), ..Default::default() }
    }

    #[test]
    fn defaults_apply_when_nothing_is_given() {
        let query = RawMemeQuery::default().normalize(QueryLimits::default());
        assert_eq!(
            query,
            MemeQuery {
                sort: "random".into(),
                id: None,
                limit: 10,
                creator: None,
                skip: 0,
                format: "json".into(),
            }
        );
    }

    #[test]
    fn limit_is_always_within_bounds() {
        let limits = QueryLimits::default();
        for (input, expected) in [
            ("-5", 1),
            ("0", 1),
            ("1", 1),
            ("42", 42),
            ("100", 100),
            ("101", 100),
            ("99999999999999999999999", 100),
            ("-99999999999999999999999", 1),
            ("abc", 10),
            ("", 10),
            ("12.5", 10),
            (" 7 ", 7),
        ] {
            let query = raw_limit(input).normalize(limits);
            assert_eq!(query.limit, expected, "limit input {:?}", input);
            assert!((1..=100).contains(&query.limit));
        }
    }

    #[test]
    fn skip_is_non_negative_with_zero_fallback() {
        let limits = QueryLimits::default();
        for (input, expected) in [("-3", 0), ("0", 0), ("25", 25), ("nope", 0)] {
            let query = RawMemeQuery { skip: Some(input.into()), ..Default::default() }.normalize(limits);
            assert_eq!(query.skip, expected, "skip input {:?}", input);
        }
    }

    #[test]
    fn blank_strings_count_as_absent() {
        let query = RawMemeQuery {
            sort: Some("  ".into()),
            id: Some("".into()),
            creator: Some(" alice ".into()),
            ..Default::default()
        }
        .normalize(QueryLimits::default());
        assert_eq!(query.sort, "random");
        assert_eq!(query.id, None);
        assert_eq!(query.creator.as_deref(), Some("alice"));
    }

    #[test]
    fn configured_bounds_are_respected() {
        let limits = QueryLimits { default_limit: 5, max_limit: 20 };
        assert_eq!(raw_limit("50").normalize(limits).limit, 20);
        assert_eq!(RawMemeQuery::default().normalize(limits).limit, 5);
    }
}
