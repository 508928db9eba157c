//! Cursor pagination over eviction-prone buffers.
//!
//! A cursor is `"<timestamp>:<sequence>"`, optionally followed by `"#<scope>"`
//! where scope fingerprints the filter parameters of the query that produced
//! it. Sequences come from [`crate::ring_buffer`], so a cursor stays valid as
//! long as the entry after it is still retained.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use tabscope_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: String,
    pub sequence: u64,
    pub scope: Option<String>,
}

impl Cursor {
    pub fn new(timestamp: impl Into<String>, sequence: u64, scope: &str) -> Self {
        Self {
            timestamp: timestamp.into(),
            sequence,
            scope: if scope.is_empty() { None } else { Some(scope.to_string()) },
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (body, scope) = match raw.rsplit_once('#') {
            Some((body, scope)) if !scope.is_empty() => (body, Some(scope.to_string())),
            Some((body, _)) => (body, None),
            None => (raw, None),
        };
        let (timestamp, seq) = body.rsplit_once(':').ok_or_else(|| {
            Error::InvalidCursor(format!("'{}' is not of the form <timestamp>:<sequence>", raw))
        })?;
        let sequence = seq
            .parse::<u64>()
            .map_err(|_| Error::InvalidCursor(format!("'{}' has a non-numeric sequence '{}'", raw, seq)))?;
        Ok(Self {
            timestamp: timestamp.to_string(),
            sequence,
            scope,
        })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sequence)?;
        if let Some(scope) = &self.scope {
            write!(f, "#{}", scope)?;
        }
        Ok(())
    }
}

/// Stable 8-hex-digit fingerprint of the filters a paginated view was asked for.
/// Empty values are ignored and keys are sorted, so parameter order does not matter.
pub fn filter_scope(params: &[(&str, &str)]) -> String {
    let mut pairs: Vec<&(&str, &str)> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    if pairs.is_empty() {
        return String::new();
    }
    pairs.sort();
    let canonical = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Latest,
    After,
    Before,
    Since,
}

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub after_cursor: Option<String>,
    pub before_cursor: Option<String>,
    pub since_cursor: Option<String>,
    pub limit: usize,
    pub restart_on_eviction: bool,
    /// Output of [`filter_scope`] for the current query.
    pub scope: String,
}

impl PageRequest {
    fn direction(&self) -> Result<(Direction, Option<&str>)> {
        let set: Vec<(&str, &str)> = [
            ("after_cursor", self.after_cursor.as_deref()),
            ("before_cursor", self.before_cursor.as_deref()),
            ("since_cursor", self.since_cursor.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.filter(|s| !s.is_empty()).map(|s| (k, s)))
        .collect();
        match set.as_slice() {
            [] => Ok((Direction::Latest, None)),
            [("after_cursor", c)] => Ok((Direction::After, Some(c))),
            [("before_cursor", c)] => Ok((Direction::Before, Some(c))),
            [(_, c)] => Ok((Direction::Since, Some(c))),
            _ => Err(Error::invalid_param(
                set[0].0,
                "only one of after_cursor, before_cursor and since_cursor may be set",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PageMetadata {
    pub total: usize,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_timestamp: Option<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cursor_restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub metadata: PageMetadata,
}

/// A filtered buffer entry: sequence, timestamp, payload.
pub type Sequenced<T> = (u64, String, T);

/// Pages through `items` (ascending sequence, already filtered).
/// `oldest_retained` is the buffer's oldest retained sequence before filtering,
/// which is what decides whether a cursor has aged out.
pub fn paginate<T>(items: Vec<Sequenced<T>>, oldest_retained: u64, req: &PageRequest) -> Result<Page<T>> {
    let (mut direction, raw_cursor) = req.direction()?;
    let limit = req.limit.max(1);
    let total = items.len();
    let oldest_timestamp = items.first().map(|(_, ts, _)| ts.clone());
    let newest_timestamp = items.last().map(|(_, ts, _)| ts.clone());

    let mut restarted: Option<(String, String)> = None;
    let mut anchor = 0u64;
    if let Some(raw) = raw_cursor {
        let cursor = Cursor::parse(raw)?;
        let scope_matches = cursor.scope.as_deref().unwrap_or("") == req.scope;
        let stale = cursor.sequence.saturating_add(1) < oldest_retained;
        if !scope_matches || stale {
            let warning = if !scope_matches {
                "Cursor was issued for different filters. Restarted from oldest available entry".to_string()
            } else {
                format!(
                    "Cursor expired (buffer overflow). Restarted from oldest available entry. Lost entries: {} to {}",
                    cursor.sequence + 1,
                    oldest_retained - 1
                )
            };
            if !req.restart_on_eviction {
                if !scope_matches {
                    return Err(Error::InvalidCursor(
                        "cursor was issued for a different set of filters; query without a cursor or set restart_on_eviction"
                            .to_string(),
                    ));
                }
                return Err(Error::StaleCursor(format!(
                    "cursor expired (buffer overflow). Requested sequence {}, oldest available is {}. Lost {} entries",
                    cursor.sequence,
                    oldest_retained,
                    oldest_retained - cursor.sequence - 1
                )));
            }
            restarted = Some((raw.to_string(), warning));
            anchor = oldest_retained.saturating_sub(1);
            if direction == Direction::Before {
                direction = Direction::After;
            }
        } else {
            anchor = cursor.sequence;
        }
    }

    let (selected, has_more): (Vec<Sequenced<T>>, bool) = match direction {
        Direction::Latest => {
            let skip = total.saturating_sub(limit);
            (items.into_iter().skip(skip).collect(), skip > 0)
        }
        Direction::After => {
            let newer: Vec<_> = items.into_iter().filter(|(seq, _, _)| *seq > anchor).collect();
            let more = newer.len() > limit;
            (newer.into_iter().take(limit).collect(), more)
        }
        Direction::Before => {
            let older: Vec<_> = items.into_iter().filter(|(seq, _, _)| *seq < anchor).collect();
            let skip = older.len().saturating_sub(limit);
            (older.into_iter().skip(skip).collect(), skip > 0)
        }
        Direction::Since => (items.into_iter().filter(|(seq, _, _)| *seq >= anchor).collect(), false),
    };

    // Continuation point in the same direction the caller is moving.
    let edge = if direction == Direction::Before {
        selected.first()
    } else {
        selected.last()
    };
    let cursor = edge.map(|(seq, ts, _)| Cursor::new(ts.clone(), *seq, &req.scope).to_string());

    let (original_cursor, warning) = match restarted {
        Some((orig, warn)) => (Some(orig), Some(warn)),
        None => (None, None),
    };
    let metadata = PageMetadata {
        total,
        count: selected.len(),
        cursor,
        oldest_timestamp,
        newest_timestamp,
        has_more,
        cursor_restarted: original_cursor.is_some(),
        original_cursor,
        warning,
    };
    Ok(Page {
        items: selected.into_iter().map(|(_, _, item)| item).collect(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(range: std::ops::RangeInclusive<u64>) -> Vec<Sequenced<u64>> {
        range.map(|s| (s, format!("2024-01-01T00:00:{:02}Z", s % 60), s)).collect()
    }

    fn req(limit: usize) -> PageRequest {
        PageRequest {
            limit,
            ..Default::default()
        }
    }

    #[test]
    fn test_cursor_parse_and_display() {
        let c = Cursor::parse("2024-01-01T00:00:05Z:42#ab12cd34").unwrap();
        assert_eq!(c.timestamp, "2024-01-01T00:00:05Z");
        assert_eq!(c.sequence, 42);
        assert_eq!(c.scope.as_deref(), Some("ab12cd34"));
        assert_eq!(c.to_string(), "2024-01-01T00:00:05Z:42#ab12cd34");
        assert!(matches!(Cursor::parse("garbage"), Err(Error::InvalidCursor(_))));
        assert!(matches!(Cursor::parse("ts:abc"), Err(Error::InvalidCursor(_))));
    }

    #[test]
    fn test_latest_page() {
        let page = paginate(items(1..=10), 1, &req(3)).unwrap();
        assert_eq!(page.items, vec![8, 9, 10]);
        assert!(page.metadata.has_more);
        assert_eq!(page.metadata.total, 10);
        assert!(page.metadata.cursor.unwrap().ends_with(":10"));
    }

    #[test]
    fn test_after_cursor_never_repeats_or_skips() {
        let all = items(1..=23);
        let mut seen = Vec::new();
        let mut r = req(5);
        r.after_cursor = Some("start:0".into());
        loop {
            let page = paginate(all.clone(), 1, &r).unwrap();
            seen.extend(page.items.iter().copied());
            if !page.metadata.has_more {
                break;
            }
            r.after_cursor = page.metadata.cursor;
        }
        assert_eq!(seen, (1..=23).collect::<Vec<_>>());
    }

    #[test]
    fn test_before_cursor_scrolls_back() {
        let mut r = req(3);
        r.before_cursor = Some("t:8".into());
        let page = paginate(items(1..=10), 1, &r).unwrap();
        assert_eq!(page.items, vec![5, 6, 7]);
        assert!(page.metadata.has_more);
        assert!(page.metadata.cursor.unwrap().ends_with(":5"));
    }

    #[test]
    fn test_since_cursor_unbounded() {
        let mut r = req(2);
        r.since_cursor = Some("t:4".into());
        let page = paginate(items(1..=10), 1, &r).unwrap();
        assert_eq!(page.items, vec![4, 5, 6, 7, 8, 9, 10]);
        assert!(!page.metadata.has_more);
    }

    #[test]
    fn test_stale_cursor_rejected() {
        let mut r = req(5);
        r.after_cursor = Some("t:3".into());
        let err = paginate(items(10..=20), 10, &r).unwrap_err();
        match err {
            Error::StaleCursor(msg) => assert!(msg.contains("Lost 6 entries"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cursor_just_before_oldest_is_not_stale() {
        let mut r = req(5);
        r.after_cursor = Some("t:9".into());
        let page = paginate(items(10..=20), 10, &r).unwrap();
        assert_eq!(page.items, vec![10, 11, 12, 13, 14]);
        assert!(!page.metadata.cursor_restarted);
    }

    #[test]
    fn test_stale_cursor_restart() {
        let mut r = req(3);
        r.after_cursor = Some("t:3".into());
        r.restart_on_eviction = true;
        let page = paginate(items(10..=20), 10, &r).unwrap();
        assert_eq!(page.items, vec![10, 11, 12]);
        assert!(page.metadata.cursor_restarted);
        assert_eq!(page.metadata.original_cursor.as_deref(), Some("t:3"));
        assert!(page.metadata.warning.unwrap().contains("Lost entries: 4 to 9"));
    }

    #[test]
    fn test_scope_mismatch() {
        let scope_all = filter_scope(&[("scope", "all")]);
        let scope_page = filter_scope(&[("scope", "current_page")]);
        assert_ne!(scope_all, scope_page);
        assert_eq!(scope_all.len(), 8);

        let mut r = req(5);
        r.scope = scope_page;
        r.after_cursor = Some(Cursor::new("t", 2, &scope_all).to_string());
        assert!(matches!(paginate(items(1..=5), 1, &r), Err(Error::InvalidCursor(_))));

        r.restart_on_eviction = true;
        let page = paginate(items(1..=5), 1, &r).unwrap();
        assert!(page.metadata.cursor_restarted);
        assert_eq!(page.items, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_conflicting_cursors_name_param() {
        let mut r = req(5);
        r.after_cursor = Some("t:1".into());
        r.since_cursor = Some("t:1".into());
        match paginate(items(1..=5), 1, &r) {
            Err(Error::InvalidParam { param, .. }) => assert_eq!(param, "after_cursor"),
            other => panic!("unexpected {:?}", other.map(|p| p.items)),
        }
    }

    #[test]
    fn test_filter_scope_order_independent() {
        assert_eq!(
            filter_scope(&[("level", "error"), ("url", "api")]),
            filter_scope(&[("url", "api"), ("level", "error"), ("source", "")])
        );
        assert_eq!(filter_scope(&[("url", "")]), "");
    }
}
