//! GTID position handling
//!
//! A replication position is a list of GTIDs with at most one entry per
//! (domain, server) pair. The textual form is `d-s-n[,d-s-n]*`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error parsing a GTID or GTID list from its textual form
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GtidParseError {
    #[error("malformed GTID element {0:?}: expected domain-server-sequence")]
    Malformed(String),
    #[error("invalid number {value:?} in GTID element {element:?}")]
    BadNumber { element: String, value: String },
}

/// A single global transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub seq_no: u64,
}

impl FromStr for Gtid {
    type Err = GtidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let (domain, server, seq) = match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(srv), Some(n)) => (d, srv, n),
            _ => return Err(GtidParseError::Malformed(s.to_string())),
        };
        let parse_u32 = |v: &str| {
            v.parse::<u32>().map_err(|_| GtidParseError::BadNumber {
                element: s.to_string(),
                value: v.to_string(),
            })
        };
        let seq_no = seq.parse::<u64>().map_err(|_| GtidParseError::BadNumber {
            element: s.to_string(),
            value: seq.to_string(),
        })?;
        Ok(Self {
            domain_id: parse_u32(domain)?,
            server_id: parse_u32(server)?,
            seq_no,
        })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

/// Cumulative replication position: a set of GTIDs keyed by (domain, server),
/// kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidList(Vec<Gtid>);

impl GtidList {
    /// Parse the `d-s-n[,d-s-n]*` form. The empty string is the empty list.
    /// A later element with an already-seen (domain, server) key replaces the
    /// earlier one.
    pub fn parse(s: &str) -> Result<Self, GtidParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let mut list = Self::default();
        for part in s.split(',') {
            list.insert(part.trim().parse()?);
        }
        Ok(list)
    }

    fn insert(&mut self, gtid: Gtid) {
        match self
            .0
            .iter_mut()
            .find(|g| g.domain_id == gtid.domain_id && g.server_id == gtid.server_id)
        {
            Some(slot) => *slot = gtid,
            None => self.0.push(gtid),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The sequence-number components, in list order.
    pub fn seq_nos(&self) -> Vec<u64> {
        self.0.iter().map(|g| g.seq_no).collect()
    }

    /// Arithmetic sum of all sequence numbers. Wraps on overflow; this is an
    /// election scoring heuristic, not a correctness-level comparison.
    pub fn sum(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, g| acc.wrapping_add(g.seq_no))
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, gtid) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", gtid)?;
        }
        Ok(())
    }
}

impl FromStr for GtidList {
    type Err = GtidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        let list = GtidList::parse("0-1-100").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.seq_nos(), vec![100]);
    }

    #[test]
    fn test_roundtrip() {
        for s in ["", "0-1-100", "0-1-100,1-2-55", "5-10-1,6-10-2,7-10-3"] {
            let list = GtidList::parse(s).unwrap();
            assert_eq!(list.to_string(), s);
        }
    }

    #[test]
    fn test_empty_is_empty() {
        let list = GtidList::parse("").unwrap();
        assert!(list.is_empty());
        assert_eq!(list.to_string(), "");
        assert_eq!(list.sum(), 0);
    }

    #[test]
    fn test_duplicate_key_replaces() {
        let list = GtidList::parse("0-1-100,0-1-250").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.seq_nos(), vec![250]);
    }

    #[test]
    fn test_sum() {
        let list = GtidList::parse("0-1-100,1-2-50,2-3-8").unwrap();
        assert_eq!(list.sum(), 158);
    }

    #[test]
    fn test_sum_wraps() {
        let s = format!("0-1-{},0-2-5", u64::MAX);
        let list = GtidList::parse(&s).unwrap();
        assert_eq!(list.sum(), 4);
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            GtidList::parse("0-1"),
            Err(GtidParseError::Malformed(_))
        ));
        assert!(matches!(
            GtidList::parse("0-x-3"),
            Err(GtidParseError::BadNumber { .. })
        ));
        assert!(GtidList::parse("0-1-2,").is_err());
    }

    #[test]
    fn test_whitespace_tolerated() {
        let list = GtidList::parse(" 0-1-100, 1-2-3 ").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.to_string(), "0-1-100,1-2-3");
    }
}
