// src/core/monitor/gtid.rs

//! Replicated-position tokens. A GTID is `domain-server_id-sequence`; sequence numbers
//! are monotonic within a domain, so two servers are compared per domain.

use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A single replicated-position token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Gtid {
    pub domain: u32,
    pub server_id: i64,
    pub sequence: u64,
}

impl Gtid {
    pub fn new(domain: u32, server_id: i64, sequence: u64) -> Self {
        Self {
            domain,
            server_id,
            sequence,
        }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

impl FromStr for Gtid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let (Some(d), Some(id), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("malformed GTID '{s}'"));
        };
        let domain = d.parse().map_err(|_| format!("bad GTID domain in '{s}'"))?;
        let server_id = id.parse().map_err(|_| format!("bad GTID server id in '{s}'"))?;
        let sequence = seq.parse().map_err(|_| format!("bad GTID sequence in '{s}'"))?;
        Ok(Gtid::new(domain, server_id, sequence))
    }
}

/// A list of GTIDs, at most one per domain, kept sorted by domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GtidList(Vec<Gtid>);

impl GtidList {
    pub fn new(mut gtids: Vec<Gtid>) -> Self {
        gtids.sort_by_key(|g| g.domain);
        gtids.dedup_by_key(|g| g.domain);
        Self(gtids)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gtid> {
        self.0.iter()
    }

    /// The token for `domain`, if this list has one.
    pub fn get(&self, domain: u32) -> Option<Gtid> {
        self.0
            .binary_search_by_key(&domain, |g| g.domain)
            .ok()
            .map(|i| self.0[i])
    }

    /// The sequence number reached in `domain`; a missing domain counts as zero.
    pub fn sequence(&self, domain: u32) -> u64 {
        self.get(domain).map_or(0, |g| g.sequence)
    }

    /// Compares two lists in one domain only.
    pub fn cmp_in_domain(&self, other: &GtidList, domain: u32) -> Ordering {
        self.sequence(domain).cmp(&other.sequence(domain))
    }

    /// True if, in every domain `other` has reached, this list is at least as far.
    pub fn is_at_or_after(&self, other: &GtidList) -> bool {
        other.0.iter().all(|g| self.sequence(g.domain) >= g.sequence)
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, gtid) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{gtid}")?;
        }
        Ok(())
    }
}

impl FromStr for GtidList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let gtids = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Gtid::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GtidList::new(gtids))
    }
}
