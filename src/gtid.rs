//! GTID (Global Transaction ID) 관리
//!
//! 서버 종류(flavor)마다 GTID 집합의 형식이 다릅니다.
//! - MySQL: `uuid:구간[:구간]*` 을 쉼표로 연결 ("uuid1:1-100:200,uuid2:1-50")
//! - MariaDB: `domain-server-sequence` 를 쉼표로 연결 ("0-1-100,1-2-5")
//!
//! GTID 집합은 전순서가 없으므로 비교는 포함 관계(`contains`)로 합니다.

use crate::connection::Flavor;
use crate::error::{CdcError, Result};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 {
            return Err(CdcError::GtidError("Sequence numbers start at 1".to_string()));
        }
        if start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {} > {}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn covers(&self, other: &GtidRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        // 겹치거나 연접한 범위만 병합
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid interval: '{}'", text));
        match text.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
                let end = end.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(start, end)
            }
            None => {
                let seq = text.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 서버 UUID 하나에 속한 GTID 범위들 (정렬, 병합 상태 유지)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UuidSet {
    pub ranges: Vec<GtidRange>,
}

impl UuidSet {
    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(joined) => *last = joined,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    /// 병합된 상태이므로 범위 하나가 통째로 덮어야 포함
    pub fn covers(&self, range: &GtidRange) -> bool {
        self.ranges.iter().any(|r| r.covers(range))
    }
}

/// MySQL GTID 집합
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MysqlGtidSet {
    pub sets: BTreeMap<Uuid, UuidSet>,
}

impl MysqlGtidSet {
    pub fn new() -> Self {
        MysqlGtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    ///
    /// `SHOW MASTER STATUS` 결과처럼 쉼표 뒤에 줄바꿈이 있어도 허용합니다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = MysqlGtidSet::new();

        for part in gtid_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (sid, intervals) = part
                .split_once(':')
                .ok_or_else(|| CdcError::GtidError(format!("GTID '{}' has no intervals", part)))?;
            let sid = Uuid::parse_str(sid.trim())
                .map_err(|e| CdcError::GtidError(format!("Invalid server UUID '{}': {}", sid, e)))?;

            for interval in intervals.split(':') {
                gtid_set.add_range(sid, GtidRange::parse(interval)?);
            }
        }

        Ok(gtid_set)
    }

    pub fn add_range(&mut self, sid: Uuid, range: GtidRange) {
        self.sets.entry(sid).or_default().add_range(range);
    }

    pub fn add_gtid(&mut self, sid: Uuid, sequence: u64) -> Result<()> {
        self.add_range(sid, GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    pub fn contains_gtid(&self, sid: &Uuid, sequence: u64) -> bool {
        self.sets.get(sid).map_or(false, |set| set.contains(sequence))
    }

    /// `other`의 모든 트랜잭션이 이 집합에 포함되는지 여부
    pub fn contains(&self, other: &MysqlGtidSet) -> bool {
        other.sets.iter().all(|(sid, other_set)| {
            other_set.ranges.iter().all(|range| {
                self.sets.get(sid).map_or(false, |set| set.covers(range))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }

    /// COM_BINLOG_DUMP_GTID 본문에 들어가는 바이너리 형식
    ///
    /// n_sids(8) + [sid(16) + n_intervals(8) + [start(8) + end_exclusive(8)]*]*
    pub fn encode(&self) -> Vec<u8> {
        let sets: Vec<(&Uuid, &UuidSet)> = self
            .sets
            .iter()
            .filter(|(_, set)| !set.ranges.is_empty())
            .collect();

        let mut buffer = BytesMut::with_capacity(self.encoded_len());
        buffer.put_u64_le(sets.len() as u64);
        for (sid, set) in sets {
            buffer.put_slice(sid.as_bytes());
            buffer.put_u64_le(set.ranges.len() as u64);
            for range in &set.ranges {
                buffer.put_u64_le(range.start);
                buffer.put_u64_le(range.end.saturating_add(1));
            }
        }
        buffer.to_vec()
    }

    pub fn encoded_len(&self) -> usize {
        8 + self
            .sets
            .values()
            .filter(|set| !set.ranges.is_empty())
            .map(|set| 16 + 8 + 16 * set.ranges.len())
            .sum::<usize>()
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (sid, set) in &self.sets {
            if set.ranges.is_empty() {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;

            write!(f, "{}", sid)?;
            for range in &set.ranges {
                write!(f, ":{}", range)?;
            }
        }
        Ok(())
    }
}

impl From<MysqlGtidSet> for String {
    fn from(set: MysqlGtidSet) -> Self {
        set.to_string()
    }
}

impl TryFrom<String> for MysqlGtidSet {
    type Error = CdcError;

    fn try_from(value: String) -> Result<Self> {
        MysqlGtidSet::parse(&value)
    }
}

/// MariaDB GTID 하나 (domain-server-sequence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl MariadbGtid {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid MariaDB GTID: '{}'", text));

        let mut fields = text.trim().splitn(3, '-');
        let domain_id = fields.next().ok_or_else(invalid)?.parse::<u32>().map_err(|_| invalid())?;
        let server_id = fields.next().ok_or_else(invalid)?.parse::<u32>().map_err(|_| invalid())?;
        let sequence = fields.next().ok_or_else(invalid)?.parse::<u64>().map_err(|_| invalid())?;

        Ok(MariadbGtid {
            domain_id,
            server_id,
            sequence,
        })
    }
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

/// MariaDB GTID 집합 (도메인당 마지막 GTID 하나)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MariadbGtidSet {
    pub domains: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn new() -> Self {
        MariadbGtidSet {
            domains: BTreeMap::new(),
        }
    }

    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = MariadbGtidSet::new();
        for part in gtid_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let gtid = MariadbGtid::parse(part)?;
            let entry = gtid_set.domains.entry(gtid.domain_id).or_insert(gtid);
            if gtid.sequence > entry.sequence {
                *entry = gtid;
            }
        }
        Ok(gtid_set)
    }

    /// 도메인의 마지막 GTID를 갱신 (로그 순서상 나중 것이 우선)
    pub fn add_gtid(&mut self, gtid: MariadbGtid) {
        self.domains.insert(gtid.domain_id, gtid);
    }

    pub fn contains(&self, other: &MariadbGtidSet) -> bool {
        other.domains.iter().all(|(domain, gtid)| {
            self.domains
                .get(domain)
                .map_or(false, |own| own.sequence >= gtid.sequence)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.domains.values().map(|g| g.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl From<MariadbGtidSet> for String {
    fn from(set: MariadbGtidSet) -> Self {
        set.to_string()
    }
}

impl TryFrom<String> for MariadbGtidSet {
    type Error = CdcError;

    fn try_from(value: String) -> Result<Self> {
        MariadbGtidSet::parse(&value)
    }
}

/// 서버 종류별 GTID 집합
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flavor", content = "set", rename_all = "lowercase")]
pub enum GtidSet {
    MySql(MysqlGtidSet),
    MariaDb(MariadbGtidSet),
}

impl GtidSet {
    /// flavor에 맞는 파서로 GTID 문자열 파싱
    pub fn parse(flavor: Flavor, gtid_str: &str) -> Result<Self> {
        match flavor {
            Flavor::MySql => Ok(GtidSet::MySql(MysqlGtidSet::parse(gtid_str)?)),
            Flavor::MariaDb => Ok(GtidSet::MariaDb(MariadbGtidSet::parse(gtid_str)?)),
        }
    }

    pub fn empty(flavor: Flavor) -> Self {
        match flavor {
            Flavor::MySql => GtidSet::MySql(MysqlGtidSet::new()),
            Flavor::MariaDb => GtidSet::MariaDb(MariadbGtidSet::new()),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            GtidSet::MySql(_) => Flavor::MySql,
            GtidSet::MariaDb(_) => Flavor::MariaDb,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GtidSet::MySql(set) => set.is_empty(),
            GtidSet::MariaDb(set) => set.is_empty(),
        }
    }

    /// 포함 관계 비교. flavor가 다르면 항상 false
    pub fn contains(&self, other: &GtidSet) -> bool {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => a.contains(b),
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => a.contains(b),
            _ => false,
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtidSet::MySql(set) => fmt::Display::fmt(set, f),
            GtidSet::MariaDb(set) => fmt::Display::fmt(set, f),
        }
    }
}
