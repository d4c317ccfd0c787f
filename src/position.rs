//! Binlog 처리 위치 (재시작 지점)
//!
//! 두 가지 재시작 방식을 하나의 타입으로 표현합니다.
//! - 파일 좌표: 예) "mysql-bin.000003" 파일의 4097 바이트 위치
//! - GTID 집합: 이미 적용된 트랜잭션 전체. 로그 로테이션과 무관하게 재시작 가능
//!
//! 스트림을 열 때는 둘 중 정확히 하나의 방식만 사용됩니다 (`ResumeMode`).

use crate::connection::{BinlogStatus, Flavor};
use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 모든 binlog 파일은 4 바이트 매직 헤더 뒤에서 시작
pub const BINLOG_START_POSITION: u32 = 4;

/// Binlog 파일 좌표. (파일명, 오프셋) 사전순으로 정렬
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u32,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u32) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 스트림 재시작 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// 파일 좌표만 알고 있음
    Binlog(BinlogPosition),
    /// GTID 집합만 알고 있음
    Gtid(GtidSet),
    /// 둘 다 알고 있음. 재시작은 GTID 집합으로
    Both { binlog: BinlogPosition, gtid: GtidSet },
}

/// 스트림을 여는 방식. 한 번에 하나만 선택됨
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode<'a> {
    Gtid(&'a GtidSet),
    Binlog(&'a BinlogPosition),
}

impl Position {
    /// 상태 조회 결과로부터 위치 생성
    ///
    /// GTID 문자열이 없거나 비어 있으면 파일 좌표만 가진 위치가 됩니다.
    /// GTID 문자열을 해석할 수 없으면 상태 응답이 잘못된 것이므로 `ProtocolError`입니다.
    /// 빈 집합으로 GTID 재시작을 하면 서버에 남은 모든 binlog를 처음부터 다시 받게 되므로
    /// 좌표 재시작이 현재 위치에 맞는 의미입니다.
    pub fn from_status(status: &BinlogStatus, flavor: Flavor) -> Result<Self> {
        let binlog = BinlogPosition::new(status.file.clone(), status.position);

        match status.executed_gtid_set.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let gtid = GtidSet::parse(flavor, text).map_err(|e| {
                    CdcError::ProtocolError(format!(
                        "Binlog status has an invalid GTID set '{}': {}",
                        text, e
                    ))
                })?;
                Ok(Position::Both { binlog, gtid })
            }
            _ => Ok(Position::Binlog(binlog)),
        }
    }

    pub fn binlog(&self) -> Option<&BinlogPosition> {
        match self {
            Position::Binlog(binlog) | Position::Both { binlog, .. } => Some(binlog),
            Position::Gtid(_) => None,
        }
    }

    pub fn gtid_set(&self) -> Option<&GtidSet> {
        match self {
            Position::Gtid(gtid) | Position::Both { gtid, .. } => Some(gtid),
            Position::Binlog(_) => None,
        }
    }

    pub fn has_gtid_set(&self) -> bool {
        self.gtid_set().is_some()
    }

    pub fn resume_mode(&self) -> ResumeMode<'_> {
        match self {
            Position::Gtid(gtid) | Position::Both { gtid, .. } => ResumeMode::Gtid(gtid),
            Position::Binlog(binlog) => ResumeMode::Binlog(binlog),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Binlog(binlog) => write!(f, "{}", binlog),
            Position::Gtid(gtid) => write!(f, "[{}]", gtid),
            Position::Both { binlog, gtid } => write!(f, "{}[{}]", binlog, gtid),
        }
    }
}

impl From<BinlogPosition> for Position {
    fn from(binlog: BinlogPosition) -> Self {
        Position::Binlog(binlog)
    }
}

impl From<GtidSet> for Position {
    fn from(gtid: GtidSet) -> Self {
        Position::Gtid(gtid)
    }
}
