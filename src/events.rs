//! MySQL Binlog 이벤트 타입 및 이벤트 봉투(envelope) 정의
//!
//! 이벤트 본문은 해석하지 않고 그대로 전달합니다. 헤더의 이벤트 타입은 진단 로그용입니다.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Binlog 이벤트 헤더 크기 (v4)
pub const EVENT_HEADER_SIZE: usize = 19;

/// 서버가 실제 로그에 없는 이벤트를 만들어 보낼 때 설정하는 플래그
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;

/// MySQL / MariaDB Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    StartV3,
    /// 쿼리 이벤트 (DDL, BEGIN, 비트랜잭션 DML)
    QueryEvent,
    StopEvent,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent,
    IntvarEvent,
    RandEvent,
    UserVarEvent,
    FormatDescriptionEvent,
    /// 트랜잭션 커밋
    XidEvent,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent,
    WriteRowsEventV1,
    UpdateRowsEventV1,
    DeleteRowsEventV1,
    HeartbeatEvent,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent,
    AnonymousGtidEvent,
    PreviousGtidsEvent,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent,
    TransactionPayloadEvent,
    HeartbeatEventV2,
    MariadbAnnotateRowsEvent,
    MariadbBinlogCheckpointEvent,
    MariadbGtidEvent,
    MariadbGtidListEvent,
    /// 이 크레이트가 이름을 붙이지 않은 이벤트
    Other(u8),
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::StartV3,
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            5 => EventType::IntvarEvent,
            13 => EventType::RandEvent,
            14 => EventType::UserVarEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            29 => EventType::RowsQueryEvent,
            40 => EventType::TransactionPayloadEvent,
            41 => EventType::HeartbeatEventV2,
            160 => EventType::MariadbAnnotateRowsEvent,
            161 => EventType::MariadbBinlogCheckpointEvent,
            162 => EventType::MariadbGtidEvent,
            163 => EventType::MariadbGtidListEvent,
            other => EventType::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EventType::StartV3 => 1,
            EventType::QueryEvent => 2,
            EventType::StopEvent => 3,
            EventType::RotateEvent => 4,
            EventType::IntvarEvent => 5,
            EventType::RandEvent => 13,
            EventType::UserVarEvent => 14,
            EventType::FormatDescriptionEvent => 15,
            EventType::XidEvent => 16,
            EventType::TableMapEvent => 19,
            EventType::WriteRowsEventV1 => 23,
            EventType::UpdateRowsEventV1 => 24,
            EventType::DeleteRowsEventV1 => 25,
            EventType::HeartbeatEvent => 27,
            EventType::RowsQueryEvent => 29,
            EventType::WriteRowsEvent => 30,
            EventType::UpdateRowsEvent => 31,
            EventType::DeleteRowsEvent => 32,
            EventType::GtidEvent => 33,
            EventType::AnonymousGtidEvent => 34,
            EventType::PreviousGtidsEvent => 35,
            EventType::TransactionPayloadEvent => 40,
            EventType::HeartbeatEventV2 => 41,
            EventType::MariadbAnnotateRowsEvent => 160,
            EventType::MariadbBinlogCheckpointEvent => 161,
            EventType::MariadbGtidEvent => 162,
            EventType::MariadbGtidListEvent => 163,
            EventType::Other(code) => *code,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Other(code) => write!(f, "UnknownEvent({})", code),
            named => write!(f, "{:?}", named),
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// 이벤트를 기록한 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더 포함, 바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치 (0이면 알 수 없음)
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }

    /// 서버가 스트림 시작 시 만들어 보낸 이벤트 (fake rotate 등)
    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// 소스에서 받은 이벤트 하나
///
/// 본문(`payload`)은 헤더 이후의 원본 바이트이며 이 계층에서 해석하지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Bytes,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }
}
