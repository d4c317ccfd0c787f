//! MySQL Binlog 이벤트 헤더 및 일부 본문 파싱
//!
//! 이벤트 구조:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!
//! 본문은 스트림이 자신의 재시작 위치를 추적하는 데 필요한 이벤트(rotate, GTID, query,
//! format description)만 해석합니다. 행 데이터는 다루지 않습니다.

use crate::error::{CdcError, Result};
use crate::events::{Event, EventHeader, EventType, EVENT_HEADER_SIZE};
use crate::gtid::MariadbGtid;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};
use uuid::Uuid;

/// CRC32 체크섬 길이
pub const CHECKSUM_CRC32_LEN: usize = 4;

const BINLOG_CHECKSUM_ALG_CRC32: u8 = 1;

/// MariaDB GTID 이벤트의 FL_STANDALONE 플래그 (BEGIN/COMMIT 없는 단독 이벤트)
const MARIADB_FL_STANDALONE: u8 = 0x01;

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// MySQL GTID 이벤트 데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GtidEventData {
    pub sid: Uuid,
    pub sequence: u64,
}

/// MariaDB GTID 이벤트 데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MariadbGtidEventData {
    pub gtid: MariadbGtid,
    pub standalone: bool,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    /// 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// Binlog 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::ProtocolError(format!(
                "Invalid event header: {} bytes, need {}",
                data.len(),
                EVENT_HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(event_type),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// 원본 이벤트 바이트를 헤더와 본문으로 분리
    pub fn parse_event(data: Bytes) -> Result<Event> {
        let header = Self::parse_header(&data)?;
        let payload = data.slice(EVENT_HEADER_SIZE..);
        Ok(Event { header, payload })
    }

    /// FORMAT_DESCRIPTION 이벤트 본문에서 체크섬 길이 확인
    ///
    /// 본문 끝의 5 바이트가 체크섬 알고리즘(1) + 체크섬 값(4)입니다.
    pub fn checksum_len(format_description_body: &[u8]) -> usize {
        // binlog_version(2) + server_version(50) + create_timestamp(4) + header_length(1)
        const FIXED_PART: usize = 57;

        let len = format_description_body.len();
        if len < FIXED_PART + 5 {
            return 0;
        }
        if format_description_body[len - 5] == BINLOG_CHECKSUM_ALG_CRC32 {
            CHECKSUM_CRC32_LEN
        } else {
            0
        }
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(body: &[u8]) -> Result<RotateEventData> {
        if body.len() < 8 {
            return Err(CdcError::ProtocolError("Invalid rotate event".to_string()));
        }

        let mut cursor = Cursor::new(body);

        let position = cursor.read_u64::<LittleEndian>()?;
        let filename_bytes = &body[cursor.position() as usize..];
        let filename = String::from_utf8_lossy(filename_bytes).to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }

    /// GTID 이벤트 파싱 (33)
    pub fn parse_gtid_event(body: &[u8]) -> Result<GtidEventData> {
        if body.len() < 25 {
            return Err(CdcError::ProtocolError("Invalid GTID event".to_string()));
        }

        let mut cursor = Cursor::new(body);

        let _flags = cursor.read_u8()?;
        let mut uuid_bytes = [0u8; 16];
        cursor.read_exact(&mut uuid_bytes)?;
        let sequence = cursor.read_u64::<LittleEndian>()?;

        Ok(GtidEventData {
            sid: Uuid::from_bytes(uuid_bytes),
            sequence,
        })
    }

    /// MariaDB GTID 이벤트 파싱 (162)
    ///
    /// 서버 ID는 본문이 아닌 이벤트 헤더에 있습니다.
    pub fn parse_mariadb_gtid_event(body: &[u8], server_id: u32) -> Result<MariadbGtidEventData> {
        if body.len() < 13 {
            return Err(CdcError::ProtocolError("Invalid MariaDB GTID event".to_string()));
        }

        let mut cursor = Cursor::new(body);

        let sequence = cursor.read_u64::<LittleEndian>()?;
        let domain_id = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u8()?;

        Ok(MariadbGtidEventData {
            gtid: MariadbGtid {
                domain_id,
                server_id,
                sequence,
            },
            standalone: flags & MARIADB_FL_STANDALONE != 0,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(body: &[u8]) -> Result<QueryEventData> {
        if body.len() < 13 {
            return Err(CdcError::ProtocolError("Invalid query event".to_string()));
        }

        let mut cursor = Cursor::new(body);

        let thread_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let db_len = cursor.read_u8()? as usize;
        let _error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as usize;

        // Status variables skip
        cursor.set_position(cursor.position() + status_len as u64);

        // 데이터베이스명
        let mut db_bytes = vec![0u8; db_len];
        cursor.read_exact(&mut db_bytes)?;
        let database = String::from_utf8_lossy(&db_bytes).to_string();

        // null terminator skip
        cursor.read_u8()?;

        // 쿼리
        let remaining = &body[cursor.position() as usize..];
        let query = String::from_utf8_lossy(remaining).to_string();

        Ok(QueryEventData {
            thread_id,
            exec_time,
            database,
            query,
        })
    }
}

/// 본문 끝의 체크섬 제거
pub fn strip_checksum(body: &[u8], checksum_len: usize) -> &[u8] {
    &body[..body.len().saturating_sub(checksum_len)]
}
