//! MySQL / MariaDB Binlog CDC (Change Data Capture) 핵심 구현
//!
//! 이 라이브러리는 복제 피드에 접속해 현재 위치를 확인하고, 임의의 위치(파일 좌표 또는
//! GTID 집합)에서 스트림을 열어 이벤트를 순서대로 하나씩 꺼냅니다.
//! 주요 기능:
//! - 위치 표현 및 현재 위치 조회
//! - GTID (Global Transaction ID) 집합 관리
//! - Binlog 복제 프로토콜 (인증, 복제 등록, dump 요청)
//! - 취소 가능한 pull 방식 이벤트 스트림

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod connection;
pub mod error;
pub mod events;
pub mod gtid;
pub mod position;
pub mod protocol;
pub mod source;
pub mod stream;
pub mod tracer;

pub use binlog_client::BinlogSyncer;
pub use connection::{ConnectionConfig, Flavor, MySqlConnection};
pub use error::{CdcError, Result};
pub use events::{Event, EventHeader, EventType};
pub use gtid::GtidSet;
pub use position::{BinlogPosition, Position, ResumeMode};
pub use source::{EventSource, MySqlSource, SourceState};
pub use stream::{BinlogStream, EventStream};
pub use tracer::{TraceSummary, Tracer};
