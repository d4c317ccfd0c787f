//! CDC 관련 에러 타입
//!
//! 모든 에러는 호출자에게 그대로 전달됩니다. 내부 재시도는 없습니다.

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum CdcError {
    /// 명령 연결 또는 복제 연결을 맺거나 인증할 수 없음
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    /// 상태 응답이나 핸드셰이크 패킷의 필드가 없거나 잘못됨
    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    /// 이 소스가 이해하지 못하는 종류의 위치
    #[error("유효하지 않은 위치 종류: {0}")]
    InvalidPositionKind(String),

    /// 서버가 복제 등록이나 dump 요청을 거부함
    #[error("스트림 시작 에러: {0}")]
    StreamStartError(String),

    /// 스트림 도중의 전송 실패. 해당 스트림은 더 이상 사용할 수 없음
    #[error("스트림 읽기 에러: {0}")]
    StreamReadError(String),

    #[error("취소되었습니다")]
    Cancelled,

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CdcError {
    /// 협조적 취소로 인한 에러인지 여부
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CdcError::Cancelled)
    }

    /// 스트림을 다시 열어야 하는 에러인지 여부
    pub fn is_terminal_for_stream(&self) -> bool {
        matches!(self, CdcError::StreamReadError(_))
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
