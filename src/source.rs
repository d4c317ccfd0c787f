//! 이벤트 소스
//!
//! `EventSource`는 주어진 위치에서 새 스트림을 여는 능력이고,
//! `MySqlSource`는 MySQL/MariaDB에 대한 구현입니다.
//!
//! `MySqlSource`는 두 개의 독립된 연결을 가집니다.
//! - 명령 연결: 현재 위치 조회용 (`mysql_async`)
//! - 동기화 세션: 스트림마다 새로 여는 복제 연결 (`BinlogSyncer`)

use crate::binlog_client::BinlogSyncer;
use crate::connection::{ConnectionConfig, Flavor, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::position::{Position, ResumeMode, BINLOG_START_POSITION};
use crate::stream::{BinlogStream, EventStream, SessionGuard};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 주어진 위치에서 이벤트 스트림을 여는 능력
#[async_trait]
pub trait EventSource: Send {
    /// 이 소스가 이해하지 못하는 위치면 `InvalidPositionKind`로 즉시 실패합니다.
    async fn start_stream(&mut self, position: &Position) -> Result<Box<dyn EventStream>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    /// 명령 연결도, 활성 스트림도 없음
    Disconnected,
    /// 명령 연결만 살아 있음
    Connected,
    /// 동기화 세션이 살아 있음
    Streaming,
}

/// MySQL / MariaDB 소스
pub struct MySqlSource {
    config: ConnectionConfig,
    conn: Option<MySqlConnection>,
    syncer: BinlogSyncer,
    session: Arc<AtomicBool>,
}

impl MySqlSource {
    /// 명령 연결을 열고 동기화 세션을 준비 (시작하지는 않음)
    ///
    /// `server_id`가 0이면 임의의 0이 아닌 값이 배정됩니다.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let config = config.with_resolved_server_id();
        let conn = MySqlConnection::connect(&config).await?;

        info!(
            "Connected to {} ({}, server_id={})",
            config.address(),
            config.flavor,
            config.server_id
        );
        Ok(Self::from_parts(config, Some(conn)))
    }

    fn from_parts(config: ConnectionConfig, conn: Option<MySqlConnection>) -> Self {
        MySqlSource {
            syncer: BinlogSyncer::new(config.clone()),
            config,
            conn,
            session: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 현재 binlog 위치 조회 (한 번의 상태 쿼리)
    pub async fn get_current_position(&mut self) -> Result<Position> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            CdcError::ConnectionError("Command connection is closed".to_string())
        })?;

        let status = conn.get_binlog_status().await?;
        let position = Position::from_status(&status, self.config.flavor)?;

        info!("Current binlog position: {}", position);
        Ok(position)
    }

    /// 명령 연결 종료. 이미 열린 스트림에는 영향 없음
    pub async fn close_command_connection(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            debug!("Command connection closed");
        }
        Ok(())
    }

    pub fn state(&self) -> SourceState {
        if self.session.load(Ordering::Acquire) {
            SourceState::Streaming
        } else if self.conn.is_some() {
            SourceState::Connected
        } else {
            SourceState::Disconnected
        }
    }

    pub fn server_id(&self) -> u32 {
        self.config.server_id
    }

    pub fn flavor(&self) -> Flavor {
        self.config.flavor
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 위치가 이 소스에서 사용할 수 있는지 확인하고 재시작 방식을 결정
    fn check_position<'a>(&self, position: &'a Position) -> Result<ResumeMode<'a>> {
        let mode = position.resume_mode();
        match mode {
            ResumeMode::Gtid(gtid_set) if gtid_set.flavor() != self.config.flavor => {
                Err(CdcError::InvalidPositionKind(format!(
                    "{} GTID set cannot be used with a {} source",
                    gtid_set.flavor(),
                    self.config.flavor
                )))
            }
            ResumeMode::Binlog(binlog) if binlog.filename.is_empty() => Err(
                CdcError::StreamStartError("Binlog position has no file name".to_string()),
            ),
            ResumeMode::Binlog(binlog) if binlog.position < BINLOG_START_POSITION => {
                Err(CdcError::StreamStartError(format!(
                    "Binlog position {} is before the first event",
                    binlog
                )))
            }
            _ => Ok(mode),
        }
    }

    /// 구체 타입의 스트림 열기
    pub async fn open_stream(&mut self, position: &Position) -> Result<BinlogStream> {
        let mode = self.check_position(position)?;

        let guard = SessionGuard::acquire(&self.session).ok_or_else(|| {
            CdcError::StreamStartError("A binlog stream is already active on this source".to_string())
        })?;

        info!("Opening binlog stream from {}", position);
        let session = match mode {
            ResumeMode::Gtid(gtid_set) => self.syncer.start_sync_gtid(gtid_set).await?,
            ResumeMode::Binlog(binlog) => self.syncer.start_sync(binlog).await?,
        };

        Ok(BinlogStream::new(
            session,
            self.config.flavor,
            position.clone(),
            guard,
        ))
    }
}

#[async_trait]
impl EventSource for MySqlSource {
    async fn start_stream(&mut self, position: &Position) -> Result<Box<dyn EventStream>> {
        let stream = self.open_stream(position).await?;
        Ok(Box::new(stream))
    }
}
