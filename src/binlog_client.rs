//! MySQL Binlog 동기화 세션
//!
//! mysql-binlog-connector-java / go-mysql의 BinlogSyncer를 참고한 복제 연결 수립 과정:
//! 1. TCP(또는 Unix 소켓) 연결 후 greeting 수신
//! 2. 인증 (auth switch, caching_sha2 fast auth 포함)
//! 3. 체크섬 설정 및 COM_REGISTER_SLAVE
//! 4. COM_BINLOG_DUMP 또는 COM_BINLOG_DUMP_GTID 전송
//! 5. 첫 패킷을 읽어 서버가 요청을 거부했는지 확인

use crate::auth::{self, AuthSwitchRequest, CACHING_SHA2_PASSWORD, MYSQL_NATIVE_PASSWORD};
use crate::connection::{ConnectionConfig, Flavor};
use crate::error::{CdcError, Result};
use crate::gtid::{GtidSet, MysqlGtidSet};
use crate::position::{BinlogPosition, ResumeMode, BINLOG_START_POSITION};
use crate::protocol::{self, GreetingPacket, PacketChannel, ServerError};
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use std::io::Write;
use tracing::{debug, info, warn};

/// COM_REGISTER_SLAVE 명령어 코드
const COM_REGISTER_SLAVE: u8 = 0x15;

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// COM_BINLOG_DUMP_GTID 명령어 코드
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

/// COM_BINLOG_DUMP_GTID 플래그: GTID 집합으로 시작 위치 지정
const BINLOG_THROUGH_GTID: u16 = 0x04;

/// MariaDB 복제 capability (MARIA_SLAVE_CAPABILITY_GTID)
const MARIADB_SLAVE_CAPABILITY_GTID: u8 = 4;

/// caching_sha2_password 응답 상태
const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

/// dump 요청이 받아들여진 복제 연결
///
/// `first_packet`은 시작 확인을 위해 미리 읽은 첫 응답 패킷이며 아직 소비되지 않았습니다.
pub struct SyncSession {
    pub channel: PacketChannel,
    pub first_packet: Bytes,
}

/// Binlog 동기화 세션 생성기
///
/// 생성만으로는 서버에 접속하지 않습니다. `start_sync*` 호출마다 새 복제 연결을 엽니다.
#[derive(Debug, Clone)]
pub struct BinlogSyncer {
    config: ConnectionConfig,
}

impl BinlogSyncer {
    pub fn new(config: ConnectionConfig) -> Self {
        BinlogSyncer { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 파일 좌표에서 동기화 시작
    pub async fn start_sync(&self, position: &BinlogPosition) -> Result<SyncSession> {
        self.start(ResumeMode::Binlog(position)).await
    }

    /// GTID 집합 이후부터 동기화 시작
    pub async fn start_sync_gtid(&self, gtid_set: &GtidSet) -> Result<SyncSession> {
        self.start(ResumeMode::Gtid(gtid_set)).await
    }

    async fn start(&self, mode: ResumeMode<'_>) -> Result<SyncSession> {
        let endpoint = self.config.endpoint();
        let channel = PacketChannel::connect(&endpoint, self.config.timeout).await?;
        self.sync_over(channel, mode).await
    }

    /// 이미 열린 연결 위에서 핸드셰이크부터 dump 요청까지 수행
    pub(crate) async fn sync_over(
        &self,
        mut channel: PacketChannel,
        mode: ResumeMode<'_>,
    ) -> Result<SyncSession> {
        tokio::time::timeout(self.config.timeout, self.authenticate(&mut channel))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out during handshake with {}",
                    self.config.address()
                ))
            })?
            .map_err(into_connection_error)?;

        self.prepare(&mut channel).await.map_err(into_stream_start_error)?;
        self.register_slave(&mut channel)
            .await
            .map_err(into_stream_start_error)?;
        self.request_dump(&mut channel, mode)
            .await
            .map_err(into_stream_start_error)?;

        // 서버가 dump 요청을 거부하면 첫 응답이 ERR 패킷
        let first_packet = tokio::time::timeout(self.config.timeout, channel.read_packet())
            .await
            .map_err(|_| {
                CdcError::StreamStartError("Timed out waiting for the first binlog packet".to_string())
            })?
            .map_err(|e| CdcError::StreamStartError(format!("Binlog dump failed: {}", e)))?;

        if protocol::is_error_packet(&first_packet) {
            let err = ServerError::parse(&first_packet)?;
            return Err(CdcError::StreamStartError(format!(
                "Server rejected binlog dump: {}",
                err
            )));
        }

        info!("Binlog streaming started ({})", describe_mode(mode));
        Ok(SyncSession {
            channel,
            first_packet,
        })
    }

    /// greeting 수신 및 인증
    async fn authenticate(&self, channel: &mut PacketChannel) -> Result<()> {
        let greeting_packet = channel.read_packet().await?;
        if protocol::is_error_packet(&greeting_packet) {
            let err = ServerError::parse(&greeting_packet)?;
            return Err(CdcError::ConnectionError(format!("Server refused connection: {}", err)));
        }
        let greeting = GreetingPacket::parse(&greeting_packet)?;

        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        let mut plugin = if greeting.auth_plugin_name.is_empty() {
            MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            greeting.auth_plugin_name.clone()
        };

        let response = auth::create_handshake_response(
            &self.config.username,
            &self.config.password,
            &greeting.scramble,
            greeting.server_collation,
            &plugin,
        )?;
        channel.write_packet(&response).await?;

        loop {
            let packet = channel.read_packet().await?;
            match packet.first().copied() {
                Some(0x00) => {
                    info!("Authentication successful ({})", plugin);
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = ServerError::parse(&packet)?;
                    return Err(CdcError::ConnectionError(format!("Authentication failed: {}", err)));
                }
                Some(0xFE) => {
                    let switch = AuthSwitchRequest::parse(&packet)?;
                    debug!("Server requested auth switch to {}", switch.plugin);
                    let response =
                        auth::scramble_password(&switch.plugin, &self.config.password, &switch.scramble)?;
                    channel.write_packet(&response).await?;
                    plugin = switch.plugin;
                }
                Some(0x01) if plugin == CACHING_SHA2_PASSWORD => match packet.get(1).copied() {
                    Some(FAST_AUTH_SUCCESS) => debug!("caching_sha2_password fast auth succeeded"),
                    Some(PERFORM_FULL_AUTHENTICATION) => {
                        return Err(CdcError::ConnectionError(
                            "caching_sha2_password full authentication requires TLS or RSA key exchange, which is not supported"
                                .to_string(),
                        ));
                    }
                    other => {
                        return Err(CdcError::ProtocolError(format!(
                            "Unexpected caching_sha2_password status: {:?}",
                            other
                        )));
                    }
                },
                other => {
                    return Err(CdcError::ProtocolError(format!(
                        "Unexpected authentication response: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// 세션 변수 설정
    async fn prepare(&self, channel: &mut PacketChannel) -> Result<()> {
        // 체크섬은 FORMAT_DESCRIPTION 이벤트로 다시 확인하므로 거부되어도 계속 진행
        match channel.execute("SET @master_binlog_checksum='NONE'").await {
            Ok(()) => info!("Binlog checksum set to NONE"),
            Err(e) => warn!("Failed to set binlog checksum to NONE, continuing anyway: {}", e),
        }

        if self.config.flavor == Flavor::MariaDb {
            let query = format!("SET @mariadb_slave_capability={}", MARIADB_SLAVE_CAPABILITY_GTID);
            channel
                .execute(&query)
                .await
                .map_err(|e| CdcError::StreamStartError(e.to_string()))?;
        }

        Ok(())
    }

    async fn register_slave(&self, channel: &mut PacketChannel) -> Result<()> {
        let command = create_register_slave_command(&self.config)?;

        channel.reset_sequence();
        channel.write_packet(&command).await?;

        let response = channel.read_packet().await?;
        if protocol::is_error_packet(&response) {
            let err = ServerError::parse(&response)?;
            return Err(CdcError::StreamStartError(format!(
                "COM_REGISTER_SLAVE rejected (server_id={}): {}",
                self.config.server_id, err
            )));
        }

        debug!("Registered as replica with server_id {}", self.config.server_id);
        Ok(())
    }

    async fn request_dump(&self, channel: &mut PacketChannel, mode: ResumeMode<'_>) -> Result<()> {
        let server_id = self.config.server_id;

        let command = match mode {
            ResumeMode::Binlog(position) => {
                create_binlog_dump_command(server_id, &position.filename, position.position)?
            }
            ResumeMode::Gtid(GtidSet::MySql(gtid_set)) => {
                create_binlog_dump_gtid_command(server_id, gtid_set)?
            }
            ResumeMode::Gtid(GtidSet::MariaDb(gtid_set)) => {
                // MariaDB는 세션 변수로 GTID 위치를 전달하고 일반 dump 명령을 사용
                let queries = [
                    format!("SET @slave_connect_state='{}'", gtid_set),
                    "SET @slave_gtid_strict_mode=0".to_string(),
                    "SET @slave_gtid_ignore_duplicates=0".to_string(),
                ];
                for query in &queries {
                    channel
                        .execute(query)
                        .await
                        .map_err(|e| CdcError::StreamStartError(e.to_string()))?;
                }
                create_binlog_dump_command(server_id, "", BINLOG_START_POSITION)?
            }
        };

        channel.reset_sequence();
        channel.write_packet(&command).await?;

        info!("Sent binlog dump request: {}", describe_mode(mode));
        Ok(())
    }
}

fn describe_mode(mode: ResumeMode<'_>) -> String {
    match mode {
        ResumeMode::Binlog(position) => format!("file={}, position={}", position.filename, position.position),
        ResumeMode::Gtid(gtid_set) => format!("gtid_set=[{}]", gtid_set),
    }
}

/// 핸드셰이크 단계의 실패는 모두 연결 에러로 취급
fn into_connection_error(err: CdcError) -> CdcError {
    match err {
        CdcError::ConnectionError(_) => err,
        other => CdcError::ConnectionError(other.to_string()),
    }
}

/// 복제 등록과 dump 요청 단계의 실패는 모두 스트림 시작 에러로 취급
fn into_stream_start_error(err: CdcError) -> CdcError {
    match err {
        CdcError::StreamStartError(_) => err,
        other => CdcError::StreamStartError(other.to_string()),
    }
}

/// 길이(1 byte) + 문자열
fn write_short_string(buffer: &mut Vec<u8>, name: &str, value: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| CdcError::ConfigError(format!("{} is too long for COM_REGISTER_SLAVE", name)))?;
    buffer.write_u8(len)?;
    buffer.write_all(value.as_bytes())?;
    Ok(())
}

/// COM_REGISTER_SLAVE 명령어 생성
fn create_register_slave_command(config: &ConnectionConfig) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    buffer.write_u8(COM_REGISTER_SLAVE)?;
    buffer.write_u32::<LittleEndian>(config.server_id)?;

    // report_host는 비워 둠 (SHOW REPLICAS에 표시되지 않음)
    write_short_string(&mut buffer, "hostname", "")?;
    write_short_string(&mut buffer, "username", &config.username)?;
    write_short_string(&mut buffer, "password", &config.password)?;
    buffer.write_u16::<LittleEndian>(config.port)?;

    // Replication rank, master ID
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u32::<LittleEndian>(0)?;

    Ok(buffer)
}

/// COM_BINLOG_DUMP 명령어 생성
fn create_binlog_dump_command(
    server_id: u32,
    binlog_filename: &str,
    binlog_position: u32,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    // COM_BINLOG_DUMP 명령어 코드
    buffer.write_u8(COM_BINLOG_DUMP)?;

    // Binlog position (4 bytes, little-endian)
    buffer.write_u32::<LittleEndian>(binlog_position)?;

    // Flags (2 bytes) - 0 이면 새 이벤트를 기다림
    buffer.write_u16::<LittleEndian>(0)?;

    // Server ID (4 bytes)
    buffer.write_u32::<LittleEndian>(server_id)?;

    // Binlog filename (패킷 끝까지)
    buffer.write_all(binlog_filename.as_bytes())?;

    debug!(
        "Created COM_BINLOG_DUMP command: server_id={}, file={}, position={}",
        server_id, binlog_filename, binlog_position
    );

    Ok(buffer)
}

/// COM_BINLOG_DUMP_GTID 명령어 생성
fn create_binlog_dump_gtid_command(server_id: u32, gtid_set: &MysqlGtidSet) -> Result<Vec<u8>> {
    let encoded = gtid_set.encode();
    let mut buffer = Vec::with_capacity(23 + encoded.len());

    buffer.write_u8(COM_BINLOG_DUMP_GTID)?;
    buffer.write_u16::<LittleEndian>(BINLOG_THROUGH_GTID)?;
    buffer.write_u32::<LittleEndian>(server_id)?;

    // 파일명 없음 (길이 0), 위치는 파일 시작
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u64::<LittleEndian>(u64::from(BINLOG_START_POSITION))?;

    buffer.write_u32::<LittleEndian>(encoded.len() as u32)?;
    buffer.write_all(&encoded)?;

    debug!(
        "Created COM_BINLOG_DUMP_GTID command: server_id={}, gtid_set={}",
        server_id, gtid_set
    );

    Ok(buffer)
}

#[cfg(test)]
pub(crate) mod testing {
    //! 복제 서버 역할을 하는 테스트용 상대편

    use crate::auth::MYSQL_NATIVE_PASSWORD;
    use crate::protocol::testing::{greeting_packet, ok_packet};
    use crate::protocol::{PacketChannel, COM_QUERY};

    /// greeting부터 dump 요청까지 서버 쪽 대화를 진행하고 받은 명령들을 반환
    ///
    /// COM_QUERY에는 모두 OK로 응답하고 dump 명령을 받으면 멈춥니다.
    pub async fn accept_sync(server: &mut PacketChannel) -> Vec<Vec<u8>> {
        let mut commands = Vec::new();

        server.write_packet(&greeting_packet(MYSQL_NATIVE_PASSWORD)).await.unwrap();
        commands.push(server.read_packet().await.unwrap().to_vec());
        server.write_packet(&ok_packet()).await.unwrap();

        loop {
            let command = server.read_packet().await.unwrap().to_vec();
            let code = command[0];
            commands.push(command);
            match code {
                0x12 | 0x1e => return commands,
                COM_QUERY | 0x15 => server.write_packet(&ok_packet()).await.unwrap(),
                other => panic!("unexpected command 0x{:02x}", other),
            }
        }
    }
}
