//! MySQL 프로토콜 패킷 처리
//!
//! mysql-binlog-connector-java의 PacketChannel과 같은 역할을 합니다.
//! 읽기는 내부 버퍼에 쌓은 뒤 완성된 패킷만 꺼내므로 취소에 안전합니다
//! (`read_packet` future를 중간에 버려도 다음 호출이 이어서 읽음).

use crate::connection::Endpoint;
use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// COM_QUERY 명령어 코드
pub const COM_QUERY: u8 = 0x03;

/// 한 물리 패킷의 최대 본문 길이. 이 길이면 다음 패킷이 이어짐
pub const MAX_PACKET_LEN: usize = 0xFF_FF_FF;

const PACKET_HEADER_LEN: usize = 4;
const BUFFER_SIZE: usize = 8192;

/// 패킷 채널이 감쌀 수 있는 바이트 스트림
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// MySQL 패킷 채널
pub struct PacketChannel {
    stream: Box<dyn Transport>,
    buffer: BytesMut,
    sequence: u8,
}

impl PacketChannel {
    pub fn new<S: Transport + 'static>(stream: S) -> Self {
        PacketChannel {
            stream: Box::new(stream),
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            sequence: 0,
        }
    }

    /// 새 패킷 채널 생성 (TCP 또는 Unix 소켓 연결)
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let connect = async {
            match endpoint {
                Endpoint::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    stream.set_nodelay(true)?;
                    Ok::<_, io::Error>(PacketChannel::new(stream))
                }
                Endpoint::Socket(path) => connect_socket(path).await,
            }
        };

        let channel = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| CdcError::ConnectionError(format!("Timed out connecting to {:?}", endpoint)))?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {:?}: {}", endpoint, e)))?;

        debug!("Connected to MySQL at {:?}", endpoint);
        Ok(channel)
    }

    /// 새 명령을 보내기 전에 시퀀스 번호 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 논리 패킷 하나 읽기 (최대 길이 패킷은 이어붙임)
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        loop {
            if let Some(packet) = self.parse_packet() {
                return Ok(packet);
            }

            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet: {}", e)))?;

            if read == 0 {
                return Err(CdcError::IoError(if self.buffer.is_empty() {
                    "Connection closed by server".to_string()
                } else {
                    "Connection closed in the middle of a packet".to_string()
                }));
            }
        }
    }

    fn parse_packet(&mut self) -> Option<Bytes> {
        // 완성된 논리 패킷이 버퍼에 있는지 먼저 확인
        let mut offset = 0;
        let mut last_sequence;
        loop {
            if self.buffer.len() < offset + PACKET_HEADER_LEN {
                return None;
            }
            let header = &self.buffer[offset..offset + PACKET_HEADER_LEN];
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            last_sequence = header[3];

            if self.buffer.len() < offset + PACKET_HEADER_LEN + length {
                return None;
            }
            offset += PACKET_HEADER_LEN + length;

            if length < MAX_PACKET_LEN {
                break;
            }
        }

        let mut frames = self.buffer.split_to(offset);
        let mut packet = BytesMut::with_capacity(offset);
        while frames.has_remaining() {
            let length = u32::from_le_bytes([frames[0], frames[1], frames[2], 0]) as usize;
            frames.advance(PACKET_HEADER_LEN);
            packet.extend_from_slice(&frames.split_to(length));
        }

        self.sequence = last_sequence.wrapping_add(1);
        Some(packet.freeze())
    }

    /// 패킷 쓰기 (최대 길이를 넘으면 나눠서 전송)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_LEN).peekable();
        let needs_trailer = data.len() % MAX_PACKET_LEN == 0;

        let mut frame = Vec::with_capacity(data.len().min(MAX_PACKET_LEN) + PACKET_HEADER_LEN);
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            frame.clear();
            frame.write_u24::<LittleEndian>(chunk.len() as u32)?;
            WriteBytesExt::write_u8(&mut frame, self.sequence)?;
            frame.extend_from_slice(chunk);
            self.sequence = self.sequence.wrapping_add(1);

            self.stream
                .write_all(&frame)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to write packet: {}", e)))?;

            if chunks.peek().is_none() && (!needs_trailer || chunk.is_empty()) {
                break;
            }
        }

        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;

        Ok(())
    }

    /// COM_QUERY 전송 후 OK/ERR 응답 확인 (결과 집합이 없는 문장 전용)
    pub async fn execute(&mut self, query: &str) -> Result<()> {
        let mut packet = Vec::with_capacity(query.len() + 1);
        packet.push(COM_QUERY);
        packet.extend_from_slice(query.as_bytes());

        self.reset_sequence();
        self.write_packet(&packet).await?;

        let response = self.read_packet().await?;
        if is_error_packet(&response) {
            let err = ServerError::parse(&response)?;
            return Err(CdcError::QueryError(format!("'{}' failed: {}", query, err)));
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn connect_socket(path: &str) -> io::Result<PacketChannel> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(PacketChannel::new(stream))
}

#[cfg(not(unix))]
async fn connect_socket(path: &str) -> io::Result<PacketChannel> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("Unix sockets are not supported on this platform: {}", path),
    ))
}

/// Greeting 패킷 파싱
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);

        // Protocol version (1 byte)
        let protocol_version = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read protocol version: {}", e)))?;

        // Server version (null-terminated string)
        let server_version = read_null_terminated_string(&mut cursor)?;

        // Thread ID (4 bytes)
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read thread ID: {}", e)))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble_part1 = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble_part1)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 1: {}", e)))?;

        // Filler (1 byte, always 0x00)
        ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read filler: {}", e)))?;

        // Capability flags (lower 2 bytes)
        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities: {}", e)))?;

        // Character set (1 byte)
        let server_collation = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read collation: {}", e)))?;

        // Status flags (2 bytes)
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read status: {}", e)))?;

        // Capability flags (upper 2 bytes)
        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities upper: {}", e)))?;

        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        // Length of auth plugin data (1 byte)
        let auth_data_len = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read auth data length: {}", e)))?;

        // Reserved (10 bytes)
        let mut reserved = vec![0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read reserved: {}", e)))?;

        // Auth plugin data part 2 (at least 13 bytes)
        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        Read::read_exact(&mut cursor, &mut scramble_part2)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 2: {}", e)))?;

        // Combine scramble parts
        let mut scramble = scramble_part1;
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]); // 마지막 null byte 제외

        // Auth plugin name (종료 null이 없는 서버도 있음)
        let rest = &data[cursor.position() as usize..];
        let name_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let auth_plugin_name = String::from_utf8_lossy(&rest[..name_end]).to_string();

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = ReadBytesExt::read_u8(reader)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| CdcError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// 서버 ERR 패킷 내용
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub state: Option<String>,
    pub message: String,
}

impl ServerError {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_error_packet(data) || data.len() < 3 {
            return Err(CdcError::ProtocolError("Not an error packet".to_string()));
        }

        let code = u16::from_le_bytes([data[1], data[2]]);
        let rest = &data[3..];
        let (state, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
            (
                Some(String::from_utf8_lossy(&rest[1..6]).to_string()),
                &rest[6..],
            )
        } else {
            (None, rest)
        };

        Ok(ServerError {
            code,
            state,
            message: String::from_utf8_lossy(message).to_string(),
        })
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => write!(f, "ERROR {} ({}): {}", self.code, state, self.message),
            None => write!(f, "ERROR {}: {}", self.code, self.message),
        }
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE, 패킷 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

#[cfg(test)]
pub(crate) mod testing {
    //! 테스트용 서버 패킷 생성기

    use crate::auth::capabilities;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    pub const SCRAMBLE: [u8; 20] = [
        0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x01, 0x02, 0x03, 0x04, 0x05,
    ];

    pub fn greeting_packet(plugin: &str) -> Vec<u8> {
        let caps = capabilities::LONG_PASSWORD
            | capabilities::PROTOCOL_41
            | capabilities::SECURE_CONNECTION
            | capabilities::PLUGIN_AUTH;

        let mut packet = Vec::new();
        packet.write_u8(10).unwrap();
        packet.write_all(b"8.0.36\0").unwrap();
        packet.write_u32::<LittleEndian>(77).unwrap();
        packet.write_all(&SCRAMBLE[..8]).unwrap();
        packet.write_u8(0).unwrap();
        packet.write_u16::<LittleEndian>(caps as u16).unwrap();
        packet.write_u8(33).unwrap();
        packet.write_u16::<LittleEndian>(2).unwrap();
        packet.write_u16::<LittleEndian>((caps >> 16) as u16).unwrap();
        packet.write_u8(21).unwrap();
        packet.write_all(&[0u8; 10]).unwrap();
        packet.write_all(&SCRAMBLE[8..]).unwrap();
        packet.write_u8(0).unwrap();
        packet.write_all(plugin.as_bytes()).unwrap();
        packet.write_u8(0).unwrap();
        packet
    }

    pub fn ok_packet() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    pub fn error_packet(code: u16, message: &str) -> Vec<u8> {
        let mut packet = vec![0xFF];
        packet.write_u16::<LittleEndian>(code).unwrap();
        packet.write_all(b"#HY000").unwrap();
        packet.write_all(message.as_bytes()).unwrap();
        packet
    }
}
