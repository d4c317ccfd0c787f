//! MySQL 인증 처리
//!
//! `mysql_native_password`와 `caching_sha2_password`의 빠른 인증(fast auth) 경로를 지원합니다.
//! `caching_sha2_password`의 전체 인증은 TLS나 RSA 키 교환이 필요하므로 지원하지 않습니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    // XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 인증 응답 생성
///
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn create_sha2_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = sha256(password.as_bytes());
    let stage2 = sha256(&stage1);

    let mut combined = stage2;
    combined.extend_from_slice(scramble);
    let stage3 = sha256(&combined);

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// 플러그인 이름에 맞는 인증 응답 생성
pub fn scramble_password(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        MYSQL_NATIVE_PASSWORD | "" => Ok(create_auth_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(create_sha2_auth_response(password, scramble)),
        other => Err(CdcError::ConnectionError(format!(
            "Unsupported authentication plugin: {}",
            other
        ))),
    }
}

/// SHA1 해시 계산 (SHA1을 사용하는 것이 MySQL native password의 표준)
fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    scramble: &[u8],
    collation: u8,
    plugin: &str,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    // Client capability flags (4 bytes)
    let capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    buffer.write_u32::<LittleEndian>(capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    // Character set (1 byte)
    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    // Authentication response
    let plugin = if plugin.is_empty() { MYSQL_NATIVE_PASSWORD } else { plugin };
    let auth_response = scramble_password(plugin, password, scramble)?;
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    // Authentication plugin name (null-terminated)
    buffer.write_all(plugin.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// 서버의 인증 방식 변경 요청 (0xFE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&0xFE) {
            return Err(CdcError::ProtocolError("Not an auth switch request".to_string()));
        }

        let rest = &data[1..];
        let name_end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            CdcError::ProtocolError("Auth switch request without plugin name".to_string())
        })?;
        let plugin = String::from_utf8_lossy(&rest[..name_end]).to_string();

        let mut scramble = rest[name_end + 1..].to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }

        Ok(AuthSwitchRequest { plugin, scramble })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRAMBLE: [u8; 8] = [0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29];

    #[test]
    fn test_create_auth_response_empty_password() {
        let response = create_auth_response("", &[1, 2, 3, 4]);
        assert!(response.is_empty());
        assert!(create_sha2_auth_response("", &[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_create_auth_response() {
        let response = create_auth_response("password", &SCRAMBLE);
        assert_eq!(response.len(), 20); // SHA1 produces 20 bytes
        assert_ne!(response, create_auth_response("password", &[0u8; 8]));
    }

    #[test]
    fn test_create_sha2_auth_response() {
        let response = create_sha2_auth_response("password", &SCRAMBLE);
        assert_eq!(response.len(), 32);
    }

    #[test]
    fn test_scramble_password_unknown_plugin() {
        let err = scramble_password("sha256_password", "pw", &SCRAMBLE).unwrap_err();
        assert!(matches!(err, CdcError::ConnectionError(_)));
    }

    #[test]
    fn test_create_handshake_response() {
        let packet =
            create_handshake_response("root", "password", &SCRAMBLE, 33, MYSQL_NATIVE_PASSWORD)
                .unwrap();

        // 4 + 4 + 1 + 23 + "root\0" + 1 + 20 + "mysql_native_password\0"
        assert_eq!(packet.len(), 32 + 5 + 1 + 20 + 22);
        assert_eq!(&packet[32..37], b"root\0");
        assert!(packet.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_auth_switch_parse() {
        let mut data = vec![0xFE];
        data.extend_from_slice(b"mysql_native_password\0");
        data.extend_from_slice(&SCRAMBLE);
        data.push(0);

        let request = AuthSwitchRequest::parse(&data).unwrap();
        assert_eq!(request.plugin, MYSQL_NATIVE_PASSWORD);
        assert_eq!(request.scramble, SCRAMBLE.to_vec());
    }
}
