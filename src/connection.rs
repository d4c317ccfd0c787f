//! MySQL 데이터베이스 연결 관리
//!
//! 연결 설정, 주소 구성, 그리고 상태 조회용 명령 연결(command connection)을 다룹니다.
//! 복제 스트림용 연결은 `binlog_client` 모듈이 따로 엽니다.

use crate::error::{CdcError, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row, Value};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// 포트가 지정되지 않은 주소에 쓰는 기본 포트
pub const DEFAULT_PORT: u16 = 3306;

/// 서버 종류. 상태 조회 필드와 GTID 형식이 달라집니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    MySql,
    MariaDb,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::MySql => "mysql",
            Flavor::MariaDb => "mariadb",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavor {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(Flavor::MySql),
            "mariadb" => Ok(Flavor::MariaDb),
            other => Err(CdcError::ConfigError(format!(
                "Unknown flavor '{}', expected 'mysql' or 'mariadb'",
                other
            ))),
        }
    }
}

/// 실제로 접속할 대상
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Socket(String),
}

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    /// 0이면 `hostname`을 주소로 그대로 사용
    pub port: u16,
    pub username: String,
    pub password: String,
    pub flavor: Flavor,
    /// 0이면 연결 시 임의의 0이 아닌 값으로 정해짐
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: "root".to_string(),
            password: String::new(),
            flavor: Flavor::MySql,
            server_id: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// 환경 변수에서 설정 읽기
    ///
    /// `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_FLAVOR`, `DB_SERVER_ID`,
    /// `DB_TIMEOUT_SECS`. 없는 값은 기본값을 씁니다.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ConnectionConfig::default();

        if let Some(host) = lookup("DB_HOST") {
            config.hostname = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            config.port = parse_var("DB_PORT", &port)?;
        }
        if let Some(user) = lookup("DB_USER") {
            config.username = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            config.password = password;
        }
        if let Some(flavor) = lookup("DB_FLAVOR") {
            config.flavor = flavor.parse()?;
        }
        if let Some(server_id) = lookup("DB_SERVER_ID") {
            config.server_id = parse_var("DB_SERVER_ID", &server_id)?;
        }
        if let Some(secs) = lookup("DB_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(parse_var("DB_TIMEOUT_SECS", &secs)?);
        }

        Ok(config)
    }

    /// 접속 주소. 포트가 0이면 호스트 문자열을 그대로 사용
    pub fn address(&self) -> String {
        if self.port != 0 {
            format!("{}:{}", self.hostname, self.port)
        } else {
            self.hostname.clone()
        }
    }

    /// 주소를 실제 접속 대상으로 해석
    ///
    /// 포트가 0이고 호스트에 '/'가 있으면 Unix 소켓 경로로 봅니다.
    pub fn endpoint(&self) -> Endpoint {
        if self.port != 0 {
            return Endpoint::Tcp {
                host: self.hostname.clone(),
                port: self.port,
            };
        }

        let address = self.hostname.as_str();
        if address.contains('/') {
            return Endpoint::Socket(address.to_string());
        }

        // "host:port" 형태면 분리, 아니면 기본 포트
        match address.split_once(':') {
            Some((host, port)) if !port.contains(':') => match port.parse::<u16>() {
                Ok(port) => Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                },
                Err(_) => Endpoint::Tcp {
                    host: address.to_string(),
                    port: DEFAULT_PORT,
                },
            },
            _ => Endpoint::Tcp {
                host: address.to_string(),
                port: DEFAULT_PORT,
            },
        }
    }

    /// server_id가 0이면 임의의 0이 아닌 값으로 채운 설정을 반환
    pub fn with_resolved_server_id(mut self) -> Self {
        if self.server_id == 0 {
            self.server_id = rand::thread_rng().gen_range(1..=u32::MAX);
            debug!("Assigned random server_id {}", self.server_id);
        }
        self
    }

    fn build_opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .prefer_socket(false);

        let builder = match self.endpoint() {
            Endpoint::Tcp { host, port } => builder.ip_or_hostname(host).tcp_port(port),
            Endpoint::Socket(path) => builder.socket(Some(path)),
        };

        Opts::from(builder)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CdcError::ConfigError(format!("Invalid value for {}: '{}'", name, value)))
}

/// 상태 조회용 MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
    flavor: Flavor,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let address = config.address();
        let opts = config.build_opts();

        let conn = tokio::time::timeout(config.timeout, Conn::new(opts))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!("Timed out connecting to MySQL at {}", address))
            })?
            .map_err(|e| {
                CdcError::ConnectionError(format!("Failed to connect to MySQL at {}: {}", address, e))
            })?;

        info!("Command connection established to {}", address);
        Ok(MySqlConnection {
            conn,
            flavor: config.flavor,
        })
    }

    /// Binlog 상태 조회
    ///
    /// MySQL 8.2 이상은 `SHOW BINARY LOG STATUS`, 그 이전 서버와 MariaDB는
    /// `SHOW MASTER STATUS`를 사용합니다.
    pub async fn get_binlog_status(&mut self) -> Result<BinlogStatus> {
        let row = match self.flavor {
            Flavor::MySql => match self.status_row("SHOW BINARY LOG STATUS").await {
                Err(StatusQueryError::Server(e)) => {
                    debug!("SHOW BINARY LOG STATUS rejected ({}), falling back", e);
                    self.status_row("SHOW MASTER STATUS").await
                }
                other => other,
            },
            Flavor::MariaDb => self.status_row("SHOW MASTER STATUS").await,
        }
        .map_err(|e| CdcError::QueryError(format!("Failed to query binlog status: {}", e)))?;

        let row = row.ok_or_else(|| {
            CdcError::ProtocolError("No binlog status available (is binary logging enabled?)".to_string())
        })?;

        let mut status = BinlogStatus::decode(&row)?;
        if self.flavor == Flavor::MariaDb {
            status.executed_gtid_set = self.get_mariadb_gtid_pos().await?;
        }
        Ok(status)
    }

    async fn status_row(&mut self, query: &str) -> std::result::Result<Option<StatusRow>, StatusQueryError> {
        debug!("Running '{}'", query);
        let row: Option<Row> = self.conn.query_first(query).await.map_err(|e| match e {
            mysql_async::Error::Server(err) => StatusQueryError::Server(err.to_string()),
            other => StatusQueryError::Other(other.to_string()),
        })?;
        Ok(row.as_ref().map(StatusRow::from_row))
    }

    /// MariaDB의 현재 GTID 위치
    async fn get_mariadb_gtid_pos(&mut self) -> Result<Option<String>> {
        let result: Option<Option<String>> = self
            .conn
            .query_first("SELECT @@GLOBAL.gtid_binlog_pos")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query gtid_binlog_pos: {}", e)))?;

        Ok(result.flatten())
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to close command connection: {}", e)))
    }
}

enum StatusQueryError {
    Server(String),
    Other(String),
}

impl fmt::Display for StatusQueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusQueryError::Server(msg) | StatusQueryError::Other(msg) => f.write_str(msg),
        }
    }
}

/// 상태 조회 결과 한 행 (컬럼명 → 텍스트 값)
#[derive(Debug, Clone, Default)]
pub struct StatusRow {
    columns: BTreeMap<String, Option<String>>,
}

impl StatusRow {
    pub fn from_row(row: &Row) -> Self {
        let mut columns = BTreeMap::new();
        for (idx, column) in row.columns_ref().iter().enumerate() {
            let value = row.as_ref(idx).and_then(value_to_text);
            columns.insert(column.name_str().to_string(), value);
        }
        StatusRow { columns }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        StatusRow {
            columns: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }

    /// 컬럼이 있으면 Some(값), 없으면 None
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.columns.get(name).map(|v| v.as_deref())
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        other => Some(other.as_sql(true)),
    }
}

/// Binlog 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u32,
    /// 서버가 보고한 GTID 집합 텍스트 (없거나 기능이 꺼져 있으면 None 또는 빈 문자열)
    pub executed_gtid_set: Option<String>,
}

impl BinlogStatus {
    /// File, Position은 필수. 나머지는 없어도 됨
    pub fn decode(row: &StatusRow) -> Result<Self> {
        let file = match row.get("File") {
            Some(Some(file)) if !file.is_empty() => file.to_string(),
            _ => {
                return Err(CdcError::ProtocolError(
                    "Binlog status is missing the 'File' column".to_string(),
                ))
            }
        };

        let position = match row.get("Position") {
            Some(Some(pos)) => pos.trim().parse::<u32>().map_err(|_| {
                CdcError::ProtocolError(format!("Binlog status has an invalid 'Position': '{}'", pos))
            })?,
            _ => {
                return Err(CdcError::ProtocolError(
                    "Binlog status is missing the 'Position' column".to_string(),
                ))
            }
        };

        Ok(BinlogStatus {
            file,
            position,
            executed_gtid_set: row.get("Executed_Gtid_Set").flatten().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.flavor, Flavor::MySql);
        assert_eq!(config.server_id, 0);
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "root");
    }

    #[test]
    fn test_address_with_port() {
        for (host, port) in [("localhost", 3306u16), ("10.0.0.7", 3307), ("db.internal", 1)] {
            let mut config = ConnectionConfig::new(host, "root");
            config.port = port;
            assert_eq!(config.address(), format!("{}:{}", host, port));
            assert_eq!(
                config.endpoint(),
                Endpoint::Tcp {
                    host: host.to_string(),
                    port
                }
            );
        }
    }

    #[test]
    fn test_address_without_port_is_verbatim() {
        for host in ["/var/run/mysqld/mysqld.sock", "db.internal:3307", "localhost"] {
            let mut config = ConnectionConfig::new(host, "root");
            config.port = 0;
            assert_eq!(config.address(), host);
        }
    }

    #[test]
    fn test_endpoint_without_port() {
        let mut config = ConnectionConfig::new("/tmp/mysql.sock", "root");
        config.port = 0;
        assert_eq!(config.endpoint(), Endpoint::Socket("/tmp/mysql.sock".to_string()));

        config.hostname = "db.internal:3307".to_string();
        assert_eq!(
            config.endpoint(),
            Endpoint::Tcp {
                host: "db.internal".to_string(),
                port: 3307
            }
        );

        config.hostname = "db.internal".to_string();
        assert_eq!(
            config.endpoint(),
            Endpoint::Tcp {
                host: "db.internal".to_string(),
                port: DEFAULT_PORT
            }
        );
    }

    #[test]
    fn test_resolved_server_id() {
        let config = ConnectionConfig::default().with_resolved_server_id();
        assert_ne!(config.server_id, 0);

        let mut fixed = ConnectionConfig::default();
        fixed.server_id = 42;
        assert_eq!(fixed.with_resolved_server_id().server_id, 42);
    }

    #[test]
    fn test_flavor_parse() {
        assert_eq!("mysql".parse::<Flavor>().unwrap(), Flavor::MySql);
        assert_eq!("MariaDB".parse::<Flavor>().unwrap(), Flavor::MariaDb);
        assert!("postgres".parse::<Flavor>().is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: BTreeMap<&str, &str> = [
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "0"),
            ("DB_FLAVOR", "mariadb"),
            ("DB_SERVER_ID", "1001"),
        ]
        .into_iter()
        .collect();

        let config = ConnectionConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.address(), "db.internal");
        assert_eq!(config.flavor, Flavor::MariaDb);
        assert_eq!(config.server_id, 1001);
        assert_eq!(config.username, "root");

        let bad = ConnectionConfig::from_lookup(|key| (key == "DB_PORT").then(|| "abc".to_string()));
        assert!(matches!(bad, Err(CdcError::ConfigError(_))));
    }

    #[test]
    fn test_binlog_status_decode() {
        let row = StatusRow::from_pairs([
            ("File", Some("bin.000003")),
            ("Position", Some("157")),
            ("Binlog_Do_DB", Some("")),
            ("Binlog_Ignore_DB", Some("")),
            ("Executed_Gtid_Set", Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5")),
        ]);

        let status = BinlogStatus::decode(&row).unwrap();
        assert_eq!(status.file, "bin.000003");
        assert_eq!(status.position, 157);
        assert_eq!(
            status.executed_gtid_set.as_deref(),
            Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5")
        );
    }

    #[test]
    fn test_binlog_status_without_gtid_column() {
        let row = StatusRow::from_pairs([("File", Some("mysql-bin.000001")), ("Position", Some("4"))]);
        let status = BinlogStatus::decode(&row).unwrap();
        assert_eq!(status.executed_gtid_set, None);
    }

    #[test]
    fn test_binlog_status_missing_fields() {
        let no_file = StatusRow::from_pairs([("Position", Some("4"))]);
        assert!(matches!(BinlogStatus::decode(&no_file), Err(CdcError::ProtocolError(_))));

        let null_pos = StatusRow::from_pairs([("File", Some("bin.000001")), ("Position", None::<&str>)]);
        assert!(matches!(BinlogStatus::decode(&null_pos), Err(CdcError::ProtocolError(_))));

        let bad_pos = StatusRow::from_pairs([("File", Some("bin.000001")), ("Position", Some("-1"))]);
        assert!(matches!(BinlogStatus::decode(&bad_pos), Err(CdcError::ProtocolError(_))));

        let too_big = StatusRow::from_pairs([("File", Some("bin.000001")), ("Position", Some("4294967296"))]);
        assert!(matches!(BinlogStatus::decode(&too_big), Err(CdcError::ProtocolError(_))));
    }
}
