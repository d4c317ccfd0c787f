//! 이벤트 스트림
//!
//! 한 번에 이벤트 하나를 꺼내는 pull 방식입니다. 백그라운드 태스크나 선행 읽기는 없습니다.
//! 취소는 `CancellationToken`으로 협조적으로 처리하며, 취소되어도 연결은 유지됩니다.

use crate::binlog::{strip_checksum, BinlogParser};
use crate::binlog_client::SyncSession;
use crate::connection::Flavor;
use crate::error::{CdcError, Result};
use crate::events::{Event, EventType};
use crate::gtid::{GtidSet, MariadbGtid};
use crate::position::{BinlogPosition, Position};
use crate::protocol::{self, PacketChannel, ServerError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// 이벤트를 순서대로 하나씩 꺼내는 스트림
///
/// 단일 소비자 전용입니다 (`&mut self`).
#[async_trait]
pub trait EventStream: Send {
    /// 다음 이벤트를 기다림
    ///
    /// - 토큰이 취소되면 `CdcError::Cancelled`
    /// - 연결 실패, 서버 에러, 잘못된 이벤트는 `CdcError::StreamReadError`이며
    ///   이후 모든 호출도 실패합니다
    async fn next_event(&mut self, cancel: &CancellationToken) -> Result<Event>;

    /// 마지막으로 전달한 이벤트 이후의 재시작 위치
    fn position(&self) -> Position;
}

/// 소스당 하나의 활성 스트림을 보장하는 표시
///
/// 스트림이 실패하거나 drop되면 해제됩니다.
#[derive(Debug)]
pub struct SessionGuard {
    active: Option<Arc<AtomicBool>>,
}

impl SessionGuard {
    /// 비어 있으면 점유. 이미 사용 중이면 None
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionGuard {
                active: Some(Arc::clone(flag)),
            })
    }

    pub fn release(&mut self) {
        if let Some(flag) = self.active.take() {
            flag.store(false, Ordering::Release);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// 커밋을 기다리는 GTID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingGtid {
    MySql { sid: Uuid, sequence: u64 },
    MariaDb(MariadbGtid),
}

/// 스트림 진행 위치 추적
#[derive(Debug, Clone)]
struct StreamProgress {
    position: Position,
    pending_gtid: Option<PendingGtid>,
    /// BEGIN 이후 아직 커밋되지 않은 트랜잭션 안에 있음
    in_transaction: bool,
}

impl StreamProgress {
    fn new(start: Position) -> Self {
        StreamProgress {
            position: start,
            pending_gtid: None,
            in_transaction: false,
        }
    }

    fn set_binlog(&mut self, binlog: BinlogPosition) {
        let previous = std::mem::replace(&mut self.position, Position::Binlog(binlog.clone()));
        if let Position::Gtid(gtid) | Position::Both { gtid, .. } = previous {
            self.position = Position::Both { binlog, gtid };
        }
    }

    fn advance_offset(&mut self, next_pos: u32) {
        if let Position::Binlog(binlog) | Position::Both { binlog, .. } = &mut self.position {
            binlog.position = next_pos;
        }
    }

    /// 트랜잭션 커밋 시 대기 중인 GTID를 집합에 추가
    fn commit(&mut self) {
        self.in_transaction = false;
        let Some(pending) = self.pending_gtid.take() else {
            return;
        };

        // 좌표로 시작한 스트림은 적용된 전체 집합을 모르므로 GTID를 추적하지 않음
        let (Position::Gtid(gtid_set) | Position::Both { gtid: gtid_set, .. }) = &mut self.position
        else {
            return;
        };

        match (gtid_set, pending) {
            (GtidSet::MySql(set), PendingGtid::MySql { sid, sequence }) => {
                if let Err(e) = set.add_gtid(sid, sequence) {
                    warn!("Ignoring invalid GTID {}:{}: {}", sid, sequence, e);
                }
            }
            (GtidSet::MariaDb(set), PendingGtid::MariaDb(gtid)) => set.add_gtid(gtid),
            (set, pending) => {
                warn!("GTID {:?} does not match {} GTID set", pending, set.flavor());
            }
        }
    }
}

/// Binlog 복제 연결 위의 이벤트 스트림
pub struct BinlogStream {
    channel: PacketChannel,
    flavor: Flavor,
    pending_packet: Option<Bytes>,
    progress: StreamProgress,
    checksum_len: usize,
    failure: Option<String>,
    session: SessionGuard,
    event_count: u64,
}

impl BinlogStream {
    pub fn new(session: SyncSession, flavor: Flavor, start: Position, guard: SessionGuard) -> Self {
        BinlogStream {
            channel: session.channel,
            flavor,
            pending_packet: Some(session.first_packet),
            progress: StreamProgress::new(start),
            checksum_len: 0,
            failure: None,
            session: guard,
            event_count: 0,
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// 지금까지 전달한 이벤트 수
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// 스트림을 실패 상태로 전환. 이후 모든 호출이 실패하고 세션 표시가 해제됨
    fn fail(&mut self, err: CdcError) -> CdcError {
        let message = match err {
            CdcError::StreamReadError(message) => message,
            other => other.to_string(),
        };
        error!("Binlog stream failed: {}", message);
        self.failure = Some(message.clone());
        self.session.release();
        CdcError::StreamReadError(message)
    }

    fn decode(&mut self, packet: Bytes) -> Result<Event> {
        match packet.first().copied() {
            Some(0x00) => {}
            Some(0xFF) => {
                let err = ServerError::parse(&packet)?;
                return Err(CdcError::StreamReadError(format!("Server reported error: {}", err)));
            }
            _ if protocol::is_eof_packet(&packet) => {
                return Err(CdcError::StreamReadError(
                    "Server ended the binlog stream".to_string(),
                ));
            }
            other => {
                return Err(CdcError::StreamReadError(format!(
                    "Unexpected packet in binlog stream: {:?}",
                    other
                )));
            }
        }

        // 첫 바이트 0x00은 OK 표시, 실제 이벤트 데이터는 그 다음부터
        let event = BinlogParser::parse_event(packet.slice(1..))
            .map_err(|e| CdcError::StreamReadError(format!("Malformed event: {}", e)))?;
        self.track(&event)
            .map_err(|e| CdcError::StreamReadError(format!("Malformed {} event: {}", event.event_type(), e)))?;

        Ok(event)
    }

    /// 재시작 위치 갱신
    fn track(&mut self, event: &Event) -> Result<()> {
        let header = &event.header;
        let body = strip_checksum(&event.payload, self.checksum_len);

        match header.event_type {
            EventType::FormatDescriptionEvent => {
                self.checksum_len = BinlogParser::checksum_len(&event.payload);
                return Ok(());
            }
            EventType::RotateEvent => {
                let rotate = BinlogParser::parse_rotate_event(body)?;
                let position = u32::try_from(rotate.position).map_err(|_| {
                    CdcError::ProtocolError(format!("Rotate position out of range: {}", rotate.position))
                })?;
                self.progress
                    .set_binlog(BinlogPosition::new(rotate.next_binlog_name, position));
                return Ok(());
            }
            EventType::GtidEvent => {
                let gtid = BinlogParser::parse_gtid_event(body)?;
                self.progress.pending_gtid = Some(PendingGtid::MySql {
                    sid: gtid.sid,
                    sequence: gtid.sequence,
                });
                self.progress.in_transaction = false;
            }
            EventType::MariadbGtidEvent => {
                let gtid = BinlogParser::parse_mariadb_gtid_event(body, header.server_id)?;
                self.progress.pending_gtid = Some(PendingGtid::MariaDb(gtid.gtid));
                // FL_STANDALONE이 없으면 GTID 이벤트가 BEGIN을 대신함
                self.progress.in_transaction = !gtid.standalone;
            }
            EventType::XidEvent | EventType::TransactionPayloadEvent => self.progress.commit(),
            EventType::QueryEvent => {
                let query = BinlogParser::parse_query_event(body)?;
                let statement = query.query.trim();
                if statement.eq_ignore_ascii_case("BEGIN") {
                    self.progress.in_transaction = true;
                } else if statement.eq_ignore_ascii_case("COMMIT")
                    || statement.eq_ignore_ascii_case("ROLLBACK")
                    || !self.progress.in_transaction
                {
                    self.progress.commit();
                }
            }
            _ => {}
        }

        if header.next_pos != 0 && !header.is_artificial() {
            self.progress.advance_offset(header.next_pos);
        }

        Ok(())
    }
}

#[async_trait]
impl EventStream for BinlogStream {
    async fn next_event(&mut self, cancel: &CancellationToken) -> Result<Event> {
        if let Some(reason) = &self.failure {
            return Err(CdcError::StreamReadError(format!(
                "Stream already failed: {}",
                reason
            )));
        }

        if cancel.is_cancelled() {
            return Err(CdcError::Cancelled);
        }

        let packet = match self.pending_packet.take() {
            Some(packet) => packet,
            None => {
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.channel.read_packet() => Some(result),
                };

                match read {
                    None => {
                        debug!("Binlog read cancelled");
                        return Err(CdcError::Cancelled);
                    }
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => return Err(self.fail(e)),
                }
            }
        };

        match self.decode(packet) {
            Ok(event) => {
                self.event_count += 1;
                debug!(
                    "Event #{}: type={}, next_pos={}",
                    self.event_count,
                    event.event_type(),
                    event.header.next_pos
                );
                Ok(event)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn position(&self) -> Position {
        self.progress.position.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::testing::*;
    use crate::gtid::MysqlGtidSet;
    use crate::protocol::testing::error_packet;
    use tokio_test::{assert_pending, assert_ready, task};

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn event_packet(event_type: u8, next_pos: u32, flags: u16, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x00];
        packet.extend(event_bytes(event_type, next_pos, flags, body));
        packet
    }

    fn fake_rotate(filename: &str) -> Vec<u8> {
        event_packet(4, 0, 0x20, &rotate_body(filename, 4))
    }

    /// 서버 쪽 채널과 함께 스트림 생성
    fn stream_with(start: Position, first_packet: Vec<u8>) -> (BinlogStream, PacketChannel, Arc<AtomicBool>) {
        stream_with_flavor(Flavor::MySql, start, first_packet)
    }

    fn stream_with_flavor(
        flavor: Flavor,
        start: Position,
        first_packet: Vec<u8>,
    ) -> (BinlogStream, PacketChannel, Arc<AtomicBool>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let flag = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::acquire(&flag).unwrap();
        let session = SyncSession {
            channel: PacketChannel::new(client),
            first_packet: Bytes::from(first_packet),
        };
        let stream = BinlogStream::new(session, flavor, start, guard);
        (stream, PacketChannel::new(server), flag)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let start = Position::Binlog(BinlogPosition::new("bin.000003", 157));
        let (mut stream, mut server, _flag) = stream_with(start, fake_rotate("bin.000003"));
        let cancel = CancellationToken::new();

        server.write_packet(&event_packet(30, 300, 0, &[1])).await.unwrap();
        server.write_packet(&event_packet(31, 400, 0, &[2])).await.unwrap();
        server.write_packet(&event_packet(32, 500, 0, &[3])).await.unwrap();

        assert_eq!(
            stream.next_event(&cancel).await.unwrap().event_type(),
            EventType::RotateEvent
        );
        let types: Vec<EventType> = [
            stream.next_event(&cancel).await.unwrap(),
            stream.next_event(&cancel).await.unwrap(),
            stream.next_event(&cancel).await.unwrap(),
        ]
        .iter()
        .map(Event::event_type)
        .collect();

        assert_eq!(
            types,
            vec![
                EventType::WriteRowsEvent,
                EventType::UpdateRowsEvent,
                EventType::DeleteRowsEvent
            ]
        );
        assert_eq!(stream.event_count(), 4);
        assert_eq!(
            stream.position(),
            Position::Binlog(BinlogPosition::new("bin.000003", 500))
        );
    }

    #[tokio::test]
    async fn test_cancel_before_event() {
        let start = Position::Binlog(BinlogPosition::new("bin.000003", 157));
        let (mut stream, mut server, _flag) = stream_with(start, fake_rotate("bin.000003"));
        let cancel = CancellationToken::new();

        // 미리 읽어 둔 첫 패킷 소비
        stream.next_event(&cancel).await.unwrap();

        {
            let mut pull = task::spawn(stream.next_event(&cancel));
            assert_pending!(pull.poll());

            cancel.cancel();
            assert!(pull.is_woken());
            let result = assert_ready!(pull.poll());
            assert!(matches!(result, Err(CdcError::Cancelled)));
        }

        // 취소 후에도 스트림은 그대로 사용 가능
        assert!(!stream.is_failed());
        let cancel = CancellationToken::new();
        server.write_packet(&event_packet(16, 600, 0, &[0u8; 8])).await.unwrap();
        assert_eq!(
            stream.next_event(&cancel).await.unwrap().event_type(),
            EventType::XidEvent
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_keeps_first_packet() {
        let start = Position::Binlog(BinlogPosition::new("bin.000003", 157));
        let (mut stream, _server, _flag) = stream_with(start, fake_rotate("bin.000003"));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(stream.next_event(&cancelled).await.unwrap_err().is_cancelled());

        let event = stream.next_event(&CancellationToken::new()).await.unwrap();
        assert_eq!(event.event_type(), EventType::RotateEvent);
    }

    #[tokio::test]
    async fn test_connection_drop_is_terminal() {
        let start = Position::Binlog(BinlogPosition::new("bin.000003", 157));
        let (mut stream, mut server, flag) = stream_with(start, fake_rotate("bin.000003"));
        let cancel = CancellationToken::new();

        server.write_packet(&event_packet(30, 300, 0, &[1])).await.unwrap();
        stream.next_event(&cancel).await.unwrap();
        stream.next_event(&cancel).await.unwrap();
        drop(server);

        let err = stream.next_event(&cancel).await.unwrap_err();
        assert!(err.is_terminal_for_stream());
        assert!(!flag.load(Ordering::Acquire));

        // 실패 이후의 호출도 실패
        let err = stream.next_event(&cancel).await.unwrap_err();
        assert!(matches!(err, CdcError::StreamReadError(_)));
    }

    #[tokio::test]
    async fn test_server_error_packet_is_terminal() {
        let start = Position::Binlog(BinlogPosition::new("bin.000003", 157));
        let (mut stream, mut server, _flag) = stream_with(start, fake_rotate("bin.000003"));
        let cancel = CancellationToken::new();

        stream.next_event(&cancel).await.unwrap();
        server
            .write_packet(&error_packet(1236, "binlog truncated in the middle of event"))
            .await
            .unwrap();
        server.write_packet(&event_packet(30, 300, 0, &[1])).await.unwrap();

        assert!(stream.next_event(&cancel).await.unwrap_err().is_terminal_for_stream());
        assert!(stream.next_event(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_packet_is_terminal() {
        let start = Position::Binlog(BinlogPosition::new("bin.000003", 157));
        let (mut stream, _server, _flag) = stream_with(start, vec![0xFE, 0x00, 0x00, 0x02, 0x00]);

        let err = stream.next_event(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_terminal_for_stream());
    }

    #[tokio::test]
    async fn test_position_follows_rotate_and_gtid_commit() {
        let sid = Uuid::parse_str(SID).unwrap();
        let start = Position::Both {
            binlog: BinlogPosition::new("bin.000003", 157),
            gtid: GtidSet::parse(Flavor::MySql, &format!("{}:1-23", SID)).unwrap(),
        };
        let (mut stream, mut server, _flag) = stream_with(start, fake_rotate("bin.000004"));
        let cancel = CancellationToken::new();

        server.write_packet(&event_packet(33, 300, 0, &gtid_body(sid, 24))).await.unwrap();
        server.write_packet(&event_packet(2, 380, 0, &query_body("shop", "BEGIN"))).await.unwrap();
        server.write_packet(&event_packet(30, 450, 0, &[1, 2, 3])).await.unwrap();

        for _ in 0..4 {
            stream.next_event(&cancel).await.unwrap();
        }

        // 커밋 전에는 GTID 집합이 그대로
        let expected: GtidSet = GtidSet::MySql(MysqlGtidSet::parse(&format!("{}:1-23", SID)).unwrap());
        assert_eq!(stream.position().gtid_set(), Some(&expected));
        assert_eq!(
            stream.position().binlog(),
            Some(&BinlogPosition::new("bin.000004", 450))
        );

        server.write_packet(&event_packet(16, 481, 0, &[0u8; 8])).await.unwrap();
        stream.next_event(&cancel).await.unwrap();

        let position = stream.position();
        assert_eq!(position.binlog(), Some(&BinlogPosition::new("bin.000004", 481)));
        assert_eq!(position.gtid_set().map(ToString::to_string), Some(format!("{}:1-24", SID)));
    }

    #[tokio::test]
    async fn test_statement_inside_transaction_does_not_commit_gtid() {
        let sid = Uuid::parse_str(SID).unwrap();
        let start = Position::Both {
            binlog: BinlogPosition::new("bin.000003", 157),
            gtid: GtidSet::parse(Flavor::MySql, &format!("{}:1-23", SID)).unwrap(),
        };
        let (mut stream, mut server, _flag) = stream_with(start, fake_rotate("bin.000003"));
        let cancel = CancellationToken::new();

        server.write_packet(&event_packet(33, 300, 0, &gtid_body(sid, 24))).await.unwrap();
        server.write_packet(&event_packet(2, 380, 0, &query_body("shop", "BEGIN"))).await.unwrap();
        server
            .write_packet(&event_packet(2, 470, 0, &query_body("shop", "INSERT INTO t VALUES (1)")))
            .await
            .unwrap();

        for _ in 0..4 {
            stream.next_event(&cancel).await.unwrap();
        }
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some(format!("{}:1-23", SID))
        );

        server.write_packet(&event_packet(16, 501, 0, &[0u8; 8])).await.unwrap();
        stream.next_event(&cancel).await.unwrap();
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some(format!("{}:1-24", SID))
        );
    }

    #[tokio::test]
    async fn test_commit_query_and_transaction_payload_commit_gtid() {
        let sid = Uuid::parse_str(SID).unwrap();
        let start = Position::Gtid(GtidSet::parse(Flavor::MySql, &format!("{}:1-23", SID)).unwrap());
        let (mut stream, mut server, _flag) = stream_with(start, fake_rotate("bin.000003"));
        let cancel = CancellationToken::new();

        // 비트랜잭션 엔진: BEGIN ... COMMIT 쿼리
        server.write_packet(&event_packet(33, 300, 0, &gtid_body(sid, 24))).await.unwrap();
        server.write_packet(&event_packet(2, 380, 0, &query_body("shop", "BEGIN"))).await.unwrap();
        server
            .write_packet(&event_packet(2, 470, 0, &query_body("shop", "UPDATE t SET a = 1")))
            .await
            .unwrap();
        server.write_packet(&event_packet(2, 540, 0, &query_body("shop", "COMMIT"))).await.unwrap();

        for _ in 0..5 {
            stream.next_event(&cancel).await.unwrap();
        }
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some(format!("{}:1-24", SID))
        );

        // 압축된 트랜잭션은 payload 이벤트 하나로 끝남
        server.write_packet(&event_packet(33, 620, 0, &gtid_body(sid, 25))).await.unwrap();
        server.write_packet(&event_packet(40, 900, 0, &[0u8; 16])).await.unwrap();
        stream.next_event(&cancel).await.unwrap();
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some(format!("{}:1-24", SID))
        );
        stream.next_event(&cancel).await.unwrap();
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some(format!("{}:1-25", SID))
        );
    }

    fn mariadb_start() -> Position {
        Position::Both {
            binlog: BinlogPosition::new("mariadb-bin.000002", 4),
            gtid: GtidSet::parse(Flavor::MariaDb, "0-1-100").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_mariadb_transaction_commits_on_xid() {
        let (mut stream, mut server, _flag) =
            stream_with_flavor(Flavor::MariaDb, mariadb_start(), fake_rotate("mariadb-bin.000002"));
        let cancel = CancellationToken::new();

        server
            .write_packet(&event_packet(162, 300, 0, &mariadb_gtid_body(0, 101, 0)))
            .await
            .unwrap();
        server
            .write_packet(&event_packet(2, 400, 0, &query_body("shop", "INSERT INTO t VALUES (1)")))
            .await
            .unwrap();

        for _ in 0..3 {
            stream.next_event(&cancel).await.unwrap();
        }
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some("0-1-100".to_string())
        );

        server.write_packet(&event_packet(16, 431, 0, &[0u8; 8])).await.unwrap();
        stream.next_event(&cancel).await.unwrap();

        let position = stream.position();
        assert_eq!(position.gtid_set().map(ToString::to_string), Some("0-1-101".to_string()));
        assert_eq!(
            position.binlog(),
            Some(&BinlogPosition::new("mariadb-bin.000002", 431))
        );
    }

    #[tokio::test]
    async fn test_mariadb_standalone_ddl_commits_on_query() {
        let (mut stream, mut server, _flag) =
            stream_with_flavor(Flavor::MariaDb, mariadb_start(), fake_rotate("mariadb-bin.000002"));
        let cancel = CancellationToken::new();

        server
            .write_packet(&event_packet(162, 300, 0, &mariadb_gtid_body(0, 101, 1)))
            .await
            .unwrap();
        server
            .write_packet(&event_packet(2, 420, 0, &query_body("shop", "CREATE TABLE t (id INT)")))
            .await
            .unwrap();

        for _ in 0..3 {
            stream.next_event(&cancel).await.unwrap();
        }
        assert_eq!(stream.flavor(), Flavor::MariaDb);
        assert_eq!(
            stream.position().gtid_set().map(ToString::to_string),
            Some("0-1-101".to_string())
        );
    }

    #[test]
    fn test_session_guard() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::acquire(&flag).unwrap();
        assert!(SessionGuard::acquire(&flag).is_none());

        drop(guard);
        assert!(SessionGuard::acquire(&flag).is_some());
    }
}
