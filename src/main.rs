/// MySQL / MariaDB binlog 추적기
///
/// 환경 변수(DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_FLAVOR, DB_SERVER_ID, DB_TIMEOUT_SECS)로
/// 접속한 뒤 현재 위치부터 이벤트를 로그로 출력합니다. Ctrl-C로 멈추면 재시작 위치를 JSON으로 출력합니다.
use informer::connection::ConnectionConfig;
use informer::events::{Event, EventType};
use informer::source::MySqlSource;
use informer::tracer::Tracer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화 (RUST_LOG 미지정 시 info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ConnectionConfig::from_env()?;
    info!(
        "Connecting to {} as {} ({})",
        config.address(),
        config.username,
        config.flavor
    );

    let mut source = MySqlSource::connect(config).await?;
    let position = source.get_current_position().await?;

    // 위치 조회가 끝나면 명령 연결은 필요 없음
    source.close_command_connection().await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping");
            ctrl_c.cancel();
        }
    });

    let mut tracer = Tracer::new(Box::new(source));
    let mut event_count = 0u64;
    let summary = tracer
        .trace(&position, &cancel, |event| {
            event_count += 1;
            log_event(event_count, &event);
            Ok(())
        })
        .await?;

    info!(
        "Binlog streaming ended. Total events received: {}",
        summary.events
    );
    println!("{}", serde_json::to_string_pretty(&summary.position)?);

    Ok(())
}

fn log_event(count: u64, event: &Event) {
    let header = &event.header;
    info!(
        "📦 Event #{}: type={}, timestamp={}, server_id={}, size={}, pos={}, flags=0x{:04x}",
        count,
        header.event_type,
        header.timestamp,
        header.server_id,
        header.event_length,
        header.next_pos,
        header.flags
    );

    // 이벤트 타입별 추가 정보 출력
    match header.event_type {
        EventType::QueryEvent => info!("   → QUERY_EVENT detected (likely DDL or BEGIN/COMMIT)"),
        EventType::WriteRowsEvent => info!("   → WRITE_ROWS_EVENT detected (INSERT)"),
        EventType::UpdateRowsEvent => info!("   → UPDATE_ROWS_EVENT detected (UPDATE)"),
        EventType::DeleteRowsEvent => info!("   → DELETE_ROWS_EVENT detected (DELETE)"),
        EventType::TableMapEvent => info!("   → TABLE_MAP_EVENT detected (table schema info)"),
        EventType::GtidEvent | EventType::MariadbGtidEvent => info!("   → GTID_EVENT detected (transaction start)"),
        _ => {}
    }

    // Raw 데이터 출력 (처음 100바이트만)
    let display_len = std::cmp::min(100, event.payload.len());
    debug!(
        "   Raw data (first {} bytes): {:02x?}",
        display_len,
        &event.payload[..display_len]
    );
}
