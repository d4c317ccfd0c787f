//! 소스에서 스트림을 열고 이벤트를 호출자에게 넘기는 루프

use crate::error::{CdcError, Result};
use crate::events::Event;
use crate::position::Position;
use crate::source::EventSource;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 취소로 끝난 추적의 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    /// 전달한 이벤트 수
    pub events: u64,
    /// 다음에 이어서 읽을 위치
    pub position: Position,
}

pub struct Tracer {
    source: Box<dyn EventSource>,
}

impl Tracer {
    pub fn new(source: Box<dyn EventSource>) -> Self {
        Tracer { source }
    }

    /// `position`에서 스트림을 하나 열고, 취소되거나 스트림이 끝날 때까지 이벤트를 `sink`로 전달
    ///
    /// 취소되면 `Ok(TraceSummary)`를 반환합니다. 그 외의 에러(`sink`의 에러 포함)는 그대로 반환하며,
    /// 재시작 위치는 로그로 남깁니다.
    pub async fn trace<F>(
        &mut self,
        position: &Position,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> Result<TraceSummary>
    where
        F: FnMut(Event) -> Result<()>,
    {
        let mut stream = self.source.start_stream(position).await?;
        info!("Tracing from {}", position);

        let mut events = 0u64;
        loop {
            let event = match stream.next_event(cancel).await {
                Ok(event) => event,
                Err(CdcError::Cancelled) => {
                    let position = stream.position();
                    info!("Trace cancelled after {} events, resume from {}", events, position);
                    return Ok(TraceSummary { events, position });
                }
                Err(e) => {
                    warn!(
                        "Trace stopped after {} events: {}. Resume from {}",
                        events,
                        e,
                        stream.position()
                    );
                    return Err(e);
                }
            };

            events += 1;
            if let Err(e) = sink(event) {
                warn!(
                    "Event sink failed after {} events: {}. Resume from {}",
                    events,
                    e,
                    stream.position()
                );
                return Err(e);
            }
        }
    }
}
