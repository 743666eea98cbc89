//! 사용자 데이터 스트림 (주문 체결 이벤트).
//!
//! 거래소 WebSocket의 사용자 데이터 스트림을 래핑하여 주문 체결/취소
//! 이벤트를 `mpsc` 채널로 전달합니다.
//!
//! # 생명주기
//!
//! - listen key는 만료(60분)보다 훨씬 앞서 주기적으로 갱신합니다
//! - 연결이 끊기면 지수 백오프로 재연결하며, 시도 횟수는 상한이 있습니다
//! - `listenKeyExpired` 수신 시 새 key를 발급받아 즉시 재연결합니다
//!
//! # 사용 예제
//!
//! ```rust,ignore
//! let mut stream = UserDataStream::new(exchange, StreamConfig::default());
//! stream.start().await?;
//!
//! while let Some(event) = stream.next_event().await {
//!     match event {
//!         UserStreamEvent::OrderUpdate(update) => handle_fill(update),
//!         UserStreamEvent::Disconnected => warn!("스트림 끊김"),
//!         _ => {}
//!     }
//! }
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::client::FuturesExchange;
use crate::error::{ExchangeError, ExchangeResult};
use crate::retry::{with_retry, RetryConfig};
use crate::types::{OrderSide, OrderStatus, OrderType};

/// 스트림 설정.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket 기본 URL (listen key가 경로에 붙음)
    pub ws_base_url: String,
    /// listen key 갱신 주기 (만료 60분의 절반)
    pub keepalive_interval: Duration,
    /// 재연결 기본 대기 시간
    pub reconnect_base_delay: Duration,
    /// 재연결 최대 대기 시간
    pub reconnect_max_delay: Duration,
    /// 최대 재연결 시도 횟수
    pub max_reconnect_attempts: u32,
    /// 이벤트 채널 크기
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "wss://fstream.binance.com/ws".to_string(),
            keepalive_interval: Duration::from_secs(30 * 60),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            channel_capacity: 1024,
        }
    }
}

impl StreamConfig {
    /// 재연결 대기 시간 계산 (지수 백오프, 상한 적용).
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.min(16));
        let delay = self.reconnect_base_delay.saturating_mul(multiplier as u32);
        delay.min(self.reconnect_max_delay)
    }
}

/// 주문 상태 변경 이벤트.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdateEvent {
    pub symbol: String,
    pub order_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// 원주문 수량
    pub orig_qty: Decimal,
    /// 누적 체결 수량
    pub filled_qty: Decimal,
    /// 평균 체결가
    pub avg_price: Decimal,
    /// 마지막 체결가
    pub last_filled_price: Decimal,
    pub update_time: DateTime<Utc>,
}

/// 스트림에서 발행되는 이벤트.
#[derive(Debug, Clone, PartialEq)]
pub enum UserStreamEvent {
    /// 연결 수립
    Connected,
    /// 연결 끊김 (재연결 시도 중)
    Disconnected,
    /// 주문 상태 변경
    OrderUpdate(OrderUpdateEvent),
    /// listen key 만료 (내부적으로 재발급 후 재연결)
    ListenKeyExpired,
    /// 복구 불가 에러 (스트림 종료)
    Error(String),
}

// ===== wire 파싱 =====

#[derive(Debug, Deserialize)]
struct RawUserEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "o")]
    order: Option<RawOrderUpdate>,
}

#[derive(Debug, Deserialize)]
struct RawOrderUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "S")]
    side: OrderSide,
    #[serde(rename = "o")]
    order_type: OrderType,
    #[serde(rename = "X")]
    status: OrderStatus,
    #[serde(rename = "q")]
    orig_qty: Decimal,
    #[serde(rename = "z")]
    filled_qty: Decimal,
    #[serde(rename = "ap")]
    avg_price: Decimal,
    #[serde(rename = "L")]
    last_filled_price: Decimal,
    #[serde(rename = "T")]
    trade_time_ms: i64,
}

/// 수신 JSON을 스트림 이벤트로 변환.
///
/// 알 수 없는 이벤트 유형은 `None` (무시).
fn parse_user_event(text: &str) -> Option<UserStreamEvent> {
    let raw: RawUserEvent = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "파싱 불가 메시지 무시");
            return None;
        }
    };

    match raw.event_type.as_str() {
        "ORDER_TRADE_UPDATE" => {
            let o = raw.order?;
            Some(UserStreamEvent::OrderUpdate(OrderUpdateEvent {
                symbol: o.symbol,
                order_id: o.order_id.to_string(),
                side: o.side,
                order_type: o.order_type,
                status: o.status,
                orig_qty: o.orig_qty,
                filled_qty: o.filled_qty,
                avg_price: o.avg_price,
                last_filled_price: o.last_filled_price,
                update_time: DateTime::from_timestamp_millis(o.trade_time_ms)
                    .unwrap_or_else(Utc::now),
            }))
        }
        "listenKeyExpired" => Some(UserStreamEvent::ListenKeyExpired),
        _ => None,
    }
}

// ===== 스트림 본체 =====

/// 사용자 데이터 스트림.
pub struct UserDataStream {
    exchange: Arc<dyn FuturesExchange>,
    config: StreamConfig,
    event_rx: Option<mpsc::Receiver<UserStreamEvent>>,
    started: bool,
}

impl UserDataStream {
    /// 새 스트림 생성 (연결은 `start()` 호출 시).
    pub fn new(exchange: Arc<dyn FuturesExchange>, config: StreamConfig) -> Self {
        Self {
            exchange,
            config,
            event_rx: None,
            started: false,
        }
    }

    /// 스트림 시작.
    ///
    /// 연결/재연결 루프를 별도 태스크로 띄우고 즉시 반환합니다.
    pub async fn start(&mut self) -> ExchangeResult<()> {
        if self.started {
            return Ok(());
        }

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        self.event_rx = Some(event_rx);
        self.started = true;

        let exchange = Arc::clone(&self.exchange);
        let config = self.config.clone();

        tokio::spawn(async move {
            run_stream_loop(exchange, config, event_tx).await;
        });

        info!("사용자 데이터 스트림 시작됨");
        Ok(())
    }

    /// 시작 여부.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// 다음 이벤트 수신.
    pub async fn next_event(&mut self) -> Option<UserStreamEvent> {
        self.event_rx.as_mut()?.recv().await
    }
}

/// 세션 종료 사유.
enum SessionEnd {
    /// 연결 끊김 (백오프 후 재연결)
    Closed,
    /// listen key 만료 (즉시 재발급/재연결)
    Expired,
}

/// 연결/재연결 루프.
async fn run_stream_loop(
    exchange: Arc<dyn FuturesExchange>,
    config: StreamConfig,
    event_tx: mpsc::Sender<UserStreamEvent>,
) {
    let mut reconnect_attempts = 0u32;

    loop {
        match run_session(&exchange, &config, &event_tx).await {
            Ok(SessionEnd::Expired) => {
                // key 재발급은 다음 세션 시작 시 수행
                warn!("listen key 만료, 즉시 재연결");
                let _ = event_tx.send(UserStreamEvent::ListenKeyExpired).await;
                reconnect_attempts = 0;
                continue;
            }
            Ok(SessionEnd::Closed) => {
                warn!("사용자 데이터 스트림 연결 끊김");
            }
            Err(e) => {
                warn!(error = %e, "사용자 데이터 스트림 세션 실패");
            }
        }

        if event_tx.send(UserStreamEvent::Disconnected).await.is_err() {
            // 수신자가 사라졌으면 루프 종료
            return;
        }

        if reconnect_attempts >= config.max_reconnect_attempts {
            error!(
                attempts = reconnect_attempts,
                "최대 재연결 시도 초과, 스트림 종료"
            );
            let _ = event_tx
                .send(UserStreamEvent::Error("최대 재연결 시도 초과".to_string()))
                .await;
            return;
        }

        let delay = config.reconnect_delay(reconnect_attempts);
        reconnect_attempts += 1;
        info!(
            attempt = reconnect_attempts,
            delay_ms = delay.as_millis(),
            "재연결 대기 중"
        );
        tokio::time::sleep(delay).await;
    }
}

/// 단일 WebSocket 세션 실행.
///
/// listen key 발급 → 연결 → 이벤트 수신과 keepalive를 함께 처리합니다.
async fn run_session(
    exchange: &Arc<dyn FuturesExchange>,
    config: &StreamConfig,
    event_tx: &mpsc::Sender<UserStreamEvent>,
) -> ExchangeResult<SessionEnd> {
    let listen_key = with_retry(&RetryConfig::default(), || exchange.create_listen_key()).await?;

    let url = format!("{}/{}", config.ws_base_url, listen_key);
    let (ws, _) = connect_async(&url)
        .await
        .map_err(|e| ExchangeError::NetworkError(format!("WebSocket 연결 실패: {}", e)))?;
    let (mut write, mut read) = ws.split();

    info!("사용자 데이터 스트림 연결됨");
    let _ = event_tx.send(UserStreamEvent::Connected).await;

    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.tick().await; // 첫 tick은 즉시 발생하므로 소비

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_user_event(&text) {
                            Some(UserStreamEvent::ListenKeyExpired) => {
                                return Ok(SessionEnd::Expired);
                            }
                            Some(event) => {
                                if event_tx.send(event).await.is_err() {
                                    return Ok(SessionEnd::Closed);
                                }
                            }
                            None => {}
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            warn!(error = %e, "Pong 전송 실패");
                            return Ok(SessionEnd::Closed);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(ExchangeError::Disconnected(e.to_string()));
                    }
                }
            }
            _ = keepalive.tick() => {
                // 갱신 실패는 세션을 끊지 않음 (다음 주기에 재시도)
                if let Err(e) = exchange.keepalive_listen_key(&listen_key).await {
                    warn!(error = %e, "listen key 갱신 실패");
                } else {
                    debug!("listen key 갱신 완료");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_parse_order_trade_update() {
        let json = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000001000,
            "o": {
                "s": "BTCUSDT",
                "i": 8886774,
                "S": "SELL",
                "o": "STOP_MARKET",
                "X": "FILLED",
                "q": "0.010",
                "z": "0.010",
                "ap": "42995.5",
                "L": "42995.5",
                "T": 1700000001000
            }
        }"#;

        let event = parse_user_event(json).expect("파싱 실패");
        let UserStreamEvent::OrderUpdate(update) = event else {
            panic!("OrderUpdate가 아님");
        };
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.order_id, "8886774");
        assert_eq!(update.side, OrderSide::Sell);
        assert_eq!(update.order_type, OrderType::StopMarket);
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.filled_qty, dec!(0.010));
        assert_eq!(update.avg_price, dec!(42995.5));
    }

    #[test]
    fn test_parse_listen_key_expired() {
        let json = r#"{"e": "listenKeyExpired", "E": 1700000001000}"#;
        assert_eq!(
            parse_user_event(json),
            Some(UserStreamEvent::ListenKeyExpired)
        );
    }

    #[test]
    fn test_parse_unknown_event_ignored() {
        let json = r#"{"e": "MARGIN_CALL", "E": 1700000001000}"#;
        assert_eq!(parse_user_event(json), None);

        // JSON이 아닌 메시지도 무시
        assert_eq!(parse_user_event("not json"), None);
    }

    #[test]
    fn test_reconnect_delay_is_bounded() {
        let config = StreamConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(8));
        // 상한 적용
        assert_eq!(config.reconnect_delay(20), Duration::from_secs(60));
    }
}
