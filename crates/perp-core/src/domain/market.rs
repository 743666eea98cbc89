//! 시장 데이터 타입.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLCV 캔들.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// 봉 시작 시간
    pub open_time: DateTime<Utc>,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 종가
    pub close: Decimal,
    /// 거래량 (기초자산 수량)
    pub volume: Decimal,
    /// 봉 마감 시간
    pub close_time: DateTime<Utc>,
}

/// 심볼별 시장 스냅샷.
///
/// 주변 시스템의 사전 수집 단계가 채워서 전달하는 동기 뷰입니다.
/// 지표 계산(ATR 등)은 외부 협력자의 몫이며 여기서는 값만 소비합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// 심볼
    pub symbol: String,
    /// 최근 캔들 (과거 → 최신 순)
    pub candles: Vec<Candle>,
    /// 현재가
    pub current_price: Decimal,
    /// 사전 계산된 ATR
    pub atr: Decimal,
    /// 일평균 거래대금 (USD)
    pub avg_daily_volume_usd: Decimal,
    /// 현재 펀딩 비율 (8시간 주기)
    pub funding_rate: Decimal,
    /// 스냅샷 시각
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// 최신 캔들 조회.
    pub fn latest_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }
}
