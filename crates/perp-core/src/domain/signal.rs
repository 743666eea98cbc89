//! 전략의 트레이딩 시그널.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::Direction;
use super::position::SetupParams;

/// 전략이 생성한 트레이딩 신호.
///
/// Coordinator는 이 신호를 리스크/펀딩 게이트에 통과시킨 뒤
/// `SetupParams`로 변환하여 상태 기계에 전달합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    /// 고유 신호 ID
    pub id: Uuid,
    /// 이 신호를 생성한 전략
    pub strategy_id: String,
    /// 거래 심볼
    pub symbol: String,
    /// 포지션 방향
    pub direction: Direction,
    /// 진입가
    pub entry_price: Decimal,
    /// 손절가
    pub sl_price: Decimal,
    /// 1차 익절가
    pub tp1_price: Decimal,
    /// TP1 부분 청산 비율 (%)
    pub tp1_qty_percent: Decimal,
    /// 트레일링 스톱 ATR 배수
    pub trail_atr_mult: Decimal,
    /// 타임 스톱 봉 수 (None이면 미사용)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_stop_bars: Option<u32>,
    /// 신호 신뢰도 (0.0 ~ 1.0)
    pub confidence: f64,
    /// 신호 생성 타임스탬프
    pub timestamp: DateTime<Utc>,
    /// 추가 메타데이터
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TradingSignal {
    /// 새 신호를 생성합니다.
    pub fn new(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: Decimal,
        sl_price: Decimal,
        tp1_price: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            direction,
            entry_price,
            sl_price,
            tp1_price,
            tp1_qty_percent: Decimal::from(30),
            trail_atr_mult: Decimal::TWO,
            time_stop_bars: None,
            confidence: 1.0,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// 신뢰도를 설정합니다.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// 타임 스톱을 설정합니다.
    pub fn with_time_stop(mut self, bars: u32) -> Self {
        self.time_stop_bars = Some(bars);
        self
    }

    /// 트레일링 ATR 배수를 설정합니다.
    pub fn with_trail_mult(mut self, mult: Decimal) -> Self {
        self.trail_atr_mult = mult;
        self
    }

    /// TP1 부분 청산 비율을 설정합니다.
    pub fn with_tp1_qty_percent(mut self, percent: Decimal) -> Self {
        self.tp1_qty_percent = percent;
        self
    }

    /// 상태 기계용 셋업 페이로드로 변환합니다.
    pub fn to_setup_params(&self) -> SetupParams {
        SetupParams {
            direction: self.direction,
            entry_price: self.entry_price,
            sl_price: self.sl_price,
            tp1_price: self.tp1_price,
            tp1_qty_percent: self.tp1_qty_percent,
            trail_atr_mult: self.trail_atr_mult,
            time_stop_bars: self.time_stop_bars,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_signal_builder() {
        let signal = TradingSignal::new(
            "trend_follow",
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(95),
            dec!(105),
        )
        .with_confidence(1.8)
        .with_time_stop(48);

        assert_eq!(signal.confidence, 1.0); // clamp
        assert_eq!(signal.time_stop_bars, Some(48));
        assert_eq!(signal.tp1_qty_percent, dec!(30));
    }

    #[test]
    fn test_to_setup_params() {
        let signal = TradingSignal::new(
            "trend_follow",
            "ETHUSDT",
            Direction::Short,
            dec!(2000),
            dec!(2100),
            dec!(1900),
        );
        let params = signal.to_setup_params();
        assert_eq!(params.direction, Direction::Short);
        assert_eq!(params.sl_price, dec!(2100));
        assert!(params.time_stop_bars.is_none());
    }
}
