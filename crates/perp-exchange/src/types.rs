//! 거래소 wire 타입.
//!
//! 무기한 선물 REST/WebSocket 응답을 표현하는 DTO와
//! 정밀도(tick/step) 반올림 유틸리티를 제공합니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// 주문 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// 반대 방향.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    /// 손절용 스톱 시장가
    StopMarket,
    /// 익절용 트리거 시장가
    TakeProfitMarket,
    /// 익절용 트리거 지정가
    TakeProfit,
}

impl OrderType {
    /// 익절 계열 주문인지 여부.
    pub fn is_take_profit(self) -> bool {
        matches!(self, Self::TakeProfitMarket | Self::TakeProfit)
    }

    /// 지정가 계열 주문인지 여부 (가격 근접 추론 대상).
    pub fn is_limit_like(self) -> bool {
        matches!(self, Self::Limit | Self::TakeProfit)
    }
}

/// 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// 더 이상 변하지 않는 종결 상태인지 여부.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }
}

/// 주문 요청.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// 기초자산 수량
    pub quantity: Decimal,
    /// 지정가 (LIMIT 계열만)
    pub price: Option<Decimal>,
    /// 트리거 가격 (STOP/TAKE_PROFIT 계열만)
    pub stop_price: Option<Decimal>,
    /// 포지션 축소 전용 여부 (청산 주문은 항상 true)
    pub reduce_only: bool,
}

impl OrderRequest {
    /// 시장가 주문.
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only: false,
        }
    }

    /// 지정가 주문.
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            reduce_only: false,
        }
    }

    /// 스톱 시장가 주문 (손절용).
    pub fn stop_market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::StopMarket,
            quantity,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
        }
    }

    /// 익절 트리거 시장가 주문.
    pub fn take_profit_market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::TakeProfitMarket,
            quantity,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
        }
    }

    /// 축소 전용 플래그 설정.
    pub fn with_reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }
}

/// 주문 조회 응답.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// 원주문 수량
    pub orig_qty: Decimal,
    /// 체결된 수량
    pub executed_qty: Decimal,
    /// 평균 체결가 (미체결 시 None)
    pub avg_price: Option<Decimal>,
    pub reduce_only: bool,
    pub update_time: DateTime<Utc>,
}

impl OrderInfo {
    /// 미체결 잔량.
    pub fn remaining_qty(&self) -> Decimal {
        self.orig_qty - self.executed_qty
    }

    /// 부분 체결 여부.
    pub fn is_partially_filled(&self) -> bool {
        self.executed_qty > Decimal::ZERO && self.executed_qty < self.orig_qty
    }
}

/// 거래소 측 포지션 스냅샷.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// 부호 있는 포지션 수량 (양수 = 롱, 음수 = 숏)
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
}

impl ExchangePosition {
    /// 포지션이 열려 있는지 여부.
    pub fn is_open(&self) -> bool {
        self.position_amt != Decimal::ZERO
    }
}

/// 계좌 잔고.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub balance: Decimal,
    pub available: Decimal,
}

/// 마크 가격 + 펀딩 정보.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: Decimal,
    /// 현재 펀딩 주기 요율
    pub funding_rate: Decimal,
    pub next_funding_time: DateTime<Utc>,
}

/// 펀딩 정산 내역 항목.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub symbol: String,
    pub funding_rate: Decimal,
    pub funding_time: DateTime<Utc>,
}

/// 심볼별 주문 정밀도 규칙.
///
/// 거래소는 tick/step에 맞지 않는 가격/수량을 거부하므로
/// 모든 주문 제출 전에 반올림해야 합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    /// 가격 최소 단위
    pub tick_size: Decimal,
    /// 수량 최소 단위
    pub step_size: Decimal,
    /// 주문 최소 명목가치 (USD)
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// 가격을 tick_size 배수로 반올림 (가장 가까운 tick).
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }

    /// 수량을 step_size 배수로 내림.
    ///
    /// 올림하면 잔고 초과 주문이 될 수 있으므로 항상 내림합니다.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return qty;
        }
        (qty / self.step_size).floor() * self.step_size
    }

    /// 주문이 최소 명목가치를 충족하는지 검증.
    pub fn check_notional(&self, qty: Decimal, price: Decimal) -> Result<(), ExchangeError> {
        let notional = qty * price;
        if notional < self.min_notional {
            return Err(ExchangeError::InvalidOrder(format!(
                "{} 명목가치 {}가 최소 {} 미만",
                self.symbol, notional, self.min_notional
            )));
        }
        Ok(())
    }
}
