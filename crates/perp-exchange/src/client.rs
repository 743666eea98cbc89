//! 거래소 REST 작업 trait.
//!
//! 실거래 커넥터와 테스트용 Mock이 공유하는 거래소 중립 인터페이스입니다.
//! 모든 작업은 `ExchangeError`로 실패를 분류하여 반환하며, 재시도 정책은
//! 호출자(`with_retry`)가 결정합니다.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ExchangeResult;
use chrono::{DateTime, Utc};

use crate::types::{
    AccountBalance, ExchangePosition, FundingPayment, OrderInfo, OrderRequest, PremiumIndex,
    SymbolFilters,
};

/// 무기한 선물 거래소 REST 인터페이스.
#[async_trait]
pub trait FuturesExchange: Send + Sync {
    /// 현재가 조회.
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// 마크 가격 + 펀딩 정보 조회.
    async fn get_premium_index(&self, symbol: &str) -> ExchangeResult<PremiumIndex>;

    /// 기간 내 펀딩 정산 내역 조회 (시간 오름차순).
    async fn get_funding_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExchangeResult<Vec<FundingPayment>>;

    /// 심볼 정밀도 규칙 조회.
    async fn get_symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters>;

    /// 자산별 잔고 조회.
    async fn get_balance(&self, asset: &str) -> ExchangeResult<AccountBalance>;

    /// 심볼의 현재 포지션 조회 (포지션 없으면 `None`).
    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<ExchangePosition>>;

    /// 미체결 주문 목록 조회.
    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderInfo>>;

    /// 주문 단건 조회.
    async fn get_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderInfo>;

    /// 주문 제출.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderInfo>;

    /// 주문 취소.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// 심볼의 모든 미체결 주문 취소.
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    /// 사용자 데이터 스트림 listen key 발급.
    async fn create_listen_key(&self) -> ExchangeResult<String>;

    /// listen key 유효기간 연장.
    async fn keepalive_listen_key(&self, listen_key: &str) -> ExchangeResult<()>;

    /// 거래소 이름.
    fn exchange_name(&self) -> &str;
}
