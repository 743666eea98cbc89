//! 무기한 선물 거래소 추상화.
//!
//! REST 주문/조회 trait(`FuturesExchange`), 사용자 데이터 스트림,
//! 재시도 유틸리티, TTL 캐시를 제공합니다. 거래소 중립적으로 설계되어
//! 실거래 커넥터와 테스트용 Mock 모두 같은 인터페이스를 사용합니다.

pub mod cache;
pub mod client;
pub mod error;
pub mod retry;
pub mod stream;
pub mod types;

pub use cache::SymbolCache;
pub use client::FuturesExchange;
pub use error::{ExchangeError, ExchangeResult};
pub use retry::{with_retry, RetryConfig};
pub use stream::{OrderUpdateEvent, StreamConfig, UserDataStream, UserStreamEvent};
pub use types::{
    AccountBalance, ExchangePosition, FundingPayment, OrderInfo, OrderRequest, OrderSide,
    OrderStatus, OrderType, PremiumIndex, SymbolFilters,
};
