//! 포지션 생명주기 엔진의 핵심 도메인.
//!
//! 이 crate는 다음을 제공합니다:
//! - 포지션 생명주기 상태 기계 (순수 함수, I/O 없음)
//! - 상태/실행 컨텍스트 도메인 타입
//! - 전략/시세/영속성 협력자 trait
//!
//! # 예제
//!
//! ```rust,ignore
//! use perp_core::{process_transition, PositionEvent, PositionStateContext};
//!
//! let ctx = PositionStateContext::new("BTCUSDT", "trend_follow", 4);
//! let result = process_transition(&ctx, &PositionEvent::BarClose);
//! assert!(!result.transitioned); // IDLE은 BAR_CLOSE를 무시
//! ```

pub mod domain;
pub mod state_machine;

// 주요 타입 재내보내기
pub use domain::execution::{
    position_pnl, CloseResult, Direction, FundingCostResult, PositionContext, SlUpdateResult,
    TransitionAction,
};
pub use domain::market::{Candle, MarketSnapshot};
pub use domain::position::{
    ExitReason, PositionEvent, PositionState, PositionStateContext, SetupParams,
};
pub use domain::provider::{
    MarketDataSource, MemoryPositionStore, PositionRecord, PositionStore, ProviderError,
    StoreError, Strategy,
};
pub use domain::signal::TradingSignal;
pub use state_machine::{compute_trailing_stop, process_transition, TransitionResult};
