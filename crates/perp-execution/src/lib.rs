//! 포지션 액션 실행기.
//!
//! 상태 기계가 발행한 `TransitionAction`을 실제 부수효과로 옮기는
//! 레이어입니다. 두 백엔드가 동일한 `ActionExecutor` 계약을 구현합니다:
//!
//! - `SimulatedExecutor`: 백테스트용 가상 체결 (슬리피지/수수료 모델)
//! - `LiveExecutor`: 실거래소 주문 제출 (정밀도 반올림, 재시도,
//!   reduce-only 청산)
//!
//! 동일한 전략 코드가 두 백엔드 사이를 전환할 수 있도록
//! 동작 일치(behavioral parity)가 계약의 핵심입니다.

pub mod executor;
pub mod funding;
pub mod live_executor;
pub mod simulated_executor;

pub use executor::ActionExecutor;
pub use funding::{elapsed_funding_periods, funding_cost, FUNDING_PERIOD_HOURS};
pub use live_executor::{LiveExecutor, LiveExecutorConfig};
pub use simulated_executor::{SimulatedExecutor, SimulatedExecutorConfig, SimulatedMarket};
