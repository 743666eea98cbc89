//! 포지션 생명주기 엔진 오케스트레이션.
//!
//! 이 crate는 다음을 제공합니다:
//! - [`Coordinator`]: 봉 마감 틱 처리와 액션 실행
//! - [`ReconciliationHandler`]: 주문 스트림 정합성 보정
//! - [`RiskManager`]: 진입 게이트와 성과 집계
//! - [`EntryLock`]: 분산 진입 락 (Redis / 인메모리)

pub mod config;
pub mod coordinator;
pub mod lock;
pub mod reconciliation;
pub mod risk;

pub use config::{EngineConfig, EntryConfig, ReconciliationConfig, RiskConfig};
pub use coordinator::{Coordinator, EngineStatus};
pub use lock::{EntryLock, LockError, MemoryEntryLock, RedisEntryLock};
pub use reconciliation::{FillReason, ReconciliationHandler};
pub use risk::{EntryAdjustment, RiskManager, RiskRejection, RiskStats};

/// 전역 tracing 구독자 초기화.
///
/// `RUST_LOG` 환경 변수를 존중하며, 미설정 시 `info`로 동작합니다.
/// 프로세스당 한 번만 호출해야 합니다.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
