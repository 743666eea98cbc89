//! 진입 리스크 게이트.
//!
//! 전략 신호가 주문이 되기 전에 통과해야 하는 관문입니다:
//! 전략별/전체 동시 포지션 한도, 펀딩 비율 오버레이(차단 또는 SL 조임).
//! 청산 결과도 여기로 보고되어 운영 통계에 누적됩니다.

use std::collections::HashMap;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use perp_core::{Direction, TradingSignal};

use crate::config::RiskConfig;

/// 진입 거부 사유.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    /// 전략별 동시 포지션 한도 초과
    #[error("전략 {strategy_id} 동시 포지션 한도 초과 ({current}/{max})")]
    StrategyLimit {
        strategy_id: String,
        current: usize,
        max: usize,
    },

    /// 전체 동시 포지션 한도 초과
    #[error("전체 동시 포지션 한도 초과 ({current}/{max})")]
    GlobalLimit { current: usize, max: usize },

    /// 펀딩 비율이 포지션 방향에 과도하게 불리
    #[error("펀딩 비율 {rate}가 {direction} 진입에 불리 (한도 {threshold})")]
    FundingRate {
        rate: Decimal,
        direction: Direction,
        threshold: Decimal,
    },
}

/// 게이트 통과 시의 진입 보정.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryAdjustment {
    /// 펀딩 오버레이가 조정한 손절가 (조정 없으면 원래 값)
    pub sl_price: Decimal,
    /// SL 조임 적용 여부
    pub sl_tightened: bool,
}

/// 청산 결과 통계.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskStats {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_pnl: Decimal,
}

#[derive(Default)]
struct RiskState {
    /// 전략별 활성 포지션 수
    per_strategy: HashMap<String, usize>,
    /// 전체 활성 포지션 수
    total: usize,
    stats: RiskStats,
}

/// 리스크 관리자.
pub struct RiskManager {
    config: RiskConfig,
    state: RwLock<RiskState>,
}

impl RiskManager {
    /// 새 리스크 관리자 생성.
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RiskState::default()),
        }
    }

    /// 포지션 방향이 현재 펀딩을 지불하는지 여부.
    ///
    /// 롱은 양수 요율을, 숏은 음수 요율을 지불합니다.
    fn pays_funding(direction: Direction, funding_rate: Decimal) -> bool {
        match direction {
            Direction::Long => funding_rate > Decimal::ZERO,
            Direction::Short => funding_rate < Decimal::ZERO,
        }
    }

    /// 진입 게이트 검사.
    ///
    /// 통과 시 펀딩 오버레이가 보정한 손절가를 담은
    /// `EntryAdjustment`를 반환합니다.
    pub async fn check_entry(
        &self,
        signal: &TradingSignal,
        funding_rate: Decimal,
    ) -> Result<EntryAdjustment, RiskRejection> {
        let state = self.state.read().await;

        let strategy_count = state
            .per_strategy
            .get(&signal.strategy_id)
            .copied()
            .unwrap_or(0);
        if strategy_count >= self.config.max_positions_per_strategy {
            return Err(RiskRejection::StrategyLimit {
                strategy_id: signal.strategy_id.clone(),
                current: strategy_count,
                max: self.config.max_positions_per_strategy,
            });
        }

        if state.total >= self.config.max_total_positions {
            return Err(RiskRejection::GlobalLimit {
                current: state.total,
                max: self.config.max_total_positions,
            });
        }
        drop(state);

        // 펀딩 오버레이: 지불 방향일 때만 개입
        let mut sl_price = signal.sl_price;
        let mut sl_tightened = false;
        if Self::pays_funding(signal.direction, funding_rate) {
            let magnitude = funding_rate.abs();
            if magnitude >= self.config.funding_block_threshold {
                return Err(RiskRejection::FundingRate {
                    rate: funding_rate,
                    direction: signal.direction,
                    threshold: self.config.funding_block_threshold,
                });
            }
            if magnitude >= self.config.funding_block_threshold / Decimal::TWO {
                // SL 거리를 줄여 보유 비용이 커지기 전에 나가게 함
                let distance = signal.entry_price - signal.sl_price;
                sl_price = signal.entry_price
                    - distance * (Decimal::ONE - self.config.funding_sl_tighten_rate);
                sl_tightened = true;
                warn!(
                    symbol = %signal.symbol,
                    funding_rate = %funding_rate,
                    original_sl = %signal.sl_price,
                    tightened_sl = %sl_price,
                    "펀딩 오버레이로 SL 조임"
                );
            }
        }

        Ok(EntryAdjustment {
            sl_price,
            sl_tightened,
        })
    }

    /// 포지션 진입 등록.
    pub async fn register_entry(&self, strategy_id: &str) {
        let mut state = self.state.write().await;
        *state.per_strategy.entry(strategy_id.to_string()).or_insert(0) += 1;
        state.total += 1;
    }

    /// 포지션 청산 등록 및 결과 누적.
    pub async fn record_outcome(&self, strategy_id: &str, pnl: Decimal) {
        let mut state = self.state.write().await;
        if let Some(count) = state.per_strategy.get_mut(strategy_id) {
            *count = count.saturating_sub(1);
        }
        state.total = state.total.saturating_sub(1);

        state.stats.total_trades += 1;
        if pnl >= Decimal::ZERO {
            state.stats.wins += 1;
        } else {
            state.stats.losses += 1;
        }
        state.stats.total_pnl += pnl;

        info!(
            strategy_id,
            pnl = %pnl,
            total_pnl = %state.stats.total_pnl,
            "청산 결과 기록"
        );
    }

    /// 누적 통계 조회.
    pub async fn stats(&self) -> RiskStats {
        self.state.read().await.stats.clone()
    }

    /// 현재 활성 포지션 수.
    pub async fn active_count(&self) -> usize {
        self.state.read().await.total
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn long_signal(strategy: &str) -> TradingSignal {
        TradingSignal::new(strategy, "BTCUSDT", Direction::Long, dec!(100), dec!(95), dec!(105))
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig {
            max_positions_per_strategy: 2,
            max_total_positions: 3,
            funding_block_threshold: dec!(0.003),
            funding_sl_tighten_rate: dec!(0.3),
        })
    }

    #[tokio::test]
    async fn test_strategy_limit() {
        let risk = manager();
        risk.register_entry("s1").await;
        risk.register_entry("s1").await;

        let rejected = risk.check_entry(&long_signal("s1"), Decimal::ZERO).await;
        assert!(matches!(rejected, Err(RiskRejection::StrategyLimit { .. })));

        // 다른 전략은 통과
        assert!(risk.check_entry(&long_signal("s2"), Decimal::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_global_limit() {
        let risk = manager();
        risk.register_entry("s1").await;
        risk.register_entry("s2").await;
        risk.register_entry("s3").await;

        let rejected = risk.check_entry(&long_signal("s4"), Decimal::ZERO).await;
        assert!(matches!(rejected, Err(RiskRejection::GlobalLimit { .. })));
    }

    #[tokio::test]
    async fn test_funding_blocks_paying_direction_only() {
        let risk = manager();

        // 롱 + 높은 양수 요율 = 지불 → 차단
        let rejected = risk.check_entry(&long_signal("s1"), dec!(0.004)).await;
        assert!(matches!(rejected, Err(RiskRejection::FundingRate { .. })));

        // 롱 + 음수 요율 = 수취 → 통과, 조정 없음
        let passed = risk
            .check_entry(&long_signal("s1"), dec!(-0.004))
            .await
            .unwrap();
        assert!(!passed.sl_tightened);
        assert_eq!(passed.sl_price, dec!(95));
    }

    #[tokio::test]
    async fn test_funding_tightens_sl_below_block() {
        let risk = manager();

        // 차단 한도 미만, 절반 이상 → SL 조임
        let adjusted = risk
            .check_entry(&long_signal("s1"), dec!(0.002))
            .await
            .unwrap();
        assert!(adjusted.sl_tightened);
        // 거리 5 → 5 * (1 - 0.3) = 3.5, SL = 96.5
        assert_eq!(adjusted.sl_price, dec!(96.5));
    }

    #[tokio::test]
    async fn test_outcome_frees_slot_and_accumulates() {
        let risk = manager();
        risk.register_entry("s1").await;
        risk.register_entry("s1").await;
        assert!(risk.check_entry(&long_signal("s1"), Decimal::ZERO).await.is_err());

        risk.record_outcome("s1", dec!(12.5)).await;
        risk.record_outcome("s1", dec!(-4)).await;

        // 슬롯 반환
        assert!(risk.check_entry(&long_signal("s1"), Decimal::ZERO).await.is_ok());

        let stats = risk.stats().await;
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.total_pnl, dec!(8.5));
    }
}
