//! 시뮬레이션 실행기.
//!
//! 백테스트에서 사용하는 가상 체결 실행기입니다. 실제 거래소 API를
//! 호출하지 않고 내부 상태만 갱신하며, `ActionExecutor` trait을
//! 구현하여 실거래와 동일한 인터페이스를 제공합니다.
//!
//! # 체결 비용 모델
//!
//! 슬리피지는 최근 변동성(ATR)과 주문 크기 대비 일평균 거래대금(ADV)
//! 비율에 비례하여 커집니다. 스톱 계열 청산(손절/트레일링)은 스톱이
//! 트리거되는 순간의 변동성이 더 높다고 보고 추가 불리 배수를
//! 적용하며, 갭 보정이 켜져 있으면 요청 가격과 현재가 중 더 불리한
//! 쪽에서 체결합니다.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;

use perp_core::{
    CloseResult, Direction, ExitReason, FundingCostResult, PositionContext, SlUpdateResult,
};

use crate::executor::{
    apply_trailing_ratchet, settle_close, validate_close_percent, ActionExecutor,
};
use crate::funding::{elapsed_funding_periods, funding_cost};

/// 시뮬레이션 체결 비용 설정.
#[derive(Debug, Clone)]
pub struct SimulatedExecutorConfig {
    /// 수수료율 (체결 명목가치 기준)
    pub commission_rate: Decimal,
    /// 기본 슬리피지율
    pub base_slippage_rate: Decimal,
    /// ATR 비례 슬리피지 계수 (atr/price에 곱함)
    pub atr_slippage_factor: Decimal,
    /// 주문크기/ADV 비례 슬리피지 계수
    pub adv_impact_factor: Decimal,
    /// 스톱 계열 청산의 추가 불리 배수
    pub stop_adverse_multiplier: Decimal,
    /// 갭 보정 사용 여부 (스톱 청산 시 요청가와 현재가 중 불리한 쪽)
    pub gap_adjustment: bool,
    /// 주기당 고정 펀딩 요율
    pub funding_rate: Decimal,
}

impl Default for SimulatedExecutorConfig {
    fn default() -> Self {
        Self {
            commission_rate: dec!(0.0004),
            base_slippage_rate: dec!(0.0002),
            atr_slippage_factor: dec!(0.1),
            adv_impact_factor: dec!(0.1),
            stop_adverse_multiplier: dec!(1.5),
            gap_adjustment: true,
            funding_rate: dec!(0.0001),
        }
    }
}

impl SimulatedExecutorConfig {
    /// 마찰 비용 없는 설정 (계약 동작 검증용).
    pub fn frictionless() -> Self {
        Self {
            commission_rate: Decimal::ZERO,
            base_slippage_rate: Decimal::ZERO,
            atr_slippage_factor: Decimal::ZERO,
            adv_impact_factor: Decimal::ZERO,
            stop_adverse_multiplier: Decimal::ONE,
            gap_adjustment: false,
            funding_rate: Decimal::ZERO,
        }
    }
}

/// 심볼별 시장 상태 (백테스트 루프가 봉마다 갱신).
#[derive(Debug, Clone)]
pub struct SimulatedMarket {
    pub price: Decimal,
    pub atr: Decimal,
    pub avg_daily_volume_usd: Decimal,
}

/// 시뮬레이션 거래 기록.
#[derive(Debug, Clone)]
pub struct SimulatedTrade {
    pub symbol: String,
    pub reason: ExitReason,
    pub execution_price: Decimal,
    pub closed_size_usd: Decimal,
    pub pnl: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// 시뮬레이션 실행기.
pub struct SimulatedExecutor {
    config: SimulatedExecutorConfig,
    markets: RwLock<HashMap<String, SimulatedMarket>>,
    trades: RwLock<Vec<SimulatedTrade>>,
}

impl SimulatedExecutor {
    /// 새 시뮬레이션 실행기 생성.
    pub fn new(config: SimulatedExecutorConfig) -> Self {
        Self {
            config,
            markets: RwLock::new(HashMap::new()),
            trades: RwLock::new(Vec::new()),
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults() -> Self {
        Self::new(SimulatedExecutorConfig::default())
    }

    /// 설정 조회.
    pub fn config(&self) -> &SimulatedExecutorConfig {
        &self.config
    }

    /// 심볼의 시장 상태 갱신 (백테스트 루프가 봉마다 호출).
    pub async fn set_market(&self, symbol: impl Into<String>, market: SimulatedMarket) {
        self.markets.write().await.insert(symbol.into(), market);
    }

    /// 누적 거래 기록 조회.
    pub async fn trades(&self) -> Vec<SimulatedTrade> {
        self.trades.read().await.clone()
    }

    /// 슬리피지율 계산.
    ///
    /// base + (atr/price)*atr_factor + (notional/adv)*adv_factor,
    /// 스톱 계열이면 불리 배수 적용.
    fn slippage_rate(
        &self,
        market: Option<&SimulatedMarket>,
        notional: Decimal,
        is_stop_exit: bool,
    ) -> Decimal {
        let mut rate = self.config.base_slippage_rate;

        if let Some(m) = market {
            if m.price > Decimal::ZERO {
                rate += (m.atr / m.price) * self.config.atr_slippage_factor;
            }
            if m.avg_daily_volume_usd > Decimal::ZERO {
                rate += (notional / m.avg_daily_volume_usd) * self.config.adv_impact_factor;
            }
        }

        if is_stop_exit {
            rate *= self.config.stop_adverse_multiplier;
        }
        rate
    }

    /// 청산 체결가 계산 (슬리피지 + 갭 보정).
    fn execution_price(
        &self,
        ctx: &PositionContext,
        requested_price: Decimal,
        market: Option<&SimulatedMarket>,
        reason: ExitReason,
    ) -> Decimal {
        let is_stop_exit = matches!(reason, ExitReason::StopLoss | ExitReason::TrailingStop);

        // 갭 보정: 스톱 청산은 요청가와 현재가 중 더 불리한 쪽에서 시작
        let base_price = if is_stop_exit && self.config.gap_adjustment {
            match (ctx.direction, market.map(|m| m.price)) {
                (Direction::Long, Some(mark)) => requested_price.min(mark),
                (Direction::Short, Some(mark)) => requested_price.max(mark),
                _ => requested_price,
            }
        } else {
            requested_price
        };

        let notional = ctx.remaining_size_usd;
        let slip = self.slippage_rate(market, notional, is_stop_exit);

        // 청산은 항상 포지션에 불리한 방향으로 미끄러짐
        match ctx.direction {
            Direction::Long => base_price * (Decimal::ONE - slip),
            Direction::Short => base_price * (Decimal::ONE + slip),
        }
    }

    /// 부분/전량 청산 공통 경로.
    async fn close_internal(
        &self,
        ctx: &mut PositionContext,
        percent: Decimal,
        price: Decimal,
        reason: ExitReason,
    ) -> CloseResult {
        if let Err(msg) = validate_close_percent(percent) {
            return CloseResult::failed(msg);
        }

        let markets = self.markets.read().await;
        let market = markets.get(&ctx.symbol);
        let execution_price = self.execution_price(ctx, price, market, reason);
        drop(markets);

        let closed_size = ctx.remaining_size_usd * percent / Decimal::from(100);
        let commission = closed_size * self.config.commission_rate;

        let now = Utc::now();
        let result = settle_close(ctx, percent, execution_price, commission, now);

        debug!(
            symbol = %ctx.symbol,
            reason = %reason,
            percent = %percent,
            execution_price = %execution_price,
            pnl = %result.pnl,
            "시뮬레이션 청산"
        );

        self.trades.write().await.push(SimulatedTrade {
            symbol: ctx.symbol.clone(),
            reason,
            execution_price,
            closed_size_usd: result.closed_size_usd,
            pnl: result.pnl,
            commission,
            timestamp: now,
        });

        result
    }
}

#[async_trait]
impl ActionExecutor for SimulatedExecutor {
    async fn open_position(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        // 가상 주문 ID만 발급 (체결은 백테스트 루프가 OrderFilled로 전달)
        ctx.entry_order_id = Some(format!("sim-entry-{}", ctx.trade_id));
        ctx.touch(Utc::now());
        SlUpdateResult::ok()
    }

    async fn place_protective_orders(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        ctx.sl_order_id = Some(format!("sim-sl-{}", ctx.trade_id));
        ctx.tp1_order_id = Some(format!("sim-tp1-{}", ctx.trade_id));
        ctx.touch(Utc::now());
        SlUpdateResult::ok()
    }

    async fn close_partial(
        &self,
        ctx: &mut PositionContext,
        percent: Decimal,
        price: Decimal,
        reason: ExitReason,
    ) -> CloseResult {
        self.close_internal(ctx, percent, price, reason).await
    }

    async fn close_all(
        &self,
        ctx: &mut PositionContext,
        price: Decimal,
        reason: ExitReason,
    ) -> CloseResult {
        self.close_internal(ctx, Decimal::from(100), price, reason)
            .await
    }

    async fn move_sl_to_breakeven(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        // 시뮬레이션은 로컬 갱신만 수행
        ctx.sl_price = ctx.entry_price;
        ctx.touch(Utc::now());
        SlUpdateResult::ok()
    }

    async fn update_trailing_stop(&self, ctx: &mut PositionContext, new_price: Decimal) -> bool {
        let applied = apply_trailing_ratchet(ctx, new_price);
        if applied {
            ctx.touch(Utc::now());
        }
        applied
    }

    async fn update_sl_on_exchange(
        &self,
        ctx: &mut PositionContext,
        price: Decimal,
    ) -> SlUpdateResult {
        // 거래소 주문이 없으므로 로컬 반영 후 성공
        ctx.sl_price = price;
        ctx.touch(Utc::now());
        SlUpdateResult::ok()
    }

    async fn cancel_conditional_orders(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        ctx.sl_order_id = None;
        ctx.tp1_order_id = None;
        ctx.tp2_order_id = None;
        ctx.touch(Utc::now());
        SlUpdateResult::ok()
    }

    async fn calculate_funding_cost(
        &self,
        _symbol: &str,
        size_usd: Decimal,
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        direction: Direction,
    ) -> FundingCostResult {
        let periods = elapsed_funding_periods(entry_time, exit_time);
        let rates = vec![self.config.funding_rate; periods as usize];
        funding_cost(size_usd, direction, periods, &rates)
    }

    async fn get_current_price(&self, symbol: &str) -> Option<Decimal> {
        self.markets.read().await.get(symbol).map(|m| m.price)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;

    fn sample_ctx(direction: Direction) -> PositionContext {
        PositionContext::new(
            "BTCUSDT",
            direction,
            dec!(100),
            Utc::now(),
            dec!(1000),
            dec!(95),
            dec!(105),
            dec!(3),
        )
    }

    #[tokio::test]
    async fn test_tp1_partial_close_pnl() {
        // 진입 100, TP1 105, 롱 30% 청산, 비용 0:
        // pnl = 0.30 * 1000 * (105-100)/100 = 15
        let executor = SimulatedExecutor::new(SimulatedExecutorConfig::frictionless());
        let mut ctx = sample_ctx(Direction::Long);

        let result = executor
            .close_partial(&mut ctx, dec!(30), dec!(105), ExitReason::Tp1)
            .await;

        assert!(result.success);
        assert_eq!(result.pnl, dec!(15));
        assert_eq!(result.closed_size_usd, dec!(300));
        assert_eq!(ctx.remaining_size_usd, dec!(700));
    }

    #[tokio::test]
    async fn test_invalid_percent_does_not_mutate() {
        let executor = SimulatedExecutor::new(SimulatedExecutorConfig::frictionless());
        let mut ctx = sample_ctx(Direction::Long);
        let before = ctx.clone();

        let result = executor
            .close_partial(&mut ctx, dec!(150), dec!(105), ExitReason::Tp1)
            .await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(ctx, before);
        // 거래 기록도 남지 않음
        assert!(executor.trades().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_empties_position() {
        let executor = SimulatedExecutor::new(SimulatedExecutorConfig::frictionless());
        let mut ctx = sample_ctx(Direction::Short);

        // 숏: 하락 청산이 이익. 100 → 90 전량 청산: 1000 * 10% = 100
        let result = executor
            .close_all(&mut ctx, dec!(90), ExitReason::Tp2)
            .await;

        assert!(result.success);
        assert_eq!(result.pnl, dec!(100));
        assert_eq!(ctx.remaining_size_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stop_exit_is_more_adverse_than_plain_exit() {
        let config = SimulatedExecutorConfig {
            commission_rate: Decimal::ZERO,
            base_slippage_rate: dec!(0.001),
            atr_slippage_factor: Decimal::ZERO,
            adv_impact_factor: Decimal::ZERO,
            stop_adverse_multiplier: dec!(2),
            gap_adjustment: false,
            funding_rate: Decimal::ZERO,
        };
        let executor = SimulatedExecutor::new(config);

        // 같은 가격에서 일반 청산과 손절 청산 비교
        let mut plain_ctx = sample_ctx(Direction::Long);
        let plain = executor
            .close_all(&mut plain_ctx, dec!(95), ExitReason::TimeStop)
            .await;

        let mut stop_ctx = sample_ctx(Direction::Long);
        let stop = executor
            .close_all(&mut stop_ctx, dec!(95), ExitReason::StopLoss)
            .await;

        // 스톱 청산이 더 낮은 가격에 체결 (롱 기준 더 불리)
        assert!(stop.exit_price < plain.exit_price);
        assert!(stop.pnl < plain.pnl);
    }

    #[tokio::test]
    async fn test_gap_adjustment_uses_worse_of_stop_and_mark() {
        let config = SimulatedExecutorConfig {
            commission_rate: Decimal::ZERO,
            base_slippage_rate: Decimal::ZERO,
            atr_slippage_factor: Decimal::ZERO,
            adv_impact_factor: Decimal::ZERO,
            stop_adverse_multiplier: Decimal::ONE,
            gap_adjustment: true,
            funding_rate: Decimal::ZERO,
        };
        let executor = SimulatedExecutor::new(config);

        // 갭 하락: 스톱 95인데 현재가 92
        executor
            .set_market(
                "BTCUSDT",
                SimulatedMarket {
                    price: dec!(92),
                    atr: Decimal::ZERO,
                    avg_daily_volume_usd: Decimal::ZERO,
                },
            )
            .await;

        let mut ctx = sample_ctx(Direction::Long);
        let result = executor
            .close_all(&mut ctx, dec!(95), ExitReason::StopLoss)
            .await;

        // 요청가 95가 아닌 갭 반영가 92에 체결
        assert_eq!(result.exit_price, dec!(92));
    }

    #[tokio::test]
    async fn test_slippage_scales_with_atr_and_order_size() {
        let config = SimulatedExecutorConfig {
            commission_rate: Decimal::ZERO,
            base_slippage_rate: Decimal::ZERO,
            atr_slippage_factor: dec!(0.1),
            adv_impact_factor: dec!(0.1),
            stop_adverse_multiplier: Decimal::ONE,
            gap_adjustment: false,
            funding_rate: Decimal::ZERO,
        };
        let executor = SimulatedExecutor::new(config);

        // ATR 2% + 주문이 ADV의 1% → slip = 0.02*0.1 + 0.01*0.1 = 0.003
        executor
            .set_market(
                "BTCUSDT",
                SimulatedMarket {
                    price: dec!(100),
                    atr: dec!(2),
                    avg_daily_volume_usd: dec!(100000),
                },
            )
            .await;

        let mut ctx = sample_ctx(Direction::Long);
        let result = executor
            .close_all(&mut ctx, dec!(100), ExitReason::TimeStop)
            .await;

        assert_eq!(result.exit_price, dec!(99.7));
    }

    #[tokio::test]
    async fn test_funding_cost_constant_rate() {
        let config = SimulatedExecutorConfig {
            funding_rate: dec!(0.0001),
            ..SimulatedExecutorConfig::frictionless()
        };
        let executor = SimulatedExecutor::new(config);

        let entry = Utc::now();
        let exit = entry + Duration::hours(24); // 3주기

        let result = executor
            .calculate_funding_cost("BTCUSDT", dec!(1000), entry, exit, Direction::Long)
            .await;
        assert_eq!(result.periods, 3);
        assert_eq!(result.total_cost, dec!(0.3));

        let result = executor
            .calculate_funding_cost("BTCUSDT", dec!(1000), entry, exit, Direction::Short)
            .await;
        assert_eq!(result.total_cost, dec!(-0.3));
    }

    #[tokio::test]
    async fn test_get_current_price_unknown_symbol() {
        let executor = SimulatedExecutor::with_defaults();
        assert!(executor.get_current_price("NOPEUSDT").await.is_none());
    }
}
