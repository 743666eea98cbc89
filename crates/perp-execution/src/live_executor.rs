//! 실거래 실행기.
//!
//! `FuturesExchange`를 통해 실제 주문을 제출하는 `ActionExecutor`
//! 구현입니다. 시뮬레이션과 동일한 계약을 따르되 다음이 추가됩니다:
//!
//! - 심볼 정밀도(tick/step) 반올림: 거래소가 정렬되지 않은 값을
//!   거부하므로 모든 주문 전에 적용
//! - 청산 주문은 전부 reduce-only (의도보다 큰 체결 방지)
//! - 주문 경로는 고정 지연 재시도, 조회 경로는 백오프 재시도
//! - "이미 취소됨/체결됨" 멱등 충돌은 성공으로 간주
//! - 본전 이동 시 거래소 체결 지연을 흡수하는 손실 측 버퍼

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use perp_core::{
    CloseResult, Direction, ExitReason, FundingCostResult, PositionContext, SlUpdateResult,
};
use perp_exchange::{
    with_retry, ExchangeError, FuturesExchange, OrderRequest, OrderSide, RetryConfig, SymbolCache,
    SymbolFilters,
};

use crate::executor::{
    apply_trailing_ratchet, settle_close, validate_close_percent, ActionExecutor,
};
use crate::funding::{elapsed_funding_periods, funding_cost};

/// 실거래 실행기 설정.
#[derive(Debug, Clone)]
pub struct LiveExecutorConfig {
    /// 본전 이동 시 손실 측 버퍼 비율.
    ///
    /// 정확히 진입가에 SL을 두면 수수료만큼 손실이 확정되므로
    /// 롱은 `entry * (1 - buffer)`, 숏은 `entry * (1 + buffer)`에 둡니다.
    pub breakeven_buffer: Decimal,
    /// 수수료율 추정치 (체결 내역 조회 없이 손익에 선반영).
    pub commission_rate: Decimal,
    /// 주문 제출/취소 경로 재시도 (고정 지연).
    pub order_retry: RetryConfig,
    /// 메타데이터 조회 경로 재시도 (백오프).
    pub query_retry: RetryConfig,
    /// 심볼 필터 캐시 TTL.
    pub filters_ttl: Duration,
}

impl Default for LiveExecutorConfig {
    fn default() -> Self {
        Self {
            breakeven_buffer: dec!(0.001),
            commission_rate: dec!(0.0004),
            order_retry: RetryConfig::fixed(3, Duration::from_millis(500)),
            query_retry: RetryConfig::default(),
            filters_ttl: Duration::from_secs(3600),
        }
    }
}

/// 실거래 실행기.
pub struct LiveExecutor {
    exchange: Arc<dyn FuturesExchange>,
    config: LiveExecutorConfig,
    filters: SymbolCache<SymbolFilters>,
}

impl LiveExecutor {
    /// 새 실거래 실행기 생성.
    pub fn new(exchange: Arc<dyn FuturesExchange>, config: LiveExecutorConfig) -> Self {
        let filters = SymbolCache::new(config.filters_ttl);
        Self {
            exchange,
            config,
            filters,
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults(exchange: Arc<dyn FuturesExchange>) -> Self {
        Self::new(exchange, LiveExecutorConfig::default())
    }

    /// 청산 주문 방향 (포지션 반대).
    fn close_side(direction: Direction) -> OrderSide {
        match direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    /// 심볼 필터 조회 (캐시 우선).
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(cached) = self.filters.get(symbol).await {
            return Ok(cached);
        }
        let fetched = with_retry(&self.config.query_retry, || {
            self.exchange.get_symbol_filters(symbol)
        })
        .await?;
        self.filters.set(symbol, fetched.clone()).await;
        Ok(fetched)
    }

    /// 명목 금액(USD)을 기초자산 수량으로 환산 후 step 내림.
    fn qty_from_notional(
        filters: &SymbolFilters,
        notional_usd: Decimal,
        price: Decimal,
    ) -> Result<Decimal, String> {
        if price <= Decimal::ZERO {
            return Err(format!("가격 {}으로 수량 환산 불가", price));
        }
        let qty = filters.round_qty(notional_usd / price);
        if qty <= Decimal::ZERO {
            return Err(format!(
                "명목 {} USD가 최소 수량 단위 {} 미만",
                notional_usd, filters.step_size
            ));
        }
        Ok(qty)
    }

    /// 주문 취소 (멱등 허용).
    ///
    /// 이미 취소/체결된 주문과 존재하지 않는 주문은 성공으로 간주합니다.
    async fn cancel_tolerant(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let result = with_retry(&self.config.order_retry, || {
            self.exchange.cancel_order(symbol, order_id)
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_idempotent_conflict() || matches!(e, ExchangeError::OrderNotFound(_)) => {
                info!(symbol, order_id, error = %e, "취소 대상 주문이 이미 없음 (무시)");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 거래소 SL 주문 교체 (취소 후 재배치).
    async fn replace_sl_order(
        &self,
        ctx: &mut PositionContext,
        new_price: Decimal,
    ) -> SlUpdateResult {
        let filters = match self.symbol_filters(&ctx.symbol).await {
            Ok(f) => f,
            Err(e) => return SlUpdateResult::failed(format!("필터 조회 실패: {}", e)),
        };
        let rounded = filters.round_price(new_price);

        let qty = match Self::qty_from_notional(&filters, ctx.remaining_size_usd, ctx.entry_price) {
            Ok(q) => q,
            Err(msg) => return SlUpdateResult::failed(msg),
        };

        if let Some(old_id) = ctx.sl_order_id.clone() {
            if let Err(e) = self.cancel_tolerant(&ctx.symbol, &old_id).await {
                return SlUpdateResult::failed(format!("기존 SL 취소 실패: {}", e));
            }
        }

        let request =
            OrderRequest::stop_market(&ctx.symbol, Self::close_side(ctx.direction), qty, rounded);
        let placed = with_retry(&self.config.order_retry, || {
            self.exchange.place_order(&request)
        })
        .await;

        match placed {
            Ok(order) => {
                info!(
                    symbol = %ctx.symbol,
                    order_id = %order.order_id,
                    sl_price = %rounded,
                    "SL 주문 교체 완료"
                );
                ctx.sl_order_id = Some(order.order_id);
                ctx.sl_price = rounded;
                ctx.touch(Utc::now());
                SlUpdateResult::ok()
            }
            Err(e) => SlUpdateResult::failed(format!("SL 주문 제출 실패: {}", e)),
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

        let filters = match self.symbol_filters(&ctx.symbol).await {
            Ok(f) => f,
            Err(e) => return CloseResult::failed(format!("필터 조회 실패: {}", e)),
        };

        let notional = ctx.remaining_size_usd * percent / Decimal::from(100);
        let qty = match Self::qty_from_notional(&filters, notional, price) {
            Ok(q) => q,
            Err(msg) => return CloseResult::failed(msg),
        };

        let request = OrderRequest::market(&ctx.symbol, Self::close_side(ctx.direction), qty)
            .with_reduce_only(true);
        let placed = with_retry(&self.config.order_retry, || {
            self.exchange.place_order(&request)
        })
        .await;

        let now = Utc::now();
        match placed {
            Ok(order) => {
                let execution_price = order.avg_price.unwrap_or(price);
                let commission = notional * self.config.commission_rate;
                let result = settle_close(ctx, percent, execution_price, commission, now);
                info!(
                    symbol = %ctx.symbol,
                    reason = %reason,
                    percent = %percent,
                    execution_price = %execution_price,
                    pnl = %result.pnl,
                    "청산 주문 체결"
                );
                result
            }
            // 거래소에서 이미 닫힌 포지션: 멱등 성공으로 기록
            Err(e) if e.is_idempotent_conflict() => {
                warn!(symbol = %ctx.symbol, error = %e, "청산 대상 포지션이 이미 없음");
                settle_close(ctx, percent, price, Decimal::ZERO, now)
            }
            Err(e) => CloseResult::failed(format!("청산 주문 실패: {}", e)),
        }
    }
}

#[async_trait]
impl ActionExecutor for LiveExecutor {
    async fn open_position(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        let filters = match self.symbol_filters(&ctx.symbol).await {
            Ok(f) => f,
            Err(e) => return SlUpdateResult::failed(format!("필터 조회 실패: {}", e)),
        };

        let qty = match Self::qty_from_notional(&filters, ctx.initial_size_usd, ctx.entry_price) {
            Ok(q) => q,
            Err(msg) => return SlUpdateResult::failed(msg),
        };
        if let Err(e) = filters.check_notional(qty, ctx.entry_price) {
            return SlUpdateResult::failed(e.to_string());
        }

        let side = match ctx.direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };
        let request = OrderRequest::market(&ctx.symbol, side, qty);
        let placed = with_retry(&self.config.order_retry, || {
            self.exchange.place_order(&request)
        })
        .await;

        match placed {
            Ok(order) => {
                info!(
                    symbol = %ctx.symbol,
                    direction = %ctx.direction,
                    order_id = %order.order_id,
                    qty = %qty,
                    "진입 주문 제출"
                );
                ctx.entry_order_id = Some(order.order_id);
                ctx.touch(Utc::now());
                SlUpdateResult::ok()
            }
            Err(e) => SlUpdateResult::failed(format!("진입 주문 실패: {}", e)),
        }
    }

    async fn place_protective_orders(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        let filters = match self.symbol_filters(&ctx.symbol).await {
            Ok(f) => f,
            Err(e) => return SlUpdateResult::failed(format!("필터 조회 실패: {}", e)),
        };

        let qty = match Self::qty_from_notional(&filters, ctx.remaining_size_usd, ctx.entry_price) {
            Ok(q) => q,
            Err(msg) => return SlUpdateResult::failed(msg),
        };
        let side = Self::close_side(ctx.direction);

        let sl_request = OrderRequest::stop_market(
            &ctx.symbol,
            side,
            qty,
            filters.round_price(ctx.sl_price),
        );
        let sl = with_retry(&self.config.order_retry, || {
            self.exchange.place_order(&sl_request)
        })
        .await;
        match sl {
            Ok(order) => ctx.sl_order_id = Some(order.order_id),
            Err(e) => return SlUpdateResult::failed(format!("SL 주문 실패: {}", e)),
        }

        let tp1_request = OrderRequest::take_profit_market(
            &ctx.symbol,
            side,
            qty,
            filters.round_price(ctx.tp1_price),
        );
        let tp1 = with_retry(&self.config.order_retry, || {
            self.exchange.place_order(&tp1_request)
        })
        .await;
        match tp1 {
            Ok(order) => ctx.tp1_order_id = Some(order.order_id),
            Err(e) => return SlUpdateResult::failed(format!("TP1 주문 실패: {}", e)),
        }

        if let Some(tp2_price) = ctx.tp2_price {
            let tp2_request = OrderRequest::take_profit_market(
                &ctx.symbol,
                side,
                qty,
                filters.round_price(tp2_price),
            );
            let tp2 = with_retry(&self.config.order_retry, || {
                self.exchange.place_order(&tp2_request)
            })
            .await;
            match tp2 {
                Ok(order) => ctx.tp2_order_id = Some(order.order_id),
                Err(e) => return SlUpdateResult::failed(format!("TP2 주문 실패: {}", e)),
            }
        }

        info!(
            symbol = %ctx.symbol,
            sl_price = %ctx.sl_price,
            tp1_price = %ctx.tp1_price,
            "보호 주문 배치 완료"
        );
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
        let result = self
            .close_internal(ctx, Decimal::from(100), price, reason)
            .await;
        // 전량 청산 후 잔여 조건부 주문 정리 (실패해도 청산 결과는 유지)
        if result.success {
            let _ = self.cancel_conditional_orders(ctx).await;
        }
        result
    }

    async fn move_sl_to_breakeven(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        // 정확히 진입가 대신 손실 측 버퍼 적용
        let be_price = match ctx.direction {
            Direction::Long => ctx.entry_price * (Decimal::ONE - self.config.breakeven_buffer),
            Direction::Short => ctx.entry_price * (Decimal::ONE + self.config.breakeven_buffer),
        };
        self.replace_sl_order(ctx, be_price).await
    }

    async fn update_trailing_stop(&self, ctx: &mut PositionContext, new_price: Decimal) -> bool {
        // 조여지는 방향일 때만 거래소 주문을 건드림
        if !apply_trailing_ratchet(ctx, new_price) {
            return false;
        }
        let result = self.replace_sl_order(ctx, new_price).await;
        if !result.success {
            // 다음 봉에서 재시도, 불일치는 정합성 보정이 흡수
            warn!(
                symbol = %ctx.symbol,
                new_price = %new_price,
                error = ?result.error,
                "트레일링 스톱 거래소 반영 실패"
            );
        }
        true
    }

    async fn update_sl_on_exchange(
        &self,
        ctx: &mut PositionContext,
        price: Decimal,
    ) -> SlUpdateResult {
        self.replace_sl_order(ctx, price).await
    }

    async fn cancel_conditional_orders(&self, ctx: &mut PositionContext) -> SlUpdateResult {
        let order_ids: Vec<String> = [&ctx.sl_order_id, &ctx.tp1_order_id, &ctx.tp2_order_id]
            .into_iter()
            .filter_map(|id| id.clone())
            .collect();

        for order_id in order_ids {
            if let Err(e) = self.cancel_tolerant(&ctx.symbol, &order_id).await {
                return SlUpdateResult::failed(format!("조건부 주문 취소 실패: {}", e));
            }
        }

        ctx.sl_order_id = None;
        ctx.tp1_order_id = None;
        ctx.tp2_order_id = None;
        ctx.touch(Utc::now());
        SlUpdateResult::ok()
    }

    async fn calculate_funding_cost(
        &self,
        symbol: &str,
        size_usd: Decimal,
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        direction: Direction,
    ) -> FundingCostResult {
        let periods = elapsed_funding_periods(entry_time, exit_time);
        if periods == 0 {
            return FundingCostResult::zero();
        }

        let history = with_retry(&self.config.query_retry, || {
            self.exchange
                .get_funding_history(symbol, entry_time, exit_time)
        })
        .await;

        match history {
            Ok(payments) => {
                let rates: Vec<Decimal> = payments.iter().map(|p| p.funding_rate).collect();
                funding_cost(size_usd, direction, periods, &rates)
            }
            Err(e) => {
                // 펀딩 내역 조회 실패는 청산을 막지 않음
                warn!(symbol, error = %e, "펀딩 내역 조회 실패, 비용 0으로 처리");
                FundingCostResult::zero()
            }
        }
    }

    async fn get_current_price(&self, symbol: &str) -> Option<Decimal> {
        match with_retry(&self.config.query_retry, || self.exchange.get_price(symbol)).await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(symbol, error = %e, "현재가 조회 실패");
                None
            }
        }
    }

    fn name(&self) -> &str {
        "live"
    }
}
