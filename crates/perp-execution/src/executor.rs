//! ActionExecutor 계약.
//!
//! 모든 메서드는 결과 값(`CloseResult`/`SlUpdateResult`)으로 실패를
//! 보고하며 절대 panic하지 않습니다. 호출자(Coordinator/Reconciliation)는
//! `success=false`를 "상태 불변, 재시도 또는 에스컬레이션"으로 처리합니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use perp_core::{CloseResult, Direction, ExitReason, FundingCostResult, PositionContext, SlUpdateResult};

/// 포지션 액션 실행 인터페이스.
///
/// 시뮬레이션과 실거래가 동일하게 만족해야 하는 계약입니다.
/// 컨텍스트(`PositionContext`)는 성공한 작업에 의해서만 변경됩니다.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 진입 주문 제출 (시장가).
    ///
    /// 성공 시 `ctx.entry_order_id`를 기록합니다.
    async fn open_position(&self, ctx: &mut PositionContext) -> SlUpdateResult;

    /// 진입 체결 후 보호 주문(SL + TP1) 배치.
    ///
    /// 성공 시 `ctx.sl_order_id`/`ctx.tp1_order_id`를 기록합니다.
    async fn place_protective_orders(&self, ctx: &mut PositionContext) -> SlUpdateResult;

    /// 부분 청산.
    ///
    /// `percent`는 (0, 100] 범위여야 하며, 범위 밖이면 I/O 없이
    /// `success=false`를 반환하고 `ctx`를 변경하지 않습니다.
    async fn close_partial(
        &self,
        ctx: &mut PositionContext,
        percent: Decimal,
        price: Decimal,
        reason: ExitReason,
    ) -> CloseResult;

    /// 전량 청산 (`remaining_size_usd`의 100%).
    async fn close_all(
        &self,
        ctx: &mut PositionContext,
        price: Decimal,
        reason: ExitReason,
    ) -> CloseResult;

    /// SL을 본전으로 이동.
    ///
    /// 시뮬레이션은 로컬 갱신만, 실거래는 기존 SL 취소 후
    /// 진입가 ± 버퍼(≈0.1%)에 재배치합니다.
    async fn move_sl_to_breakeven(&self, ctx: &mut PositionContext) -> SlUpdateResult;

    /// 트레일링 스톱 갱신 (래칫).
    ///
    /// 포지션에 유리한 방향으로 조여질 때만 적용하며,
    /// 적용 여부를 반환합니다.
    async fn update_trailing_stop(&self, ctx: &mut PositionContext, new_price: Decimal) -> bool;

    /// 거래소 측 SL 가격 변경 (취소 후 재배치).
    ///
    /// 실거래는 "이미 취소됨/체결됨"을 성공으로 간주합니다 (멱등).
    async fn update_sl_on_exchange(
        &self,
        ctx: &mut PositionContext,
        price: Decimal,
    ) -> SlUpdateResult;

    /// 잔여 조건부 주문(SL/TP) 전부 취소.
    ///
    /// 포지션 종료 후 호출되며, 멱등 충돌은 성공으로 간주합니다.
    async fn cancel_conditional_orders(&self, ctx: &mut PositionContext) -> SlUpdateResult;

    /// 펀딩 비용 계산.
    ///
    /// 8시간 주기, `floor((exit-entry)/8h)` 주기 수,
    /// 롱은 양수 요율을 지불하고 숏은 수취합니다.
    /// 경과 주기 0은 비용 0 결과이며 에러가 아닙니다.
    async fn calculate_funding_cost(
        &self,
        symbol: &str,
        size_usd: Decimal,
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        direction: Direction,
    ) -> FundingCostResult;

    /// 현재가 조회 (조회 불가 시 `None`).
    async fn get_current_price(&self, symbol: &str) -> Option<Decimal>;

    /// 실행기 이름.
    fn name(&self) -> &str;
}

/// 청산 비율 검증. 범위 밖이면 에러 메시지 반환.
pub(crate) fn validate_close_percent(percent: Decimal) -> Result<(), String> {
    if percent <= Decimal::ZERO || percent > Decimal::from(100) {
        return Err(format!("청산 비율 {}은 (0, 100] 범위를 벗어남", percent));
    }
    Ok(())
}

/// 청산 체결을 컨텍스트에 반영하고 결과를 생성.
///
/// `percent`는 이미 검증된 값이어야 합니다.
pub(crate) fn settle_close(
    ctx: &mut PositionContext,
    percent: Decimal,
    execution_price: Decimal,
    commission: Decimal,
    now: DateTime<Utc>,
) -> CloseResult {
    let closed_size = ctx.remaining_size_usd * percent / Decimal::from(100);
    let pnl =
        perp_core::position_pnl(ctx.direction, ctx.entry_price, execution_price, closed_size)
            - commission;

    ctx.remaining_size_usd -= closed_size;
    ctx.realized_pnl += pnl;
    ctx.touch(now);

    CloseResult::ok(pnl, execution_price, closed_size)
}

/// 트레일링 래칫을 컨텍스트에 방어적으로 재적용.
///
/// 후보가 기존 스톱보다 포지션에 유리하게 조여질 때만 갱신합니다.
pub(crate) fn apply_trailing_ratchet(ctx: &mut PositionContext, candidate: Decimal) -> bool {
    let tightens = match ctx.trailing_stop_price {
        None => true,
        Some(existing) => match ctx.direction {
            Direction::Long => candidate > existing,
            Direction::Short => candidate < existing,
        },
    };
    if tightens {
        ctx.trailing_stop_price = Some(candidate);
    }
    tightens
}
