//! 포지션 생명주기 상태 기계.
//!
//! `process_transition`은 I/O가 없는 순수 함수입니다. 동일한 입력에 대해
//! 항상 동일한 결과를 반환하므로 백테스트와 실거래가 같은 전이 로직을
//! 공유합니다. 부수효과는 `TransitionAction` 목록으로 반환되며, 호출자가
//! `ActionExecutor`에 전달하여 실행합니다.
//!
//! # 전이 계약
//!
//! 전이 테이블에 없는 (상태, 이벤트) 쌍은 무시됩니다
//! (`transitioned=false`, 액션 없음). 이벤트는 해당 상태가 무시하는
//! 시점에 정당하게 도착할 수 있으므로 (예: SETUP 중의 BAR_CLOSE)
//! 절대 에러로 취급하지 않습니다.

use rust_decimal::Decimal;

use crate::domain::execution::{Direction, TransitionAction};
use crate::domain::position::{
    ExitReason, PositionEvent, PositionState, PositionStateContext, SetupParams,
};

/// `process_transition`의 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    /// 전이 후 상태
    pub new_state: PositionState,
    /// 상태가 변경되었는지 여부
    pub transitioned: bool,
    /// 요구되는 부수효과 목록
    pub actions: Vec<TransitionAction>,
    /// 갱신된 컨텍스트
    pub context: PositionStateContext,
}

impl TransitionResult {
    /// 상태 변경 없는 무시 결과.
    fn noop(ctx: &PositionStateContext) -> Self {
        Self {
            new_state: ctx.state,
            transitioned: false,
            actions: Vec::new(),
            context: ctx.clone(),
        }
    }
}

/// 포지션 생명주기 전이 처리.
///
/// 컨텍스트를 변경하지 않고 갱신본을 결과에 담아 반환합니다.
pub fn process_transition(
    ctx: &PositionStateContext,
    event: &PositionEvent,
) -> TransitionResult {
    match (ctx.state, event) {
        // ===== IDLE =====
        (PositionState::Idle, PositionEvent::SetupDetected(params)) => apply_setup(ctx, params),

        // ===== SETUP =====
        (PositionState::Setup, PositionEvent::EntryTrigger) => {
            let mut next = ctx.clone();
            next.state = PositionState::EntryPending;
            TransitionResult {
                new_state: next.state,
                transitioned: true,
                actions: vec![TransitionAction::Log {
                    message: format!("{} 진입 트리거, 주문 제출 대기", ctx.symbol),
                }],
                context: next,
            }
        }
        (
            PositionState::Setup,
            PositionEvent::SetupInvalid | PositionEvent::OppositeSignal,
        ) => abandon_to_idle(ctx, "셋업 무효화"),

        // ===== ENTRY_PENDING =====
        (
            PositionState::EntryPending,
            PositionEvent::OrderFilled {
                fill_price,
                size_usd,
                time,
            },
        ) => {
            let mut next = ctx.clone();
            next.state = PositionState::InPosition;
            next.entry_price = Some(*fill_price);
            next.entry_time = Some(*time);
            next.position_size_usd = Some(*size_usd);
            next.bars_since_entry = 0;
            TransitionResult {
                new_state: next.state,
                transitioned: true,
                actions: vec![TransitionAction::PlaceSlOrder],
                context: next,
            }
        }
        (PositionState::EntryPending, PositionEvent::OrderCancelled) => {
            // 진입이 일어나지 않았으므로 쿨다운 없이 IDLE 복귀
            abandon_to_idle(ctx, "진입 주문 취소")
        }
        (PositionState::EntryPending, PositionEvent::SetupInvalid) => {
            abandon_to_idle(ctx, "체결 전 셋업 무효화")
        }

        // ===== IN_POSITION =====
        (PositionState::InPosition, PositionEvent::Tp1Hit) => {
            let mut next = ctx.clone();
            next.state = PositionState::ScaleOut;
            next.tp1_hit = true;
            let entry = ctx.entry_price.unwrap_or(Decimal::ZERO);
            next.sl_price = Some(entry);
            TransitionResult {
                new_state: next.state,
                transitioned: true,
                actions: vec![
                    TransitionAction::ClosePartial {
                        percent: ctx.tp1_qty_percent,
                        reason: ExitReason::Tp1,
                    },
                    TransitionAction::MoveSlToBreakeven,
                    TransitionAction::UpdateSlOnExchange { price: entry },
                ],
                context: next,
            }
        }
        (PositionState::InPosition, PositionEvent::BarClose) => bar_close_active(ctx),

        // ===== SCALE_OUT =====
        (PositionState::ScaleOut, PositionEvent::BarClose) => {
            // 부분 청산 다음 봉에서는 추가 이벤트 없이 항상 트레일링으로 전환
            let mut next = ctx.clone();
            next.state = PositionState::Trailing;
            next.bars_since_entry = ctx.bars_since_entry.saturating_add(1);
            TransitionResult {
                new_state: next.state,
                transitioned: true,
                actions: Vec::new(),
                context: next,
            }
        }

        // ===== TRAILING =====
        (PositionState::Trailing, PositionEvent::BarClose) => bar_close_active(ctx),

        // ===== 활성 상태 공통 종료 이벤트 =====
        (state, PositionEvent::StopHit) if state.is_active() => {
            exit_position(ctx, ExitReason::StopLoss)
        }
        (state, PositionEvent::TrailHit) if state.is_active() => {
            exit_position(ctx, ExitReason::TrailingStop)
        }
        (state, PositionEvent::Tp2Hit) if state.is_active() => {
            exit_position(ctx, ExitReason::Tp2)
        }
        (state, PositionEvent::OppositeSignal) if state.is_active() => {
            exit_position(ctx, ExitReason::OppositeSignal)
        }
        (state, PositionEvent::TimeStop) if state.is_active() => {
            exit_position(ctx, ExitReason::TimeStop)
        }

        // ===== EXITED =====
        (PositionState::Exited, PositionEvent::BarClose) => {
            // 한 봉 지연 후 쿨다운 카운트 시작
            let mut next = ctx.clone();
            next.state = PositionState::Cooldown;
            next.bars_since_entry = 0;
            TransitionResult {
                new_state: next.state,
                transitioned: true,
                actions: Vec::new(),
                context: next,
            }
        }

        // ===== COOLDOWN =====
        (PositionState::Cooldown, PositionEvent::BarClose) => {
            let mut next = ctx.clone();
            next.bars_since_entry = ctx.bars_since_entry.saturating_add(1);
            if next.bars_since_entry >= ctx.cooldown_bars {
                next.reset_to_idle();
                TransitionResult {
                    new_state: PositionState::Idle,
                    transitioned: true,
                    actions: vec![TransitionAction::Log {
                        message: format!("{} 쿨다운 종료", ctx.symbol),
                    }],
                    context: next,
                }
            } else {
                TransitionResult {
                    new_state: PositionState::Cooldown,
                    transitioned: false,
                    actions: Vec::new(),
                    context: next,
                }
            }
        }
        (PositionState::Cooldown, PositionEvent::CooldownExpired) => {
            let mut next = ctx.clone();
            next.reset_to_idle();
            TransitionResult {
                new_state: PositionState::Idle,
                transitioned: true,
                actions: vec![TransitionAction::Log {
                    message: format!("{} 쿨다운 종료", ctx.symbol),
                }],
                context: next,
            }
        }

        // 테이블에 없는 쌍은 무시 (에러 아님)
        _ => TransitionResult::noop(ctx),
    }
}

/// IDLE + SETUP_DETECTED: 컨텍스트를 신호 내용으로 채움.
fn apply_setup(ctx: &PositionStateContext, params: &SetupParams) -> TransitionResult {
    let mut next = ctx.clone();
    next.state = PositionState::Setup;
    next.direction = Some(params.direction);
    next.entry_price = Some(params.entry_price);
    next.sl_price = Some(params.sl_price);
    next.tp1_price = Some(params.tp1_price);
    next.tp1_qty_percent = params.tp1_qty_percent;
    next.trail_atr_mult = params.trail_atr_mult;
    next.time_stop_bars = params.time_stop_bars;
    next.tp1_hit = false;
    next.trailing_stop_price = None;
    next.bars_since_entry = 0;
    next.exit_reason = None;
    TransitionResult {
        new_state: next.state,
        transitioned: true,
        actions: vec![TransitionAction::Log {
            message: format!(
                "{} {} 셋업 감지 (진입 {} / SL {} / TP1 {})",
                ctx.symbol,
                params.direction,
                params.entry_price,
                params.sl_price,
                params.tp1_price
            ),
        }],
        context: next,
    }
}

/// 포지션 없이 IDLE로 복귀하는 공통 경로.
fn abandon_to_idle(ctx: &PositionStateContext, reason: &str) -> TransitionResult {
    let mut next = ctx.clone();
    next.reset_to_idle();
    TransitionResult {
        new_state: PositionState::Idle,
        transitioned: true,
        actions: vec![TransitionAction::Log {
            message: format!("{} {}", ctx.symbol, reason),
        }],
        context: next,
    }
}

/// 활성 상태 공통 청산 전이.
fn exit_position(ctx: &PositionStateContext, reason: ExitReason) -> TransitionResult {
    let mut next = ctx.clone();
    next.state = PositionState::Exited;
    next.exit_reason = Some(reason);
    TransitionResult {
        new_state: next.state,
        transitioned: true,
        actions: vec![
            TransitionAction::CloseAll { reason },
            TransitionAction::CalculateFundingCost,
            TransitionAction::StartCooldown,
        ],
        context: next,
    }
}

/// IN_POSITION/TRAILING의 봉 마감 처리.
///
/// 봉 카운터를 증가시키고, 타임 스톱에 도달하면 단순 증가 대신
/// 강제 청산 전이를 수행합니다.
fn bar_close_active(ctx: &PositionStateContext) -> TransitionResult {
    let bars = ctx.bars_since_entry.saturating_add(1);
    if let Some(limit) = ctx.time_stop_bars {
        if bars >= limit {
            let mut result = exit_position(ctx, ExitReason::TimeStop);
            result.context.bars_since_entry = bars;
            return result;
        }
    }
    let mut next = ctx.clone();
    next.bars_since_entry = bars;
    TransitionResult {
        new_state: ctx.state,
        transitioned: false,
        actions: Vec::new(),
        context: next,
    }
}

/// 트레일링 스톱 후보 계산 (래칫 규칙).
///
/// 후보 = `current_price ∓ atr * trail_mult`. 갱신은 포지션에 유리한
/// 방향으로 조여질 때만 허용됩니다 (롱은 상승만, 숏은 하락만).
/// 허용되지 않으면 `None`을 반환하며 기존 스톱이 유지됩니다.
pub fn compute_trailing_stop(
    direction: Direction,
    current_price: Decimal,
    atr: Decimal,
    trail_mult: Decimal,
    current_stop: Option<Decimal>,
) -> Option<Decimal> {
    let offset = atr * trail_mult;
    let candidate = match direction {
        Direction::Long => current_price - offset,
        Direction::Short => current_price + offset,
    };
    match current_stop {
        None => Some(candidate),
        Some(existing) => {
            let tightens = match direction {
                Direction::Long => candidate > existing,
                Direction::Short => candidate < existing,
            };
            if tightens {
                Some(candidate)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;

    fn sample_setup() -> SetupParams {
        SetupParams {
            direction: Direction::Long,
            entry_price: dec!(100),
            sl_price: dec!(95),
            tp1_price: dec!(105),
            tp1_qty_percent: dec!(30),
            trail_atr_mult: dec!(2),
            time_stop_bars: None,
        }
    }

    fn ctx_in_state(state: PositionState) -> PositionStateContext {
        let mut ctx = PositionStateContext::new("BTCUSDT", "trend_follow", 3);
        if state != PositionState::Idle {
            let setup = process_transition(&ctx, &PositionEvent::SetupDetected(sample_setup()));
            ctx = setup.context;
        }
        ctx.state = state;
        if state.is_active() || state == PositionState::Exited {
            ctx.entry_time = Some(Utc::now());
            ctx.position_size_usd = Some(dec!(1000));
        }
        ctx
    }

    fn all_states() -> Vec<PositionState> {
        vec![
            PositionState::Idle,
            PositionState::Setup,
            PositionState::EntryPending,
            PositionState::InPosition,
            PositionState::ScaleOut,
            PositionState::Trailing,
            PositionState::Exited,
            PositionState::Cooldown,
        ]
    }

    fn all_events() -> Vec<PositionEvent> {
        vec![
            PositionEvent::SetupDetected(sample_setup()),
            PositionEvent::EntryTrigger,
            PositionEvent::SetupInvalid,
            PositionEvent::OrderFilled {
                fill_price: dec!(100),
                size_usd: dec!(1000),
                time: Utc::now(),
            },
            PositionEvent::OrderCancelled,
            PositionEvent::StopHit,
            PositionEvent::Tp1Hit,
            PositionEvent::Tp2Hit,
            PositionEvent::TrailHit,
            PositionEvent::TimeStop,
            PositionEvent::OppositeSignal,
            PositionEvent::BarClose,
            PositionEvent::CooldownExpired,
        ]
    }

    /// 전이 테이블에 해당 쌍이 정의되어 있는지 여부 (테스트 기준표).
    fn in_table(state: PositionState, event: &PositionEvent) -> bool {
        use PositionEvent as E;
        use PositionState as S;
        match (state, event) {
            (S::Idle, E::SetupDetected(_)) => true,
            (S::Setup, E::EntryTrigger | E::SetupInvalid | E::OppositeSignal) => true,
            (
                S::EntryPending,
                E::OrderFilled { .. } | E::OrderCancelled | E::SetupInvalid,
            ) => true,
            (S::InPosition, E::Tp1Hit | E::BarClose) => true,
            (S::ScaleOut, E::BarClose) => true,
            (S::Trailing, E::BarClose) => true,
            (s, E::StopHit | E::TrailHit | E::Tp2Hit | E::OppositeSignal | E::TimeStop)
                if s.is_active() =>
            {
                true
            }
            (S::Exited, E::BarClose) => true,
            (S::Cooldown, E::BarClose | E::CooldownExpired) => true,
            _ => false,
        }
    }

    #[test]
    fn test_unknown_pairs_are_noops() {
        // 테이블에 없는 모든 (상태, 이벤트) 쌍은 무시되어야 함
        for state in all_states() {
            for event in all_events() {
                if in_table(state, &event) {
                    continue;
                }
                let ctx = ctx_in_state(state);
                let result = process_transition(&ctx, &event);
                assert!(
                    !result.transitioned,
                    "({:?}, {}) 쌍이 전이를 일으킴",
                    state,
                    event.name()
                );
                assert!(
                    result.actions.is_empty(),
                    "({:?}, {}) 쌍이 액션을 발행함",
                    state,
                    event.name()
                );
                assert_eq!(result.new_state, state);
            }
        }
    }

    #[test]
    fn test_entry_fill_resets_bars_and_places_sl() {
        let mut ctx = ctx_in_state(PositionState::EntryPending);
        ctx.bars_since_entry = 7;

        let result = process_transition(
            &ctx,
            &PositionEvent::OrderFilled {
                fill_price: dec!(100.5),
                size_usd: dec!(2000),
                time: Utc::now(),
            },
        );

        assert!(result.transitioned);
        assert_eq!(result.new_state, PositionState::InPosition);
        assert_eq!(result.context.bars_since_entry, 0);
        assert_eq!(result.context.entry_price, Some(dec!(100.5)));
        assert_eq!(result.context.position_size_usd, Some(dec!(2000)));
        assert_eq!(result.actions, vec![TransitionAction::PlaceSlOrder]);
    }

    #[test]
    fn test_tp1_hit_scales_out_and_moves_sl() {
        let ctx = ctx_in_state(PositionState::InPosition);
        let result = process_transition(&ctx, &PositionEvent::Tp1Hit);

        assert_eq!(result.new_state, PositionState::ScaleOut);
        assert!(result.context.tp1_hit);
        // SL이 진입가(본전)로 이동
        assert_eq!(result.context.sl_price, result.context.entry_price);
        assert_eq!(
            result.actions,
            vec![
                TransitionAction::ClosePartial {
                    percent: dec!(30),
                    reason: ExitReason::Tp1,
                },
                TransitionAction::MoveSlToBreakeven,
                TransitionAction::UpdateSlOnExchange { price: dec!(100) },
            ]
        );
    }

    #[test]
    fn test_scale_out_always_advances_to_trailing() {
        let ctx = ctx_in_state(PositionState::ScaleOut);
        let result = process_transition(&ctx, &PositionEvent::BarClose);
        assert!(result.transitioned);
        assert_eq!(result.new_state, PositionState::Trailing);
    }

    #[test]
    fn test_bar_close_increments_until_time_stop() {
        let mut ctx = ctx_in_state(PositionState::InPosition);
        ctx.time_stop_bars = Some(3);

        // 1, 2번째 봉: 단순 증가
        for expected in 1..=2 {
            let result = process_transition(&ctx, &PositionEvent::BarClose);
            assert!(!result.transitioned);
            assert_eq!(result.context.bars_since_entry, expected);
            ctx = result.context;
        }

        // 3번째 봉: 타임 스톱 강제 청산
        let result = process_transition(&ctx, &PositionEvent::BarClose);
        assert!(result.transitioned);
        assert_eq!(result.new_state, PositionState::Exited);
        assert_eq!(result.context.exit_reason, Some(ExitReason::TimeStop));
        assert!(result.actions.contains(&TransitionAction::CloseAll {
            reason: ExitReason::TimeStop
        }));
        assert!(result.actions.contains(&TransitionAction::StartCooldown));
    }

    #[test]
    fn test_stop_hit_from_any_active_state() {
        for state in [
            PositionState::InPosition,
            PositionState::ScaleOut,
            PositionState::Trailing,
        ] {
            let ctx = ctx_in_state(state);
            let result = process_transition(&ctx, &PositionEvent::StopHit);
            assert_eq!(result.new_state, PositionState::Exited, "{:?} 실패", state);
            assert_eq!(result.context.exit_reason, Some(ExitReason::StopLoss));
            assert!(result.actions.contains(&TransitionAction::CloseAll {
                reason: ExitReason::StopLoss
            }));
        }
    }

    #[test]
    fn test_trail_hit_from_any_active_state() {
        for state in [
            PositionState::InPosition,
            PositionState::ScaleOut,
            PositionState::Trailing,
        ] {
            let ctx = ctx_in_state(state);
            let result = process_transition(&ctx, &PositionEvent::TrailHit);
            assert_eq!(result.new_state, PositionState::Exited, "{:?} 실패", state);
            assert_eq!(result.context.exit_reason, Some(ExitReason::TrailingStop));
            assert!(result.actions.contains(&TransitionAction::CloseAll {
                reason: ExitReason::TrailingStop
            }));
        }
    }

    #[test]
    fn test_entry_cancel_returns_to_idle_without_cooldown() {
        let ctx = ctx_in_state(PositionState::EntryPending);
        let result = process_transition(&ctx, &PositionEvent::OrderCancelled);
        assert_eq!(result.new_state, PositionState::Idle);
        assert!(result.context.entry_price.is_none());
        // 쿨다운 액션이 없어야 함
        assert!(!result
            .actions
            .iter()
            .any(|a| matches!(a, TransitionAction::StartCooldown)));
    }

    #[test]
    fn test_full_lifecycle_walk() {
        // IDLE → SETUP → ENTRY_PENDING → IN_POSITION → SCALE_OUT
        // → TRAILING → EXITED → COOLDOWN → (N봉) → IDLE
        let cooldown_bars = 3;
        let mut ctx = PositionStateContext::new("BTCUSDT", "trend_follow", cooldown_bars);

        let r = process_transition(&ctx, &PositionEvent::SetupDetected(sample_setup()));
        assert_eq!(r.new_state, PositionState::Setup);
        ctx = r.context;

        let r = process_transition(&ctx, &PositionEvent::EntryTrigger);
        assert_eq!(r.new_state, PositionState::EntryPending);
        ctx = r.context;

        let r = process_transition(
            &ctx,
            &PositionEvent::OrderFilled {
                fill_price: dec!(100),
                size_usd: dec!(1000),
                time: Utc::now(),
            },
        );
        assert_eq!(r.new_state, PositionState::InPosition);
        ctx = r.context;

        let r = process_transition(&ctx, &PositionEvent::Tp1Hit);
        assert_eq!(r.new_state, PositionState::ScaleOut);
        assert!(r.context.tp1_hit);
        ctx = r.context;

        let r = process_transition(&ctx, &PositionEvent::BarClose);
        assert_eq!(r.new_state, PositionState::Trailing);
        // tp1_hit은 TRAILING까지 유지
        assert!(r.context.tp1_hit);
        ctx = r.context;

        let r = process_transition(&ctx, &PositionEvent::TrailHit);
        assert_eq!(r.new_state, PositionState::Exited);
        assert_eq!(r.context.exit_reason, Some(ExitReason::TrailingStop));
        assert!(r.context.tp1_hit);
        ctx = r.context;

        let r = process_transition(&ctx, &PositionEvent::BarClose);
        assert_eq!(r.new_state, PositionState::Cooldown);
        assert_eq!(r.context.bars_since_entry, 0);
        ctx = r.context;

        // 쿨다운 봉 카운트
        for bar in 1..cooldown_bars {
            let r = process_transition(&ctx, &PositionEvent::BarClose);
            assert!(!r.transitioned, "{}번째 봉에서 조기 종료", bar);
            assert!(r.context.tp1_hit, "tp1_hit은 IDLE 복귀 전까지 유지");
            ctx = r.context;
        }

        let r = process_transition(&ctx, &PositionEvent::BarClose);
        assert!(r.transitioned);
        assert_eq!(r.new_state, PositionState::Idle);
        // IDLE 복귀 시에만 tp1_hit 해제
        assert!(!r.context.tp1_hit);
        assert!(r.context.entry_price.is_none());
        assert_eq!(r.context.cooldown_bars, cooldown_bars);
    }

    #[test]
    fn test_explicit_cooldown_expiry() {
        let mut ctx = ctx_in_state(PositionState::Cooldown);
        ctx.bars_since_entry = 1;
        let r = process_transition(&ctx, &PositionEvent::CooldownExpired);
        assert_eq!(r.new_state, PositionState::Idle);
        assert!(r.transitioned);
    }

    #[test]
    fn test_trailing_stop_ratchet_long() {
        // 롱: 첫 설정
        let stop = compute_trailing_stop(Direction::Long, dec!(100), dec!(2), dec!(1.5), None);
        assert_eq!(stop, Some(dec!(97)));

        // 가격 상승 → 조여짐 허용
        let stop =
            compute_trailing_stop(Direction::Long, dec!(104), dec!(2), dec!(1.5), Some(dec!(97)));
        assert_eq!(stop, Some(dec!(101)));

        // 가격 하락 → 완화 거부
        let stop =
            compute_trailing_stop(Direction::Long, dec!(99), dec!(2), dec!(1.5), Some(dec!(101)));
        assert_eq!(stop, None);
    }

    #[test]
    fn test_trailing_stop_ratchet_short() {
        let stop = compute_trailing_stop(Direction::Short, dec!(100), dec!(2), dec!(1.5), None);
        assert_eq!(stop, Some(dec!(103)));

        let stop = compute_trailing_stop(
            Direction::Short,
            dec!(95),
            dec!(2),
            dec!(1.5),
            Some(dec!(103)),
        );
        assert_eq!(stop, Some(dec!(98)));

        let stop = compute_trailing_stop(
            Direction::Short,
            dec!(101),
            dec!(2),
            dec!(1.5),
            Some(dec!(98)),
        );
        assert_eq!(stop, None);
    }

    proptest! {
        /// 래칫 단조성: 연속 갱신에서 롱 스톱은 비감소, 숏 스톱은 비증가.
        #[test]
        fn prop_trailing_stop_monotonic(prices in proptest::collection::vec(1u32..1_000_000u32, 1..60)) {
            let atr = dec!(5);
            let mult = dec!(2);

            for direction in [Direction::Long, Direction::Short] {
                let mut stop: Option<Decimal> = None;
                let mut history: Vec<Decimal> = Vec::new();
                for raw in &prices {
                    let price = Decimal::from(*raw);
                    if let Some(new_stop) =
                        compute_trailing_stop(direction, price, atr, mult, stop)
                    {
                        stop = Some(new_stop);
                        history.push(new_stop);
                    }
                }
                for pair in history.windows(2) {
                    match direction {
                        Direction::Long => prop_assert!(pair[1] >= pair[0]),
                        Direction::Short => prop_assert!(pair[1] <= pair[0]),
                    }
                }
            }
        }
    }
}
