//! 포지션 생명주기 상태/이벤트 타입.
//!
//! 이 모듈은 상태 기계가 다루는 타입을 정의합니다:
//! - `PositionState` - 생명주기 상태
//! - `PositionEvent` - 상태 전이를 일으키는 이벤트
//! - `PositionStateContext` - 심볼별 생명주기 레코드
//! - `ExitReason` - 청산 사유

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::execution::Direction;

/// 포지션 생명주기 상태.
///
/// `IDLE → SETUP → ENTRY_PENDING → IN_POSITION → SCALE_OUT → TRAILING
/// → EXITED → COOLDOWN → IDLE` 순환 구조입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    /// 대기 (활성 셋업/포지션 없음)
    Idle,
    /// 셋업 감지됨 (진입 트리거 대기)
    Setup,
    /// 진입 주문 제출됨 (체결 대기)
    EntryPending,
    /// 포지션 보유 중 (TP1 미도달)
    InPosition,
    /// TP1 부분 청산 완료 (다음 봉에서 트레일링 전환)
    ScaleOut,
    /// 트레일링 스톱 관리 중
    Trailing,
    /// 청산 완료 (쿨다운 진입 대기)
    Exited,
    /// 재진입 금지 기간
    Cooldown,
}

impl PositionState {
    /// 활성 상태 여부 (실제 포지션이 존재하는 상태).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PositionState::InPosition | PositionState::ScaleOut | PositionState::Trailing
        )
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionState::Idle => "IDLE",
            PositionState::Setup => "SETUP",
            PositionState::EntryPending => "ENTRY_PENDING",
            PositionState::InPosition => "IN_POSITION",
            PositionState::ScaleOut => "SCALE_OUT",
            PositionState::Trailing => "TRAILING",
            PositionState::Exited => "EXITED",
            PositionState::Cooldown => "COOLDOWN",
        };
        write!(f, "{}", s)
    }
}

/// 청산 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// 1차 익절 (부분 청산)
    Tp1,
    /// 2차 익절 (전량 청산)
    Tp2,
    /// 손절
    StopLoss,
    /// 트레일링 스톱
    TrailingStop,
    /// 타임 스톱 (보유 봉 수 초과)
    TimeStop,
    /// 반대 신호
    OppositeSignal,
    /// 백스톱 동기화로 감지된 거래소측 청산
    ForceSync,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Tp1 => "TP1",
            ExitReason::Tp2 => "TP2",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TimeStop => "TIME_STOP",
            ExitReason::OppositeSignal => "OPPOSITE_SIGNAL",
            ExitReason::ForceSync => "FORCE_SYNC",
        };
        write!(f, "{}", s)
    }
}

/// 셋업 감지 이벤트 페이로드.
///
/// 전략 신호에서 추출한 진입 계획입니다. `SetupDetected` 처리 시
/// 상태 기계가 이 값으로 컨텍스트를 채웁니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupParams {
    /// 포지션 방향
    pub direction: Direction,
    /// 계획 진입가
    pub entry_price: Decimal,
    /// 손절가
    pub sl_price: Decimal,
    /// 1차 익절가
    pub tp1_price: Decimal,
    /// TP1 부분 청산 비율 (%)
    pub tp1_qty_percent: Decimal,
    /// 트레일링 스톱 ATR 배수
    pub trail_atr_mult: Decimal,
    /// 타임 스톱 봉 수 (None이면 미사용)
    pub time_stop_bars: Option<u32>,
}

/// 상태 전이를 일으키는 이벤트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PositionEvent {
    /// 전략 셋업 감지
    SetupDetected(SetupParams),
    /// 진입 조건 충족
    EntryTrigger,
    /// 셋업 무효화
    SetupInvalid,
    /// 진입 주문 체결
    OrderFilled {
        /// 체결 가격
        fill_price: Decimal,
        /// 체결 명목 금액 (USD)
        size_usd: Decimal,
        /// 체결 시간
        time: DateTime<Utc>,
    },
    /// 진입 주문 취소
    OrderCancelled,
    /// 손절가 도달
    StopHit,
    /// 1차 익절가 도달
    Tp1Hit,
    /// 2차 익절가 도달
    Tp2Hit,
    /// 트레일링 스톱 도달
    TrailHit,
    /// 타임 스톱 도달
    TimeStop,
    /// 반대 방향 신호 발생
    OppositeSignal,
    /// 봉 마감
    BarClose,
    /// 쿨다운 명시적 만료
    CooldownExpired,
}

impl PositionEvent {
    /// 로그용 이벤트 이름.
    pub fn name(&self) -> &'static str {
        match self {
            PositionEvent::SetupDetected(_) => "SETUP_DETECTED",
            PositionEvent::EntryTrigger => "ENTRY_TRIGGER",
            PositionEvent::SetupInvalid => "SETUP_INVALID",
            PositionEvent::OrderFilled { .. } => "ORDER_FILLED",
            PositionEvent::OrderCancelled => "ORDER_CANCELLED",
            PositionEvent::StopHit => "STOP_HIT",
            PositionEvent::Tp1Hit => "TP1_HIT",
            PositionEvent::Tp2Hit => "TP2_HIT",
            PositionEvent::TrailHit => "TRAIL_HIT",
            PositionEvent::TimeStop => "TIME_STOP",
            PositionEvent::OppositeSignal => "OPPOSITE_SIGNAL",
            PositionEvent::BarClose => "BAR_CLOSE",
            PositionEvent::CooldownExpired => "COOLDOWN_EXPIRED",
        }
    }
}

/// 심볼별 포지션 생명주기 레코드.
///
/// 셋업/포지션/쿨다운이 활성인 동안 심볼당 정확히 하나 존재합니다.
/// 부재는 IDLE을 의미합니다. `SetupDetected`에서 생성되고,
/// `process_transition`에 의해서만 변경되며, 쿨다운이 자연 만료되어
/// IDLE로 돌아올 때 제거됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionStateContext {
    /// 현재 상태
    pub state: PositionState,
    /// 심볼
    pub symbol: String,
    /// 전략 식별자
    pub strategy_id: String,
    /// 포지션 방향 (SETUP 이전에는 None)
    pub direction: Option<Direction>,
    /// 진입가 (체결 전에는 계획가)
    pub entry_price: Option<Decimal>,
    /// 진입 시간
    pub entry_time: Option<DateTime<Utc>>,
    /// 포지션 명목 금액 (USD)
    pub position_size_usd: Option<Decimal>,
    /// 손절가
    pub sl_price: Option<Decimal>,
    /// 1차 익절가
    pub tp1_price: Option<Decimal>,
    /// TP1 부분 청산 비율 (%)
    pub tp1_qty_percent: Decimal,
    /// 트레일링 스톱 ATR 배수
    pub trail_atr_mult: Decimal,
    /// TP1 도달 여부
    pub tp1_hit: bool,
    /// 트레일링 스톱 가격
    pub trailing_stop_price: Option<Decimal>,
    /// 진입 이후 경과 봉 수 (쿨다운 중에는 쿨다운 카운터로 재사용)
    pub bars_since_entry: u32,
    /// 타임 스톱 봉 수 (설정)
    pub time_stop_bars: Option<u32>,
    /// 쿨다운 봉 수 (설정)
    pub cooldown_bars: u32,
    /// 청산 사유
    pub exit_reason: Option<ExitReason>,
}

impl PositionStateContext {
    /// IDLE 상태의 새 컨텍스트 생성.
    pub fn new(
        symbol: impl Into<String>,
        strategy_id: impl Into<String>,
        cooldown_bars: u32,
    ) -> Self {
        Self {
            state: PositionState::Idle,
            symbol: symbol.into(),
            strategy_id: strategy_id.into(),
            direction: None,
            entry_price: None,
            entry_time: None,
            position_size_usd: None,
            sl_price: None,
            tp1_price: None,
            tp1_qty_percent: Decimal::from(30),
            trail_atr_mult: Decimal::TWO,
            tp1_hit: false,
            trailing_stop_price: None,
            bars_since_entry: 0,
            time_stop_bars: None,
            cooldown_bars,
            exit_reason: None,
        }
    }

    /// 활성 상태 여부.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// 포지션 고유 필드를 비우고 IDLE로 되돌림.
    ///
    /// `cooldown_bars`/`time_stop_bars` 설정은 보존합니다.
    pub(crate) fn reset_to_idle(&mut self) {
        self.state = PositionState::Idle;
        self.direction = None;
        self.entry_price = None;
        self.entry_time = None;
        self.position_size_usd = None;
        self.sl_price = None;
        self.tp1_price = None;
        self.tp1_hit = false;
        self.trailing_stop_price = None;
        self.bars_since_entry = 0;
        self.exit_reason = None;
    }
}
