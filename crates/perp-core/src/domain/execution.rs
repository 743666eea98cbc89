//! 실행 측 도메인 타입.
//!
//! 상태 기계가 요구하는 부수효과(`TransitionAction`)와, 실행기가 소비하는
//! 자금/수량 관점의 포지션 컨텍스트(`PositionContext`)를 정의합니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::ExitReason;

/// 포지션 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// 롱 (매수)
    Long,
    /// 숏 (매도)
    Short,
}

impl Direction {
    /// 반대 방향.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// 손익 부호 (롱 +1, 숏 -1).
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// 상태 전이가 요구하는 부수효과.
///
/// 액션은 상태 전이의 결과로만 발행됩니다. 절대 선제적으로 발행하지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum TransitionAction {
    /// 부분 청산 (remaining의 percent%)
    ClosePartial {
        /// 청산 비율 (0, 100]
        percent: Decimal,
        /// 청산 사유
        reason: ExitReason,
    },
    /// 전량 청산
    CloseAll {
        /// 청산 사유
        reason: ExitReason,
    },
    /// 보호 주문(SL/TP) 제출
    PlaceSlOrder,
    /// 손절가를 진입가(본전)로 이동
    MoveSlToBreakeven,
    /// 트레일링 스톱 갱신
    UpdateTrailingStop {
        /// 새 스톱 가격
        price: Decimal,
    },
    /// 거래소 SL 주문 교체
    UpdateSlOnExchange {
        /// 새 SL 가격
        price: Decimal,
    },
    /// 펀딩 비용 정산
    CalculateFundingCost,
    /// 쿨다운 시작
    StartCooldown,
    /// 로그 기록
    Log {
        /// 메시지
        message: String,
    },
}

/// 청산 결과.
///
/// 실행기 메서드는 예외를 던지지 않고 항상 이 값을 반환합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    /// 실현 손익 (수수료 차감)
    pub pnl: Decimal,
    /// 체결 가격
    pub exit_price: Decimal,
    /// 청산된 명목 금액 (USD)
    pub closed_size_usd: Decimal,
    /// 성공 여부
    pub success: bool,
    /// 실패 시 에러 메시지
    pub error: Option<String>,
}

impl CloseResult {
    /// 성공 결과 생성.
    pub fn ok(pnl: Decimal, exit_price: Decimal, closed_size_usd: Decimal) -> Self {
        Self {
            pnl,
            exit_price,
            closed_size_usd,
            success: true,
            error: None,
        }
    }

    /// 실패 결과 생성. 컨텍스트는 변경되지 않은 상태여야 합니다.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            pnl: Decimal::ZERO,
            exit_price: Decimal::ZERO,
            closed_size_usd: Decimal::ZERO,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// SL 갱신 결과.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlUpdateResult {
    /// 성공 여부
    pub success: bool,
    /// 실패 시 에러 메시지
    pub error: Option<String>,
}

impl SlUpdateResult {
    /// 성공 결과.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// 실패 결과.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// 펀딩 비용 정산 결과.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingCostResult {
    /// 총 비용 (양수 = 지불, 음수 = 수취)
    pub total_cost: Decimal,
    /// 경과 정산 주기 수 (8시간 단위)
    pub periods: u32,
    /// 평균 펀딩 비율
    pub avg_rate: Decimal,
}

impl FundingCostResult {
    /// 정산 주기 0회의 빈 결과 (에러가 아님).
    pub fn zero() -> Self {
        Self {
            total_cost: Decimal::ZERO,
            periods: 0,
            avg_rate: Decimal::ZERO,
        }
    }
}

/// 실행 측 포지션 컨텍스트.
///
/// Coordinator가 소유하며 `ActionExecutor` 반환값을 통해서만 갱신됩니다.
/// 정합성 보정 경로는 이 구조체를 직접 변경하지 않고 영속 레코드에 기록하며,
/// Coordinator가 다음 틱에 다시 로드합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionContext {
    /// 거래 고유 ID
    pub trade_id: Uuid,
    /// 심볼
    pub symbol: String,
    /// 방향
    pub direction: Direction,
    /// 진입가
    pub entry_price: Decimal,
    /// 진입 시간
    pub entry_time: DateTime<Utc>,
    /// 최초 명목 금액 (USD)
    pub initial_size_usd: Decimal,
    /// 잔여 명목 금액 (USD)
    pub remaining_size_usd: Decimal,
    /// 손절가
    pub sl_price: Decimal,
    /// 1차 익절가
    pub tp1_price: Decimal,
    /// 2차 익절가 (선택)
    pub tp2_price: Option<Decimal>,
    /// 트레일링 스톱 가격
    pub trailing_stop_price: Option<Decimal>,
    /// TP1 도달 여부
    pub tp1_hit: bool,
    /// 누적 실현 손익
    pub realized_pnl: Decimal,
    /// 누적 펀딩 비용
    pub funding_cost: Decimal,
    /// 레버리지
    pub leverage: Decimal,
    /// 진입 주문 ID (미체결 추적용)
    pub entry_order_id: Option<String>,
    /// 거래소 SL 주문 ID
    pub sl_order_id: Option<String>,
    /// 거래소 TP1 주문 ID
    pub tp1_order_id: Option<String>,
    /// 거래소 TP2 주문 ID
    pub tp2_order_id: Option<String>,
    /// 마지막 갱신 시간 (백스톱 유예 판정용)
    pub last_update_time: DateTime<Utc>,
}

impl PositionContext {
    /// 새 실행 컨텍스트 생성.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        size_usd: Decimal,
        sl_price: Decimal,
        tp1_price: Decimal,
        leverage: Decimal,
    ) -> Self {
        Self {
            trade_id: Uuid::new_v4(),
            symbol: symbol.into(),
            direction,
            entry_price,
            entry_time,
            initial_size_usd: size_usd,
            remaining_size_usd: size_usd,
            sl_price,
            tp1_price,
            tp2_price: None,
            trailing_stop_price: None,
            tp1_hit: false,
            realized_pnl: Decimal::ZERO,
            funding_cost: Decimal::ZERO,
            leverage,
            entry_order_id: None,
            sl_order_id: None,
            tp1_order_id: None,
            tp2_order_id: None,
            last_update_time: entry_time,
        }
    }

    /// 갱신 시간 기록.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update_time = now;
    }
}

/// 명목 금액 기준 손익 계산.
///
/// `closed_size_usd * (exit - entry) / entry`를 방향 부호와 함께 적용합니다.
pub fn position_pnl(
    direction: Direction,
    entry_price: Decimal,
    exit_price: Decimal,
    closed_size_usd: Decimal,
) -> Decimal {
    if entry_price.is_zero() {
        return Decimal::ZERO;
    }
    closed_size_usd * (exit_price - entry_price) / entry_price * direction.sign()
}
