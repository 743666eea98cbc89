//! 펀딩 비용 계산.
//!
//! 무기한 선물은 8시간마다 펀딩이 정산됩니다. 롱은 양수 요율을
//! 지불하고 숏은 수취합니다 (음수 요율이면 반대).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use perp_core::{Direction, FundingCostResult};

/// 펀딩 정산 주기 (시간).
pub const FUNDING_PERIOD_HOURS: i64 = 8;

/// 경과한 펀딩 주기 수.
///
/// `floor((exit - entry) / 8h)`. 역순 시간이면 0.
pub fn elapsed_funding_periods(entry_time: DateTime<Utc>, exit_time: DateTime<Utc>) -> u32 {
    let elapsed = exit_time - entry_time;
    if elapsed.num_seconds() <= 0 {
        return 0;
    }
    (elapsed.num_hours() / FUNDING_PERIOD_HOURS) as u32
}

/// 펀딩 비용 계산 (순수 함수).
///
/// `rates`는 주기별 요율 목록입니다. 주기 수보다 짧으면 마지막 요율을
/// 이어서 사용하고, 비어 있으면 비용 0입니다.
///
/// 부호 규약: 양수 `total_cost` = 포지션이 지불, 음수 = 수취.
pub fn funding_cost(
    size_usd: Decimal,
    direction: Direction,
    periods: u32,
    rates: &[Decimal],
) -> FundingCostResult {
    if periods == 0 || rates.is_empty() {
        return FundingCostResult::zero();
    }

    let mut total_cost = Decimal::ZERO;
    let mut rate_sum = Decimal::ZERO;

    for i in 0..periods as usize {
        let rate = rates.get(i).or_else(|| rates.last()).copied().unwrap_or(Decimal::ZERO);
        rate_sum += rate;
        // 롱은 양수 요율 지불, 숏은 수취
        total_cost += size_usd * rate * direction.sign();
    }

    FundingCostResult {
        total_cost,
        periods,
        avg_rate: rate_sum / Decimal::from(periods),
    }
}
