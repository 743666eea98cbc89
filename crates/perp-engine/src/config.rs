//! 환경변수 기반 엔진 설정.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// 엔진 전체 설정.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis URL (None이면 인메모리 락 사용)
    pub redis_url: Option<String>,
    /// 관리 대상 심볼 목록
    pub symbols: Vec<String>,
    /// 진입 설정
    pub entry: EntryConfig,
    /// 리스크 게이트 설정
    pub risk: RiskConfig,
    /// 정합성 보정 설정
    pub reconciliation: ReconciliationConfig,
}

/// 진입 경로 설정.
#[derive(Debug, Clone)]
pub struct EntryConfig {
    /// 포지션 명목 금액 (USD)
    pub position_size_usd: Decimal,
    /// 레버리지
    pub leverage: Decimal,
    /// 쿨다운 봉 수
    pub cooldown_bars: u32,
    /// 심볼별 진입 락 TTL (초)
    pub entry_lock_ttl_secs: u64,
}

/// 리스크 게이트 설정.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// 전략별 최대 동시 포지션 수
    pub max_positions_per_strategy: usize,
    /// 전체 최대 동시 포지션 수
    pub max_total_positions: usize,
    /// 진입을 차단하는 펀딩 비율 절대값 (8시간 기준)
    pub funding_block_threshold: Decimal,
    /// 포지션 방향이 펀딩을 지불할 때 SL을 조이는 비율
    pub funding_sl_tighten_rate: Decimal,
}

/// 정합성 보정 설정.
///
/// 임계값 기본치는 운영에서 검증된 값이며 환경변수로만 조정합니다.
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// 체결가-목표가 근접 판정 비율 (0.005 = 0.5%)
    pub fill_price_proximity_rate: Decimal,
    /// 부분 체결 대기 시간 (초)
    pub partial_fill_timeout_secs: u64,
    /// 잔량 즉시 청산 기준 명목 금액 (USD)
    pub min_remainder_notional_usd: Decimal,
    /// 백스톱 유예 시간 (초)
    pub backstop_grace_secs: i64,
    /// 처리 완료 이벤트 키 보존 시간 (초)
    pub processed_event_ttl_secs: u64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            position_size_usd: dec!(1000),
            leverage: dec!(3),
            cooldown_bars: 4,
            entry_lock_ttl_secs: 60,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions_per_strategy: 3,
            max_total_positions: 10,
            funding_block_threshold: dec!(0.003),
            funding_sl_tighten_rate: dec!(0.3),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            fill_price_proximity_rate: dec!(0.005),
            partial_fill_timeout_secs: 30,
            min_remainder_notional_usd: dec!(10),
            backstop_grace_secs: 5,
            processed_event_ttl_secs: 3600,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            symbols: Vec::new(),
            entry: EntryConfig::default(),
            risk: RiskConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 환경변수에서 설정 로드.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            redis_url: std::env::var("REDIS_URL").ok(),
            symbols: env_var_list("ENGINE_SYMBOLS"),
            entry: EntryConfig {
                position_size_usd: env_var_parse("ENTRY_POSITION_SIZE_USD", dec!(1000)),
                leverage: env_var_parse("ENTRY_LEVERAGE", dec!(3)),
                cooldown_bars: env_var_parse("ENTRY_COOLDOWN_BARS", 4),
                entry_lock_ttl_secs: env_var_parse("ENTRY_LOCK_TTL_SECS", 60),
            },
            risk: RiskConfig {
                max_positions_per_strategy: env_var_parse("RISK_MAX_PER_STRATEGY", 3),
                max_total_positions: env_var_parse("RISK_MAX_TOTAL", 10),
                funding_block_threshold: env_var_parse("RISK_FUNDING_BLOCK", dec!(0.003)),
                funding_sl_tighten_rate: env_var_parse("RISK_FUNDING_SL_TIGHTEN", dec!(0.3)),
            },
            reconciliation: ReconciliationConfig {
                fill_price_proximity_rate: env_var_parse("RECON_FILL_PROXIMITY", dec!(0.005)),
                partial_fill_timeout_secs: env_var_parse("RECON_PARTIAL_FILL_TIMEOUT_SECS", 30),
                min_remainder_notional_usd: env_var_parse("RECON_MIN_REMAINDER_USD", dec!(10)),
                backstop_grace_secs: env_var_parse("RECON_BACKSTOP_GRACE_SECS", 5),
                processed_event_ttl_secs: env_var_parse("RECON_PROCESSED_EVENT_TTL_SECS", 3600),
            },
        }
    }
}

impl EntryConfig {
    /// 진입 락 TTL을 Duration으로 반환.
    pub fn entry_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_lock_ttl_secs)
    }
}

impl ReconciliationConfig {
    /// 부분 체결 대기 시간을 Duration으로 반환.
    pub fn partial_fill_timeout(&self) -> Duration {
        Duration::from_secs(self.partial_fill_timeout_secs)
    }

    /// 처리 완료 이벤트 키 보존 시간.
    pub fn processed_event_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_event_ttl_secs)
    }
}

/// 환경변수에서 값을 파싱 (실패 시 기본값 사용)
fn env_var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// 환경변수에서 쉼표로 구분된 리스트 파싱
fn env_var_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
