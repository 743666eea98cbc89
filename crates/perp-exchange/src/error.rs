//! 거래소 에러 분류.
//!
//! 에러를 다섯 부류로 나누어 호출자가 복구 전략을 결정합니다:
//! - 일시적 (네트워크, 타임아웃, Rate Limit): 재시도
//! - 멱등 충돌 (이미 취소됨/이미 체결됨): 성공으로 간주
//! - 경합 (주문 ID 미발견 직후): 유예 후 재조회
//! - 치명적 (인증 실패, 잔고 부족): 즉시 실패
//! - 입력 오류 (잘못된 주문 파라미터): 즉시 실패, 코드 버그

use thiserror::Error;

/// 거래소 작업 결과 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 거래소 API 에러.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// 네트워크 연결 실패 (재시도 가능)
    #[error("네트워크 오류: {0}")]
    NetworkError(String),

    /// 요청 타임아웃 (재시도 가능)
    #[error("요청 타임아웃: {0}")]
    Timeout(String),

    /// Rate Limit 초과 (지정 시간 대기 후 재시도)
    #[error("Rate Limit 초과 (대기 {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    /// WebSocket 연결 끊김 (재시도 가능)
    #[error("연결 끊김: {0}")]
    Disconnected(String),

    /// 주문이 이미 취소되었거나 체결됨 (멱등 충돌, 호출자가 성공 처리)
    #[error("주문 이미 종결됨: {0}")]
    OrderAlreadyClosed(String),

    /// 주문 ID를 찾을 수 없음 (제출 직후 경합 가능)
    #[error("주문 미발견: {0}")]
    OrderNotFound(String),

    /// 인증 실패 (치명적)
    #[error("인증 실패: {0}")]
    Unauthorized(String),

    /// 잔고 부족 (치명적)
    #[error("잔고 부족: {0}")]
    InsufficientBalance(String),

    /// 잘못된 주문 파라미터 (입력 오류, 재시도 무의미)
    #[error("잘못된 주문: {0}")]
    InvalidOrder(String),

    /// 응답 파싱 실패
    #[error("파싱 오류: {0}")]
    ParseError(String),

    /// 지원하지 않는 기능
    #[error("미지원 기능: {0}")]
    NotSupported(String),

    /// 기타 거래소 API 에러
    #[error("거래소 API 오류 (code {code}): {message}")]
    Api { code: i64, message: String },
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 판단.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::Disconnected(_)
        )
    }

    /// 치명적 에러인지 판단 (재시도 금지).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::InsufficientBalance(_) | Self::InvalidOrder(_)
        )
    }

    /// 이미 처리된 주문에 대한 멱등 충돌인지 판단.
    ///
    /// 취소 요청이 이 에러를 받으면 목적이 이미 달성된 것이므로
    /// 성공으로 간주합니다.
    pub fn is_idempotent_conflict(&self) -> bool {
        matches!(self, Self::OrderAlreadyClosed(_))
    }

    /// 에러에 지정된 재시도 대기 시간 (ms).
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
