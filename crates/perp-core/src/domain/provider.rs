//! 협력자 trait 정의.
//!
//! 전략, 시세 스냅샷, 포지션 영속성을 외부 구현으로부터 주입받기 위한
//! 중립적 인터페이스를 제공합니다.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use super::execution::PositionContext;
use super::market::MarketSnapshot;
use super::position::PositionStateContext;
use super::signal::TradingSignal;

/// 데이터/시세 제공자 에러.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 네트워크 에러
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 데이터 없음
    #[error("데이터 없음: {0}")]
    NoData(String),

    /// 파싱 에러
    #[error("파싱 에러: {0}")]
    Parse(String),

    /// 기타 에러
    #[error("기타 에러: {0}")]
    Other(String),
}

/// 영속성 에러.
#[derive(Debug, Error)]
pub enum StoreError {
    /// 저장소 접근 실패
    #[error("저장소 에러: {0}")]
    Backend(String),

    /// 직렬화 실패
    #[error("직렬화 에러: {0}")]
    Serialization(String),
}

/// 트레이딩 전략 trait.
///
/// 지표 계산과 신호 판단은 전적으로 구현체의 몫입니다.
/// 엔진은 신호의 유무와 내용만 소비합니다.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// 전략 식별자.
    fn id(&self) -> &str;

    /// 시장 스냅샷에서 신호 생성.
    ///
    /// 신호가 없으면 `Ok(None)` — 에러가 아닙니다.
    async fn generate_signal(
        &self,
        symbol: &str,
        snapshot: &MarketSnapshot,
    ) -> Result<Option<TradingSignal>, Box<dyn std::error::Error + Send + Sync>>;
}

/// 시장 데이터 소스 trait.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// 심볼의 현재 스냅샷 조회.
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ProviderError>;
}

/// 영속 포지션 레코드.
///
/// 생명주기 상태와 실행 컨텍스트를 함께 저장합니다.
/// `exec_ctx`는 진입 주문이 제출되기 전까지 None입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// 생명주기 상태 컨텍스트
    pub state_ctx: PositionStateContext,
    /// 실행 컨텍스트 (진입 전 None)
    pub exec_ctx: Option<PositionContext>,
}

impl PositionRecord {
    /// 상태 컨텍스트만으로 레코드 생성.
    pub fn new(state_ctx: PositionStateContext) -> Self {
        Self {
            state_ctx,
            exec_ctx: None,
        }
    }
}

/// 포지션 영속성 trait.
///
/// 심볼 키 기반 load/save/delete를 제공합니다.
/// "활성 포지션 없음"은 `Ok(None)`이며 에러가 아닙니다.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// 심볼의 포지션 레코드 조회.
    async fn load(&self, symbol: &str) -> Result<Option<PositionRecord>, StoreError>;

    /// 포지션 레코드 저장 (upsert).
    async fn save(&self, record: &PositionRecord) -> Result<(), StoreError>;

    /// 포지션 레코드 삭제.
    ///
    /// 존재하지 않는 심볼 삭제는 성공으로 처리합니다.
    async fn delete(&self, symbol: &str) -> Result<(), StoreError>;

    /// 모든 레코드 조회 (수동 스캔/백스톱용).
    async fn load_all(&self) -> Result<Vec<PositionRecord>, StoreError>;
}

/// 인메모리 포지션 저장소.
///
/// 백테스트와 단위 테스트에서 사용합니다. 실거래 배포는 외부 영속성
/// 구현을 주입합니다.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    records: RwLock<HashMap<String, PositionRecord>>,
}

impl MemoryPositionStore {
    /// 빈 저장소 생성.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self, symbol: &str) -> Result<Option<PositionRecord>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard.get(symbol).cloned())
    }

    async fn save(&self, record: &PositionRecord) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        guard.insert(record.state_ctx.symbol.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, symbol: &str) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        guard.remove(symbol);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PositionRecord>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryPositionStore::new();

        // 부재는 에러가 아님
        assert!(store.load("BTCUSDT").await.unwrap().is_none());

        let record = PositionRecord::new(PositionStateContext::new("BTCUSDT", "trend_follow", 4));
        store.save(&record).await.unwrap();

        let loaded = store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded.state_ctx.symbol, "BTCUSDT");
        assert!(loaded.exec_ctx.is_none());

        store.delete("BTCUSDT").await.unwrap();
        assert!(store.load("BTCUSDT").await.unwrap().is_none());

        // 중복 삭제도 성공
        store.delete("BTCUSDT").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_load_all() {
        let store = MemoryPositionStore::new();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let record = PositionRecord::new(PositionStateContext::new(symbol, "s", 4));
            store.save(&record).await.unwrap();
        }
        assert_eq!(store.load_all().await.unwrap().len(), 2);
    }
}
