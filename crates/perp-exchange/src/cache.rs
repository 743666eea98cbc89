//! 심볼별 TTL 캐시.
//!
//! 심볼 필터, 프리미엄 인덱스처럼 자주 바뀌지 않는 거래소 메타데이터의
//! 반복 API 호출을 줄입니다. TTL이 지나면 `get()`이 `None`을 반환하고
//! 호출자가 새로 조회하여 `set()`으로 갱신합니다.

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

/// 캐시 내부 저장 항목.
struct CacheEntry<T> {
    data: T,
    created_at: Instant,
}

/// 심볼을 키로 하는 TTL 캐시.
///
/// # 스레드 안전성
///
/// 내부적으로 `RwLock`을 사용하여 다중 읽기 / 단일 쓰기를 보장합니다.
pub struct SymbolCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    ttl: Duration,
}

impl<T: Clone + Send + Sync> SymbolCache<T> {
    /// 지정된 TTL로 빈 캐시 생성.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// 캐시된 값 조회.
    ///
    /// TTL이 만료되었으면 `None`을 반환합니다.
    pub async fn get(&self, symbol: &str) -> Option<T> {
        let guard = self.entries.read().await;
        guard.get(symbol).and_then(|entry| {
            if entry.created_at.elapsed() < self.ttl {
                Some(entry.data.clone())
            } else {
                None
            }
        })
    }

    /// 값을 캐시에 저장.
    ///
    /// 기존 값이 있으면 덮어씁니다.
    pub async fn set(&self, symbol: impl Into<String>, data: T) {
        let mut guard = self.entries.write().await;
        guard.insert(
            symbol.into(),
            CacheEntry {
                data,
                created_at: Instant::now(),
            },
        );
    }

    /// 특정 심볼 무효화.
    pub async fn invalidate(&self, symbol: &str) {
        let mut guard = self.entries.write().await;
        guard.remove(symbol);
    }

    /// 전체 무효화.
    pub async fn invalidate_all(&self) {
        let mut guard = self.entries.write().await;
        guard.clear();
    }
}

impl<T> fmt::Debug for SymbolCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolCache").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn symbol_cache_basic_operations() {
        let cache: SymbolCache<String> = SymbolCache::new(Duration::from_secs(10));

        // 초기 상태: 비어있음
        assert!(cache.get("BTCUSDT").await.is_none());

        // 값 저장
        cache.set("BTCUSDT", "hello".to_string()).await;
        assert_eq!(cache.get("BTCUSDT").await, Some("hello".to_string()));

        // 다른 심볼은 영향 없음
        assert!(cache.get("ETHUSDT").await.is_none());
    }

    #[tokio::test]
    async fn symbol_cache_expiration() {
        let cache: SymbolCache<i32> = SymbolCache::new(Duration::from_millis(50));

        cache.set("BTCUSDT", 42).await;
        assert_eq!(cache.get("BTCUSDT").await, Some(42));

        // TTL 만료 대기
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("BTCUSDT").await.is_none());
    }

    #[tokio::test]
    async fn symbol_cache_invalidation() {
        let cache: SymbolCache<i32> = SymbolCache::new(Duration::from_secs(10));

        cache.set("BTCUSDT", 1).await;
        cache.set("ETHUSDT", 2).await;

        cache.invalidate("BTCUSDT").await;
        assert!(cache.get("BTCUSDT").await.is_none());
        assert_eq!(cache.get("ETHUSDT").await, Some(2));

        cache.invalidate_all().await;
        assert!(cache.get("ETHUSDT").await.is_none());
    }

    #[tokio::test]
    async fn symbol_cache_overwrite() {
        let cache: SymbolCache<i32> = SymbolCache::new(Duration::from_secs(10));

        cache.set("BTCUSDT", 1).await;
        cache.set("BTCUSDT", 2).await;
        assert_eq!(cache.get("BTCUSDT").await, Some(2));
    }
}
