//! 심볼별 진입 락.
//!
//! 같은 심볼의 진입 경로가 다중 인스턴스/동시 틱에서 겹치지 않도록
//! 짧은 TTL의 분산 락을 둡니다. TTL은 락 해제 누락(크래시 등)을
//! 자동 회수하기 위한 안전장치입니다.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// 락 백엔드 에러.
#[derive(Debug, Error)]
pub enum LockError {
    /// Redis 접근 실패
    #[error("락 백엔드 에러: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Backend(e.to_string())
    }
}

/// 진입 락 trait.
///
/// `acquire`는 락 획득 성공 여부를 반환합니다 (이미 잡혀 있으면 `false`).
#[async_trait]
pub trait EntryLock: Send + Sync {
    /// 심볼 락 획득 시도.
    async fn acquire(&self, symbol: &str) -> Result<bool, LockError>;

    /// 심볼 락 해제.
    ///
    /// 잡혀 있지 않은 락 해제는 성공으로 처리합니다.
    async fn release(&self, symbol: &str) -> Result<(), LockError>;
}

/// Redis 기반 분산 진입 락 (SET NX EX).
pub struct RedisEntryLock {
    conn: redis::aio::ConnectionManager,
    ttl: Duration,
    key_prefix: String,
}

impl RedisEntryLock {
    /// Redis URL로 연결하여 락 생성.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(LockError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(LockError::from)?;
        Ok(Self {
            conn,
            ttl,
            key_prefix: "perp:entry_lock".to_string(),
        })
    }

    fn key(&self, symbol: &str) -> String {
        format!("{}:{}", self.key_prefix, symbol)
    }
}

#[async_trait]
impl EntryLock for RedisEntryLock {
    async fn acquire(&self, symbol: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        // SET key value NX EX ttl
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(symbol))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        let ok = acquired.is_some();
        debug!(symbol, acquired = ok, "진입 락 획득 시도");
        Ok(ok)
    }

    async fn release(&self, symbol: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key(symbol))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// 인메모리 진입 락.
///
/// 단일 프로세스 배포와 테스트에서 사용합니다. TTL 만료 의미는
/// Redis 구현과 동일합니다.
pub struct MemoryEntryLock {
    held: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl MemoryEntryLock {
    /// 지정 TTL의 빈 락 생성.
    pub fn new(ttl: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl EntryLock for MemoryEntryLock {
    async fn acquire(&self, symbol: &str) -> Result<bool, LockError> {
        let mut guard = self.held.lock().await;
        match guard.get(symbol) {
            Some(acquired_at) if acquired_at.elapsed() < self.ttl => Ok(false),
            _ => {
                guard.insert(symbol.to_string(), Instant::now());
                Ok(true)
            }
        }
    }

    async fn release(&self, symbol: &str) -> Result<(), LockError> {
        let mut guard = self.held.lock().await;
        guard.remove(symbol);
        Ok(())
    }
}
