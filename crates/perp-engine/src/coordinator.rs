//! 포지션 생명주기 Coordinator.
//!
//! 봉 마감 틱을 심볼별 단일 소비자 루프로 직렬화하고, 상태 기계가
//! 발행한 액션을 실행기로 옮기며, 모든 변경을 영속 레코드에 기록합니다.
//!
//! 진입 경로만 분산 락을 요구합니다. 활성 포지션 관리 경로는 심볼별
//! 루프가 이미 직렬화하므로 락 없이 진행합니다.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use perp_core::{
    compute_trailing_stop, process_transition, Direction, MarketDataSource, MarketSnapshot,
    PositionContext, PositionEvent, PositionRecord, PositionState, PositionStateContext,
    PositionStore, Strategy, TransitionAction,
};
use perp_execution::ActionExecutor;

use crate::config::EngineConfig;
use crate::lock::EntryLock;
use crate::risk::RiskManager;

/// 엔진 상태 요약.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    /// 활성 포지션 수
    pub active_positions: usize,
    /// 전략별 활성 포지션 수
    pub positions_by_strategy: HashMap<String, usize>,
    /// 실행 중 여부
    pub is_running: bool,
}

struct Workers {
    senders: HashMap<String, mpsc::Sender<()>>,
    running: bool,
}

/// 포지션 생명주기 Coordinator.
pub struct Coordinator {
    strategy: Arc<dyn Strategy>,
    market: Arc<dyn MarketDataSource>,
    store: Arc<dyn PositionStore>,
    executor: Arc<dyn ActionExecutor>,
    lock: Arc<dyn EntryLock>,
    risk: Arc<RiskManager>,
    config: EngineConfig,
    workers: RwLock<Workers>,
    /// 재진입 방지: 처리 중인 심볼의 틱은 버림
    processing: Mutex<std::collections::HashSet<String>>,
}

impl Coordinator {
    /// 새 Coordinator 생성.
    pub fn new(
        strategy: Arc<dyn Strategy>,
        market: Arc<dyn MarketDataSource>,
        store: Arc<dyn PositionStore>,
        executor: Arc<dyn ActionExecutor>,
        lock: Arc<dyn EntryLock>,
        risk: Arc<RiskManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            strategy,
            market,
            store,
            executor,
            lock,
            risk,
            config,
            workers: RwLock::new(Workers {
                senders: HashMap::new(),
                running: false,
            }),
            processing: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// 심볼별 워커 루프를 기동.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.write().await;
        if workers.running {
            return;
        }
        workers.running = true;

        for symbol in self.config.symbols.clone() {
            // 용량 1: 처리 중 도착한 틱은 최대 1개만 대기
            let (tx, mut rx) = mpsc::channel::<()>(1);
            workers.senders.insert(symbol.clone(), tx);

            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    coordinator.process_symbol(&symbol).await;
                }
                debug!(symbol = %symbol, "심볼 워커 종료");
            });
        }
        info!(symbols = self.config.symbols.len(), "Coordinator 시작");
    }

    /// 워커 루프 정지.
    pub async fn stop(&self) {
        let mut workers = self.workers.write().await;
        workers.running = false;
        workers.senders.clear();
        info!("Coordinator 정지");
    }

    /// 봉 마감 틱 수신.
    ///
    /// 워커가 처리 중이면 틱을 버립니다 (틱당 최대 한 번 처리).
    pub async fn on_bar_close(&self, symbol: &str) {
        let workers = self.workers.read().await;
        if !workers.running {
            return;
        }
        if let Some(tx) = workers.senders.get(symbol) {
            if tx.try_send(()).is_err() {
                debug!(symbol, "처리 중인 심볼의 틱 버림");
            }
        }
    }

    /// 엔진 상태 요약 조회.
    pub async fn get_status(&self) -> EngineStatus {
        let is_running = self.workers.read().await.running;
        let mut status = EngineStatus {
            is_running,
            ..EngineStatus::default()
        };

        match self.store.load_all().await {
            Ok(records) => {
                for record in records {
                    if record.state_ctx.is_active() {
                        status.active_positions += 1;
                        *status
                            .positions_by_strategy
                            .entry(record.state_ctx.strategy_id.clone())
                            .or_insert(0) += 1;
                    }
                }
            }
            Err(e) => error!(error = %e, "상태 조회 중 레코드 로드 실패"),
        }
        status
    }

    /// 전체 심볼 수동 재스캔.
    pub async fn scan_all(&self) {
        for symbol in self.config.symbols.clone() {
            self.process_symbol(&symbol).await;
        }
    }

    /// 심볼 한 틱 처리.
    pub async fn process_symbol(&self, symbol: &str) {
        // 재진입 방지
        {
            let mut guard = self.processing.lock().await;
            if !guard.insert(symbol.to_string()) {
                debug!(symbol, "이미 처리 중, 틱 버림");
                return;
            }
        }

        self.process_symbol_inner(symbol).await;

        self.processing.lock().await.remove(symbol);
    }

    async fn process_symbol_inner(&self, symbol: &str) {
        let record = match self.store.load(symbol).await {
            Ok(record) => record,
            Err(e) => {
                error!(symbol, error = %e, "레코드 로드 실패");
                return;
            }
        };

        match record {
            None => self.try_enter(symbol).await,
            Some(record) if record.state_ctx.state == PositionState::Idle => {
                // IDLE 잔존 레코드는 새 진입 후보
                self.try_enter(symbol).await;
            }
            Some(record) => self.manage_position(record).await,
        }
    }

    // ===== 진입 경로 =====

    /// 신규 진입 시도. 진입 락이 유일한 입장 지점입니다.
    async fn try_enter(&self, symbol: &str) {
        let acquired = match self.lock.acquire(symbol).await {
            Ok(acquired) => acquired,
            Err(e) => {
                error!(symbol, error = %e, "진입 락 획득 실패");
                return;
            }
        };
        if !acquired {
            debug!(symbol, "다른 처리자가 진입 락 보유 중");
            return;
        }

        self.try_enter_locked(symbol).await;

        // 모든 경로에서 락 해제
        if let Err(e) = self.lock.release(symbol).await {
            warn!(symbol, error = %e, "진입 락 해제 실패 (TTL 만료로 회수됨)");
        }
    }

    async fn try_enter_locked(&self, symbol: &str) {
        let snapshot = match self.market.snapshot(symbol).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(symbol, error = %e, "시장 스냅샷 조회 실패");
                return;
            }
        };

        let signal = match self.strategy.generate_signal(symbol, &snapshot).await {
            Ok(Some(signal)) => signal,
            Ok(None) => return,
            Err(e) => {
                error!(symbol, error = %e, "전략 신호 생성 실패");
                return;
            }
        };

        // 리스크 게이트 + 펀딩 오버레이
        let adjustment = match self.risk.check_entry(&signal, snapshot.funding_rate).await {
            Ok(adjustment) => adjustment,
            Err(rejection) => {
                info!(symbol, reason = %rejection, "진입 거부");
                return;
            }
        };

        let mut params = signal.to_setup_params();
        params.sl_price = adjustment.sl_price;

        // SETUP 감지 → 진입 트리거
        let state_ctx =
            PositionStateContext::new(symbol, &signal.strategy_id, self.config.entry.cooldown_bars);
        let setup = process_transition(&state_ctx, &PositionEvent::SetupDetected(params.clone()));
        if !setup.transitioned {
            return;
        }
        let trigger = process_transition(&setup.context, &PositionEvent::EntryTrigger);
        if !trigger.transitioned {
            return;
        }
        let state_ctx = trigger.context;

        let mut exec_ctx = PositionContext::new(
            symbol,
            params.direction,
            params.entry_price,
            Utc::now(),
            self.config.entry.position_size_usd,
            params.sl_price,
            params.tp1_price,
            self.config.entry.leverage,
        );

        let opened = self.executor.open_position(&mut exec_ctx).await;
        if !opened.success {
            error!(symbol, error = ?opened.error, "진입 주문 제출 실패");
            return;
        }

        self.risk.register_entry(&signal.strategy_id).await;

        let mut record = PositionRecord::new(state_ctx);
        record.exec_ctx = Some(exec_ctx);
        if let Err(e) = self.store.save(&record).await {
            error!(symbol, error = %e, "진입 레코드 저장 실패");
            return;
        }

        info!(
            symbol,
            strategy_id = %signal.strategy_id,
            direction = %params.direction,
            entry_price = %params.entry_price,
            sl_price = %params.sl_price,
            sl_tightened = adjustment.sl_tightened,
            "진입 주문 제출 완료"
        );
    }

    // ===== 활성 포지션 관리 경로 =====

    /// 현재가를 저장된 레벨과 비교하여 이번 틱의 이벤트를 결정.
    ///
    /// 틱당 하나의 이벤트만 선택합니다. 같은 봉에서 SL과 TP1이 모두
    /// 스친 경우 보수적으로 SL을 우선합니다.
    fn evaluate_event(ctx: &PositionStateContext, price: Decimal) -> PositionEvent {
        let Some(direction) = ctx.direction else {
            return PositionEvent::BarClose;
        };

        let stop_crossed = |stop: Decimal| match direction {
            Direction::Long => price <= stop,
            Direction::Short => price >= stop,
        };
        let tp_crossed = |tp: Decimal| match direction {
            Direction::Long => price >= tp,
            Direction::Short => price <= tp,
        };

        if ctx.state == PositionState::Trailing {
            if let Some(trail) = ctx.trailing_stop_price {
                if stop_crossed(trail) {
                    return PositionEvent::TrailHit;
                }
            }
        }

        if let Some(sl) = ctx.sl_price {
            if stop_crossed(sl) {
                return PositionEvent::StopHit;
            }
        }

        if !ctx.tp1_hit {
            if let Some(tp1) = ctx.tp1_price {
                if tp_crossed(tp1) {
                    return PositionEvent::Tp1Hit;
                }
            }
        }

        PositionEvent::BarClose
    }

    async fn manage_position(&self, mut record: PositionRecord) {
        let symbol = record.state_ctx.symbol.clone();
        let snapshot = match self.market.snapshot(&symbol).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "시장 스냅샷 조회 실패");
                return;
            }
        };

        let event = if record.state_ctx.is_active() {
            Self::evaluate_event(&record.state_ctx, snapshot.current_price)
        } else {
            // EXITED/COOLDOWN/SETUP/ENTRY_PENDING은 봉 마감만 진행
            PositionEvent::BarClose
        };

        let result = process_transition(&record.state_ctx, &event);
        debug!(
            symbol = %symbol,
            event = event.name(),
            from = %record.state_ctx.state,
            to = %result.new_state,
            transitioned = result.transitioned,
            "틱 처리"
        );
        record.state_ctx = result.context;

        let full_exit = self
            .execute_actions(&mut record, &result.actions, snapshot.current_price)
            .await;

        // 트레일링 관리 중이면 래칫 갱신 시도
        if record.state_ctx.state == PositionState::Trailing {
            self.advance_trailing_stop(&mut record, &snapshot).await;
        }

        if full_exit {
            if let Some(exec) = record.exec_ctx.as_ref() {
                self.risk
                    .record_outcome(
                        &record.state_ctx.strategy_id,
                        exec.realized_pnl - exec.funding_cost,
                    )
                    .await;
            }
        }

        // 쿨다운 자연 만료로 IDLE 복귀 시 레코드 제거
        if record.state_ctx.state == PositionState::Idle {
            if let Err(e) = self.store.delete(&symbol).await {
                error!(symbol = %symbol, error = %e, "레코드 삭제 실패");
            }
            return;
        }

        if let Err(e) = self.store.save(&record).await {
            error!(symbol = %symbol, error = %e, "레코드 저장 실패");
        }
    }

    /// 상태 기계가 발행한 액션을 실행.
    ///
    /// 전량 청산이 일어났으면 `true`를 반환합니다.
    async fn execute_actions(
        &self,
        record: &mut PositionRecord,
        actions: &[TransitionAction],
        price: Decimal,
    ) -> bool {
        let symbol = record.state_ctx.symbol.clone();
        let mut full_exit = false;

        for action in actions {
            let Some(exec) = record.exec_ctx.as_mut() else {
                // 실행 컨텍스트 없이 수행할 수 있는 액션만 처리
                if let TransitionAction::Log { message } = action {
                    info!(symbol = %symbol, "{}", message);
                }
                continue;
            };

            match action {
                TransitionAction::ClosePartial { percent, reason } => {
                    let result = self
                        .executor
                        .close_partial(exec, *percent, price, *reason)
                        .await;
                    if !result.success {
                        error!(symbol = %symbol, error = ?result.error, "부분 청산 실패");
                    }
                }
                TransitionAction::CloseAll { reason } => {
                    let result = self.executor.close_all(exec, price, *reason).await;
                    if result.success {
                        full_exit = true;
                    } else {
                        error!(symbol = %symbol, error = ?result.error, "전량 청산 실패");
                    }
                }
                TransitionAction::PlaceSlOrder => {
                    let result = self.executor.place_protective_orders(exec).await;
                    if !result.success {
                        error!(symbol = %symbol, error = ?result.error, "보호 주문 배치 실패");
                    }
                }
                TransitionAction::MoveSlToBreakeven => {
                    let result = self.executor.move_sl_to_breakeven(exec).await;
                    if !result.success {
                        warn!(symbol = %symbol, error = ?result.error, "본전 이동 실패");
                    }
                }
                TransitionAction::UpdateTrailingStop { price: new_stop } => {
                    self.executor.update_trailing_stop(exec, *new_stop).await;
                }
                TransitionAction::UpdateSlOnExchange { price: sl_price } => {
                    let result = self.executor.update_sl_on_exchange(exec, *sl_price).await;
                    if !result.success {
                        warn!(symbol = %symbol, error = ?result.error, "SL 교체 실패");
                    }
                }
                TransitionAction::CalculateFundingCost => {
                    let funding = self
                        .executor
                        .calculate_funding_cost(
                            &exec.symbol,
                            exec.initial_size_usd,
                            exec.entry_time,
                            Utc::now(),
                            exec.direction,
                        )
                        .await;
                    exec.funding_cost += funding.total_cost;
                    if funding.periods > 0 {
                        info!(
                            symbol = %symbol,
                            periods = funding.periods,
                            total_cost = %funding.total_cost,
                            "펀딩 비용 정산"
                        );
                    }
                }
                TransitionAction::StartCooldown => {
                    info!(
                        symbol = %symbol,
                        cooldown_bars = record.state_ctx.cooldown_bars,
                        "쿨다운 시작"
                    );
                }
                TransitionAction::Log { message } => {
                    info!(symbol = %symbol, "{}", message);
                }
            }
        }

        full_exit
    }

    /// 트레일링 스톱 래칫 전진.
    async fn advance_trailing_stop(&self, record: &mut PositionRecord, snapshot: &MarketSnapshot) {
        let ctx = &record.state_ctx;
        let Some(direction) = ctx.direction else {
            return;
        };
        let Some(candidate) = compute_trailing_stop(
            direction,
            snapshot.current_price,
            snapshot.atr,
            ctx.trail_atr_mult,
            ctx.trailing_stop_price,
        ) else {
            return;
        };

        let Some(exec) = record.exec_ctx.as_mut() else {
            return;
        };
        if self.executor.update_trailing_stop(exec, candidate).await {
            record.state_ctx.trailing_stop_price = Some(candidate);
            debug!(
                symbol = %record.state_ctx.symbol,
                trailing_stop = %candidate,
                "트레일링 스톱 갱신"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use perp_core::{
        Candle, MemoryPositionStore, ProviderError, TradingSignal,
    };
    use perp_execution::{SimulatedExecutor, SimulatedExecutorConfig, SimulatedMarket};
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock as TokioRwLock;

    use crate::config::{EntryConfig, ReconciliationConfig, RiskConfig};
    use crate::lock::MemoryEntryLock;

    use super::*;

    /// 고정 신호를 반환하는 테스트 전략.
    struct FixedStrategy {
        signal: TokioRwLock<Option<TradingSignal>>,
    }

    impl FixedStrategy {
        fn with_signal(signal: TradingSignal) -> Self {
            Self {
                signal: TokioRwLock::new(Some(signal)),
            }
        }

        fn silent() -> Self {
            Self {
                signal: TokioRwLock::new(None),
            }
        }

        async fn clear(&self) {
            *self.signal.write().await = None;
        }
    }

    #[async_trait]
    impl Strategy for FixedStrategy {
        fn id(&self) -> &str {
            "fixed"
        }

        async fn generate_signal(
            &self,
            _symbol: &str,
            _snapshot: &MarketSnapshot,
        ) -> Result<Option<TradingSignal>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.signal.read().await.clone())
        }
    }

    /// 가격을 주입할 수 있는 시장 데이터 소스.
    struct StubMarket {
        price: TokioRwLock<Decimal>,
        funding_rate: Decimal,
    }

    impl StubMarket {
        fn at(price: Decimal) -> Self {
            Self {
                price: TokioRwLock::new(price),
                funding_rate: Decimal::ZERO,
            }
        }

        async fn set_price(&self, price: Decimal) {
            *self.price.write().await = price;
        }
    }

    #[async_trait]
    impl MarketDataSource for StubMarket {
        async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ProviderError> {
            let price = *self.price.read().await;
            Ok(MarketSnapshot {
                symbol: symbol.to_string(),
                candles: vec![Candle {
                    open_time: Utc::now(),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: dec!(100),
                    close_time: Utc::now(),
                }],
                current_price: price,
                atr: dec!(2),
                avg_daily_volume_usd: dec!(1000000),
                funding_rate: self.funding_rate,
                timestamp: Utc::now(),
            })
        }
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        strategy: Arc<FixedStrategy>,
        market: Arc<StubMarket>,
        store: Arc<MemoryPositionStore>,
        executor: Arc<SimulatedExecutor>,
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            redis_url: None,
            symbols: vec!["BTCUSDT".to_string()],
            entry: EntryConfig {
                position_size_usd: dec!(1000),
                leverage: dec!(3),
                cooldown_bars: 2,
                entry_lock_ttl_secs: 60,
            },
            risk: RiskConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }

    async fn harness(strategy: FixedStrategy, start_price: Decimal) -> Harness {
        let strategy = Arc::new(strategy);
        let market = Arc::new(StubMarket::at(start_price));
        let store = Arc::new(MemoryPositionStore::new());
        let executor = Arc::new(SimulatedExecutor::new(SimulatedExecutorConfig::frictionless()));
        executor
            .set_market(
                "BTCUSDT",
                SimulatedMarket {
                    price: start_price,
                    atr: dec!(2),
                    avg_daily_volume_usd: dec!(1000000),
                },
            )
            .await;

        let coordinator = Arc::new(Coordinator::new(
            strategy.clone(),
            market.clone(),
            store.clone(),
            executor.clone(),
            Arc::new(MemoryEntryLock::new(Duration::from_secs(60))),
            Arc::new(RiskManager::new(RiskConfig::default())),
            engine_config(),
        ));

        Harness {
            coordinator,
            strategy,
            market,
            store,
            executor,
        }
    }

    fn long_signal() -> TradingSignal {
        TradingSignal::new("fixed", "BTCUSDT", Direction::Long, dec!(100), dec!(95), dec!(105))
            .with_time_stop(10)
    }

    /// 진입 주문 체결을 시뮬레이션 (백테스트에서 스트림 역할).
    async fn fill_entry(store: &MemoryPositionStore, price: Decimal) {
        let mut record = store.load("BTCUSDT").await.unwrap().unwrap();
        let result = process_transition(
            &record.state_ctx,
            &PositionEvent::OrderFilled {
                fill_price: price,
                size_usd: dec!(1000),
                time: Utc::now(),
            },
        );
        record.state_ctx = result.context;
        store.save(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_creates_pending_record() {
        let h = harness(FixedStrategy::with_signal(long_signal()), dec!(100)).await;

        h.coordinator.process_symbol("BTCUSDT").await;

        let record = h.store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(record.state_ctx.state, PositionState::EntryPending);
        let exec = record.exec_ctx.unwrap();
        assert_eq!(exec.initial_size_usd, dec!(1000));
        assert!(exec.entry_order_id.is_some());
    }

    #[tokio::test]
    async fn test_no_signal_no_record() {
        let h = harness(FixedStrategy::silent(), dec!(100)).await;

        h.coordinator.process_symbol("BTCUSDT").await;

        assert!(h.store.load("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_position_skips_entry() {
        let h = harness(FixedStrategy::with_signal(long_signal()), dec!(100)).await;

        h.coordinator.process_symbol("BTCUSDT").await;
        fill_entry(&h.store, dec!(100)).await;

        // 활성 포지션이 있으면 새 신호가 있어도 진입하지 않음
        h.coordinator.process_symbol("BTCUSDT").await;
        let record = h.store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(record.state_ctx.state, PositionState::InPosition);
        assert_eq!(record.exec_ctx.unwrap().remaining_size_usd, dec!(1000));
    }

    #[tokio::test]
    async fn test_tp1_then_trailing_then_trail_hit() {
        let h = harness(FixedStrategy::with_signal(long_signal()), dec!(100)).await;

        h.coordinator.process_symbol("BTCUSDT").await;
        fill_entry(&h.store, dec!(100)).await;
        h.strategy.clear().await;

        // TP1 도달 → SCALE_OUT, 30% 청산, SL 본전
        h.market.set_price(dec!(105)).await;
        h.coordinator.process_symbol("BTCUSDT").await;
        let record = h.store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(record.state_ctx.state, PositionState::ScaleOut);
        assert!(record.state_ctx.tp1_hit);
        let exec = record.exec_ctx.as_ref().unwrap();
        assert_eq!(exec.remaining_size_usd, dec!(700));
        assert_eq!(exec.realized_pnl, dec!(15));

        // 다음 봉 마감 → TRAILING, 래칫 시작 (105 - 2*2 = 101)
        h.coordinator.process_symbol("BTCUSDT").await;
        let record = h.store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(record.state_ctx.state, PositionState::Trailing);
        assert_eq!(record.state_ctx.trailing_stop_price, Some(dec!(101)));

        // 트레일 이탈 → EXITED
        h.market.set_price(dec!(100.5)).await;
        h.coordinator.process_symbol("BTCUSDT").await;
        let record = h.store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(record.state_ctx.state, PositionState::Exited);
        assert_eq!(record.exec_ctx.unwrap().remaining_size_usd, Decimal::ZERO);

        // 부분 청산 + 전량 청산 두 건이 기록되어야 함
        let trades = h.executor.trades().await;
        assert_eq!(trades.len(), 2);

        // EXITED → COOLDOWN → 쿨다운 소화 → 레코드 제거로 한 사이클 완료
        h.coordinator.process_symbol("BTCUSDT").await;
        h.coordinator.process_symbol("BTCUSDT").await;
        h.coordinator.process_symbol("BTCUSDT").await;
        assert!(h.store.load("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_expiry_deletes_record() {
        let h = harness(FixedStrategy::with_signal(long_signal()), dec!(100)).await;

        h.coordinator.process_symbol("BTCUSDT").await;
        fill_entry(&h.store, dec!(100)).await;
        h.strategy.clear().await;

        // 손절 → EXITED
        h.market.set_price(dec!(94)).await;
        h.coordinator.process_symbol("BTCUSDT").await;
        assert_eq!(
            h.store.load("BTCUSDT").await.unwrap().unwrap().state_ctx.state,
            PositionState::Exited
        );

        // EXITED → COOLDOWN (1봉 지연)
        h.coordinator.process_symbol("BTCUSDT").await;
        assert_eq!(
            h.store.load("BTCUSDT").await.unwrap().unwrap().state_ctx.state,
            PositionState::Cooldown
        );

        // 쿨다운 2봉 소화 후 레코드 제거
        h.coordinator.process_symbol("BTCUSDT").await;
        h.coordinator.process_symbol("BTCUSDT").await;
        assert!(h.store.load("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sl_beats_tp1_on_same_bar() {
        // 같은 봉에서 SL/TP1 모두 스친 경우 SL 우선
        let mut ctx = PositionStateContext::new("BTCUSDT", "fixed", 2);
        ctx.state = PositionState::InPosition;
        ctx.direction = Some(Direction::Long);
        ctx.sl_price = Some(dec!(95));
        ctx.tp1_price = Some(dec!(105));

        // 가격이 SL 아래: StopHit
        assert_eq!(
            Coordinator::evaluate_event(&ctx, dec!(94)),
            PositionEvent::StopHit
        );
        // 가격이 TP1 위: Tp1Hit
        assert_eq!(
            Coordinator::evaluate_event(&ctx, dec!(106)),
            PositionEvent::Tp1Hit
        );
        // 중간: BarClose
        assert_eq!(
            Coordinator::evaluate_event(&ctx, dec!(100)),
            PositionEvent::BarClose
        );
    }

    #[tokio::test]
    async fn test_status_counts_active_positions() {
        let h = harness(FixedStrategy::with_signal(long_signal()), dec!(100)).await;

        let before = h.coordinator.get_status().await;
        assert_eq!(before.active_positions, 0);
        assert!(!before.is_running);

        h.coordinator.process_symbol("BTCUSDT").await;
        fill_entry(&h.store, dec!(100)).await;

        let after = h.coordinator.get_status().await;
        assert_eq!(after.active_positions, 1);
        assert_eq!(after.positions_by_strategy.get("fixed"), Some(&1));
    }

    #[tokio::test]
    async fn test_time_stop_forces_exit() {
        let signal = TradingSignal::new(
            "fixed",
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(95),
            dec!(105),
        )
        .with_time_stop(2);
        let h = harness(FixedStrategy::with_signal(signal), dec!(100)).await;

        h.coordinator.process_symbol("BTCUSDT").await;
        fill_entry(&h.store, dec!(100)).await;
        h.strategy.clear().await;

        // 2봉 경과 시 타임 스톱
        h.coordinator.process_symbol("BTCUSDT").await;
        h.coordinator.process_symbol("BTCUSDT").await;

        let record = h.store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(record.state_ctx.state, PositionState::Exited);
        assert_eq!(
            record.state_ctx.exit_reason,
            Some(perp_core::ExitReason::TimeStop)
        );
    }
}
