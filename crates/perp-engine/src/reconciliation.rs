//! 스트림/거래소 정합성 보정.
//!
//! 사용자 데이터 스트림의 주문 이벤트를 로컬 생명주기에 반영하고,
//! 로컬 상태와 거래소 실상태의 불일치를 백스톱 스위프로 회수합니다.
//!
//! 이 경로는 Coordinator가 소유한 컨텍스트를 직접 만지지 않고
//! 영속 레코드에만 기록합니다. Coordinator는 다음 틱에 레코드를
//! 다시 로드하여 이어갑니다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use perp_core::{
    position_pnl, process_transition, ExitReason, PositionContext, PositionEvent, PositionRecord,
    PositionState, PositionStore,
};
use perp_exchange::{
    FuturesExchange, OrderStatus, OrderType, OrderUpdateEvent, UserDataStream, UserStreamEvent,
};
use perp_execution::ActionExecutor;

use crate::config::ReconciliationConfig;
use crate::risk::RiskManager;

/// 체결 이벤트의 추정 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillReason {
    /// 진입 주문 체결
    Entry,
    /// 손절 체결
    StopLoss,
    /// 1차 익절 체결
    Tp1,
    /// 2차 익절 체결
    Tp2,
}

/// 정합성 보정 핸들러.
#[derive(Clone)]
pub struct ReconciliationHandler {
    exchange: Arc<dyn FuturesExchange>,
    executor: Arc<dyn ActionExecutor>,
    store: Arc<dyn PositionStore>,
    risk: Arc<RiskManager>,
    config: ReconciliationConfig,
    /// 처리 완료 이벤트 키와 처리 시각 (중복/재정렬 방어, TTL 소거)
    processed: Arc<Mutex<HashMap<String, Instant>>>,
    /// 부분 체결 타이머가 진행 중인 주문 ID
    pending_partials: Arc<Mutex<HashSet<String>>>,
}

impl ReconciliationHandler {
    /// 새 핸들러 생성.
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn PositionStore>,
        risk: Arc<RiskManager>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            exchange,
            executor,
            store,
            risk,
            config,
            processed: Arc::new(Mutex::new(HashMap::new())),
            pending_partials: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 체결가가 목표가의 근접 범위 내인지 판정.
    fn within_proximity(&self, fill_price: Decimal, target: Decimal) -> bool {
        if target <= Decimal::ZERO {
            return false;
        }
        ((fill_price - target) / target).abs() <= self.config.fill_price_proximity_rate
    }

    /// 체결 사유 추정.
    ///
    /// 우선순위: (a) 주문 ID 일치 → (b) 지정가 계열 목표가 근접
    /// (TP1 미도달 시) → (c) 보고된 주문 유형 → (d) 진입가 대비 손익 방향.
    pub fn infer_fill_reason(
        &self,
        exec: &PositionContext,
        event: &OrderUpdateEvent,
    ) -> FillReason {
        // (a) 주문 ID 일치가 항상 우선
        if exec.entry_order_id.as_deref() == Some(event.order_id.as_str()) {
            return FillReason::Entry;
        }
        if exec.sl_order_id.as_deref() == Some(event.order_id.as_str()) {
            return FillReason::StopLoss;
        }
        if exec.tp1_order_id.as_deref() == Some(event.order_id.as_str()) {
            return FillReason::Tp1;
        }
        if exec.tp2_order_id.as_deref() == Some(event.order_id.as_str()) {
            return FillReason::Tp2;
        }

        let fill_price = if event.avg_price > Decimal::ZERO {
            event.avg_price
        } else {
            event.last_filled_price
        };

        // (b) 목표가 근접 (지정가 계열 체결 + TP1 미도달 시에만)
        // 스톱 체결이 갭으로 목표가 근처에 찍히는 경우는 (c)로 넘긴다
        if event.order_type.is_limit_like() && !exec.tp1_hit {
            if self.within_proximity(fill_price, exec.tp1_price) {
                return FillReason::Tp1;
            }
            if self.within_proximity(fill_price, exec.sl_price) {
                return FillReason::StopLoss;
            }
        }

        // (c) 보고된 주문 유형
        match event.order_type {
            OrderType::StopMarket => return FillReason::StopLoss,
            t if t.is_take_profit() => {
                return if exec.tp1_hit {
                    FillReason::Tp2
                } else {
                    FillReason::Tp1
                };
            }
            _ => {}
        }

        // (d) 진입가 대비 손익 방향
        let pnl = position_pnl(exec.direction, exec.entry_price, fill_price, Decimal::ONE);
        if pnl >= Decimal::ZERO {
            if exec.tp1_hit {
                FillReason::Tp2
            } else {
                FillReason::Tp1
            }
        } else {
            FillReason::StopLoss
        }
    }

    /// 이벤트 중복 여부 검사 후 처리 완료로 마킹.
    ///
    /// 보존 시간이 지난 키는 소거하여 장기 실행 시 무한 증가를 막습니다.
    async fn mark_processed(&self, key: String) -> bool {
        let mut guard = self.processed.lock().await;
        let now = Instant::now();
        let ttl = self.config.processed_event_ttl();
        guard.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
        guard.insert(key, now).is_none()
    }

    /// 주문 이벤트 처리.
    ///
    /// 중복 이벤트는 무시합니다. 전이는 정확히 한 번만 적용됩니다.
    pub async fn handle_order_update(&self, event: &OrderUpdateEvent) {
        let key = format!(
            "{}:{:?}:{}",
            event.order_id,
            event.status,
            event.update_time.timestamp_millis()
        );
        if !self.mark_processed(key).await {
            return;
        }

        let relevant = matches!(
            event.status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled | OrderStatus::Canceled
        );
        if !relevant {
            return;
        }

        let record = match self.store.load(&event.symbol).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(symbol = %event.symbol, order_id = %event.order_id, "추적 중이 아닌 심볼의 체결 이벤트 무시");
                return;
            }
            Err(e) => {
                error!(symbol = %event.symbol, error = %e, "레코드 로드 실패");
                return;
            }
        };

        if event.status == OrderStatus::Canceled {
            // 진입 주문 취소는 쿨다운 없이 IDLE 복귀
            let is_entry = record
                .exec_ctx
                .as_ref()
                .and_then(|e| e.entry_order_id.as_deref())
                == Some(event.order_id.as_str());
            if is_entry {
                let result = process_transition(&record.state_ctx, &PositionEvent::OrderCancelled);
                if result.transitioned {
                    info!(symbol = %event.symbol, "진입 주문 취소, 셋업 폐기");
                    if let Err(e) = self.store.delete(&event.symbol).await {
                        error!(symbol = %event.symbol, error = %e, "레코드 삭제 실패");
                    }
                }
            }
            return;
        }

        if event.status == OrderStatus::PartiallyFilled {
            // 대기 후 확정 상태를 재조회하여 처리
            self.schedule_partial_fill_check(event.symbol.clone(), event.order_id.clone())
                .await;
            return;
        }

        self.apply_fill(record, event).await;
    }

    /// 확정 체결을 레코드에 반영.
    async fn apply_fill(&self, mut record: PositionRecord, event: &OrderUpdateEvent) {
        let Some(mut exec) = record.exec_ctx.clone() else {
            warn!(symbol = %event.symbol, "실행 컨텍스트 없는 레코드의 체결 이벤트 무시");
            return;
        };

        let reason = self.infer_fill_reason(&exec, event);
        let fill_price = if event.avg_price > Decimal::ZERO {
            event.avg_price
        } else {
            event.last_filled_price
        };

        info!(
            symbol = %event.symbol,
            order_id = %event.order_id,
            reason = ?reason,
            fill_price = %fill_price,
            "체결 이벤트 반영"
        );

        let machine_event = match reason {
            FillReason::Entry => PositionEvent::OrderFilled {
                fill_price,
                size_usd: exec.initial_size_usd,
                time: event.update_time,
            },
            FillReason::Tp1 => PositionEvent::Tp1Hit,
            FillReason::Tp2 => PositionEvent::Tp2Hit,
            FillReason::StopLoss => {
                // 트레일링 관리 중의 스톱 체결은 트레일 히트
                if record.state_ctx.state == PositionState::Trailing {
                    PositionEvent::TrailHit
                } else {
                    PositionEvent::StopHit
                }
            }
        };

        let result = process_transition(&record.state_ctx, &machine_event);
        if !result.transitioned {
            warn!(
                symbol = %event.symbol,
                state = %record.state_ctx.state,
                event = machine_event.name(),
                "현재 상태에서 처리되지 않는 체결 이벤트"
            );
            return;
        }
        record.state_ctx = result.context;

        // 체결은 이미 거래소에서 일어난 사실이므로 I/O 없이 장부만 반영
        match reason {
            FillReason::Entry => {
                exec.entry_price = fill_price;
                exec.entry_time = event.update_time;
                // 체결 직후 보호 주문(SL/TP1) 배치
                let placed = self.executor.place_protective_orders(&mut exec).await;
                if !placed.success {
                    error!(symbol = %event.symbol, error = ?placed.error, "보호 주문 배치 실패");
                }
            }
            FillReason::Tp1 => {
                let closed = exec.remaining_size_usd * record.state_ctx.tp1_qty_percent
                    / Decimal::from(100);
                let pnl = position_pnl(exec.direction, exec.entry_price, fill_price, closed);
                exec.remaining_size_usd -= closed;
                exec.realized_pnl += pnl;
                exec.tp1_hit = true;
                exec.tp1_order_id = None;
                // 거래소 SL을 본전으로 이동 (멱등)
                let moved = self.executor.move_sl_to_breakeven(&mut exec).await;
                if !moved.success {
                    warn!(symbol = %event.symbol, error = ?moved.error, "본전 이동 실패");
                }
            }
            FillReason::Tp2 | FillReason::StopLoss => {
                let pnl = position_pnl(
                    exec.direction,
                    exec.entry_price,
                    fill_price,
                    exec.remaining_size_usd,
                );
                exec.realized_pnl += pnl;
                exec.remaining_size_usd = Decimal::ZERO;

                let funding = self
                    .executor
                    .calculate_funding_cost(
                        &exec.symbol,
                        exec.initial_size_usd,
                        exec.entry_time,
                        event.update_time,
                        exec.direction,
                    )
                    .await;
                exec.funding_cost += funding.total_cost;

                let cancelled = self.executor.cancel_conditional_orders(&mut exec).await;
                if !cancelled.success {
                    warn!(symbol = %event.symbol, error = ?cancelled.error, "잔여 조건부 주문 취소 실패");
                }

                self.risk
                    .record_outcome(
                        &record.state_ctx.strategy_id,
                        exec.realized_pnl - exec.funding_cost,
                    )
                    .await;
            }
        }

        exec.touch(Utc::now());
        record.exec_ctx = Some(exec);
        if let Err(e) = self.store.save(&record).await {
            error!(symbol = %event.symbol, error = %e, "레코드 저장 실패");
        }
    }

    /// 부분 체결 타이머 예약.
    ///
    /// 같은 주문에 대한 후속 부분 체결 이벤트는 타이머를 추가로
    /// 만들지 않습니다 (주문당 타이머 1개).
    async fn schedule_partial_fill_check(&self, symbol: String, order_id: String) {
        {
            let mut pending = self.pending_partials.lock().await;
            if !pending.insert(order_id.clone()) {
                return;
            }
        }

        let handler = self.clone();
        let timeout = self.config.partial_fill_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handler.resolve_partial_fill(&symbol, &order_id).await;
        });
    }

    /// 부분 체결 주문 해소.
    ///
    /// 대기 후에도 완전 체결되지 않았으면 잔량을 취소하고,
    /// 체결 명목이 최소 기준 미만이면 즉시 청산, 이상이면
    /// 체결 수량 기준으로 보호 주문을 다시 겁니다.
    pub async fn resolve_partial_fill(&self, symbol: &str, order_id: &str) {
        self.pending_partials.lock().await.remove(order_id);

        // 이미 다른 경로가 확정 처리한 레코드는 건드리지 않음
        let mut record = match self.store.load(symbol).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        if record.state_ctx.state != PositionState::EntryPending {
            return;
        }
        let Some(mut exec) = record.exec_ctx.clone() else {
            return;
        };
        if exec.entry_order_id.as_deref() != Some(order_id) {
            return;
        }

        let order = match self.exchange.get_order(symbol, order_id).await {
            Ok(order) => order,
            Err(e) => {
                error!(symbol, order_id, error = %e, "부분 체결 상태 조회 실패");
                return;
            }
        };

        // 종결 상태는 해당 스트림 이벤트 경로가 처리
        if order.status.is_terminal() {
            return;
        }
        if !order.is_partially_filled() {
            return;
        }

        if let Err(e) = self.exchange.cancel_order(symbol, order_id).await {
            if !e.is_idempotent_conflict() {
                error!(symbol, order_id, error = %e, "부분 체결 잔량 취소 실패");
                return;
            }
        }

        let fill_price = order.avg_price.unwrap_or(exec.entry_price);
        let filled_notional = order.executed_qty * fill_price;

        if filled_notional < self.config.min_remainder_notional_usd {
            // 의미 없는 잔여 포지션은 즉시 정리
            warn!(
                symbol,
                filled_notional = %filled_notional,
                "부분 체결 명목이 최소 기준 미만, 즉시 청산"
            );
            exec.initial_size_usd = filled_notional;
            exec.remaining_size_usd = filled_notional;
            let closed = self
                .executor
                .close_all(&mut exec, fill_price, ExitReason::ForceSync)
                .await;
            if !closed.success {
                error!(symbol, error = ?closed.error, "부분 체결 즉시 청산 실패");
            }
            record.state_ctx.state = PositionState::Exited;
            record.state_ctx.exit_reason = Some(ExitReason::ForceSync);
        } else {
            // 체결된 만큼으로 포지션 축소 후 보호 주문 재배치
            info!(
                symbol,
                filled_notional = %filled_notional,
                "부분 체결 수량으로 포지션 축소"
            );
            exec.initial_size_usd = filled_notional;
            exec.remaining_size_usd = filled_notional;
            let placed = self.executor.place_protective_orders(&mut exec).await;
            if !placed.success {
                error!(symbol, error = ?placed.error, "축소 포지션 보호 주문 재배치 실패");
            }
            let result = process_transition(
                &record.state_ctx,
                &PositionEvent::OrderFilled {
                    fill_price,
                    size_usd: filled_notional,
                    time: Utc::now(),
                },
            );
            if result.transitioned {
                record.state_ctx = result.context;
            }
        }

        exec.touch(Utc::now());
        record.exec_ctx = Some(exec);
        if let Err(e) = self.store.save(&record).await {
            error!(symbol, error = %e, "레코드 저장 실패");
        }
    }

    /// 백스톱 스위프.
    ///
    /// 로컬이 활성이라고 믿는 포지션이 거래소에서 사라졌으면
    /// 유예 시간 이후 한 번만 강제 정리합니다. 유예 시간은 방금
    /// 제출된 주문의 반영 지연을 흡수합니다.
    pub async fn backstop_sweep(&self) {
        let records = match self.store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "백스톱 스위프 레코드 로드 실패");
                return;
            }
        };

        let now = Utc::now();
        let grace = ChronoDuration::seconds(self.config.backstop_grace_secs);

        for mut record in records {
            if !record.state_ctx.is_active() {
                continue;
            }
            let Some(mut exec) = record.exec_ctx.clone() else {
                continue;
            };

            // 최근에 갱신된 레코드는 아직 전파 중일 수 있음
            if now - exec.last_update_time < grace {
                continue;
            }

            let exchange_position = match self.exchange.get_position(&exec.symbol).await {
                Ok(position) => position,
                Err(e) => {
                    warn!(symbol = %exec.symbol, error = %e, "백스톱 포지션 조회 실패");
                    continue;
                }
            };
            if exchange_position.map(|p| p.is_open()).unwrap_or(false) {
                continue; // 동기화 상태 정상
            }

            // 거래소는 비었는데 로컬은 활성: 마크 가격으로 강제 정산
            let mark_price = self
                .executor
                .get_current_price(&exec.symbol)
                .await
                .unwrap_or(exec.entry_price);
            let pnl = position_pnl(
                exec.direction,
                exec.entry_price,
                mark_price,
                exec.remaining_size_usd,
            );
            warn!(
                symbol = %exec.symbol,
                mark_price = %mark_price,
                pnl = %pnl,
                "거래소에 없는 활성 포지션 강제 정리"
            );

            exec.realized_pnl += pnl;
            exec.remaining_size_usd = Decimal::ZERO;
            let cancelled = self.executor.cancel_conditional_orders(&mut exec).await;
            if !cancelled.success {
                warn!(symbol = %exec.symbol, error = ?cancelled.error, "강제 정리 중 조건부 주문 취소 실패");
            }

            self.risk
                .record_outcome(
                    &record.state_ctx.strategy_id,
                    exec.realized_pnl - exec.funding_cost,
                )
                .await;

            record.state_ctx.state = PositionState::Exited;
            record.state_ctx.exit_reason = Some(ExitReason::ForceSync);
            exec.touch(now);
            record.exec_ctx = Some(exec);
            if let Err(e) = self.store.save(&record).await {
                error!(error = %e, "강제 정리 레코드 저장 실패");
            }
        }
    }

    /// 사용자 데이터 스트림 소비 루프.
    ///
    /// 스트림이 끊기면 반환합니다. 재연결은 스트림 내부에서 처리되므로
    /// 반환은 복구 불가 종료를 의미합니다.
    pub async fn run_stream(&self, mut stream: UserDataStream) {
        loop {
            match stream.next_event().await {
                Some(UserStreamEvent::OrderUpdate(event)) => {
                    self.handle_order_update(&event).await;
                }
                Some(UserStreamEvent::Connected) => {
                    info!("사용자 데이터 스트림 연결됨");
                }
                Some(UserStreamEvent::Disconnected) => {
                    warn!("사용자 데이터 스트림 끊김, 재연결 대기");
                }
                Some(UserStreamEvent::ListenKeyExpired) => {
                    warn!("listen key 만료, 재발급 진행 중");
                }
                Some(UserStreamEvent::Error(message)) => {
                    error!(error = %message, "사용자 데이터 스트림 에러");
                }
                None => {
                    error!("사용자 데이터 스트림 종료");
                    return;
                }
            }
        }
    }

    /// 주기적 백스톱 스위프 루프.
    pub async fn run_backstop_loop(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.backstop_sweep().await;
        }
    }
}
