//! Binance USDT-margined perpetual connector.

pub mod constants;

mod auth;
mod messages;
mod order_book_ds;
mod user_stream_ds;

pub use auth::BinancePerpetualAuth;
pub use order_book_ds::BinancePerpetualOrderBookDataSource;
pub use user_stream_ds::BinancePerpetualUserStreamDataSource;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ApiCredentials, ConnectorSettings, OverrideMap};
use crate::connector::fees::{
    build_trade_fee, FixedFee, TradeFee, TradeFeePercentageApplication,
};
use crate::connector::in_flight::{InFlightOrder, OrderState, OrderUpdate, TradeUpdate};
use crate::connector::pairs::{TradingPair, TradingPairRegistry};
use crate::connector::tracker::OrderTracker;
use crate::connector::trading_rule::TradingRule;
use crate::connector::{
    utils, Balance, CancellationResult, Connector, NetworkStatus, OrderOptions, OrderType,
    PollNotifier, TradeType,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, FundingPaymentCompletedEvent, MarketEvent, PositionModeChangeEvent};
use crate::order_book::{OrderBook, OrderBookDataSource, OrderBookTracker};
use crate::perpetual::{
    FundingInfo, PerpetualConnector, PerpetualTrading, Position, PositionAction, PositionMode,
    PositionSide,
};
use crate::throttler::AsyncThrottler;
use crate::user_stream::UserStreamTracker;
use crate::web::{RestClient, RestMethod, RestRequest, TimeSynchronizer};
use messages::{
    AccountInfoResponse, AccountUpdateEvent, IncomeRecord, OrderResponse, OrderTradeUpdateEvent,
    PositionRisk, ServerTimeResponse, SymbolFilter, SymbolInfo, UserTrade,
};

pub struct BinancePerpetual {
    weak_self: Weak<BinancePerpetual>,
    settings: ConnectorSettings,
    overrides: OverrideMap,
    trading_pairs: Vec<TradingPair>,
    trading_required: bool,
    rest_base: String,
    time_sync: Arc<TimeSynchronizer>,
    rest: Arc<RestClient>,
    registry: Arc<RwLock<TradingPairRegistry>>,
    /// Serializes the first exchange-info fetch so concurrent callers share
    /// one REST call.
    symbols_init: tokio::sync::Mutex<()>,
    order_book_ds: Arc<BinancePerpetualOrderBookDataSource>,
    order_book_tracker: OrderBookTracker,
    user_stream: UserStreamTracker,
    order_tracker: OrderTracker,
    bus: Arc<EventBus>,
    perpetual: PerpetualTrading,
    trading_rules: RwLock<HashMap<TradingPair, TradingRule>>,
    balances: RwLock<HashMap<String, Balance>>,
    poll_notifier: PollNotifier,
    funding_fee_notifier: PollNotifier,
    last_timestamp: Mutex<f64>,
    last_trade_poll_ms: Mutex<i64>,
    order_not_found: Mutex<HashMap<String, u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BinancePerpetual {
    pub fn new(
        credentials: ApiCredentials,
        trading_pairs: Vec<TradingPair>,
        trading_required: bool,
        overrides: OverrideMap,
    ) -> Arc<Self> {
        Self::with_urls(
            credentials,
            trading_pairs,
            trading_required,
            overrides,
            constants::REST_BASE_URL,
            constants::WS_BASE_URL,
        )
    }

    /// Construct against explicit endpoints (testnet, local fixtures).
    pub fn with_urls(
        credentials: ApiCredentials,
        trading_pairs: Vec<TradingPair>,
        trading_required: bool,
        overrides: OverrideMap,
        rest_base: &str,
        ws_base: &str,
    ) -> Arc<Self> {
        let settings = constants::connector_settings().with_overrides(&overrides);
        let time_sync = Arc::new(TimeSynchronizer::new());
        let throttler = Arc::new(
            AsyncThrottler::new(constants::rate_limits())
                .with_limits_share_pct(settings.rate_limits_share_pct),
        );
        let auth = Arc::new(BinancePerpetualAuth::new(credentials, time_sync.clone()));
        let rest = Arc::new(
            RestClient::new(throttler)
                .with_auth(auth.clone())
                .with_body_error_check(body_error),
        );
        let registry = Arc::new(RwLock::new(TradingPairRegistry::new()));
        let order_book_ds = Arc::new(BinancePerpetualOrderBookDataSource::new(
            rest.clone(),
            registry.clone(),
            trading_pairs.clone(),
            rest_base,
            ws_base,
        ));
        let user_stream_ds = Arc::new(BinancePerpetualUserStreamDataSource::new(
            rest.clone(),
            auth,
            rest_base,
            ws_base,
        ));
        let bus = Arc::new(EventBus::new());

        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            settings,
            overrides,
            trading_pairs: trading_pairs.clone(),
            trading_required,
            rest_base: rest_base.to_string(),
            time_sync,
            rest,
            registry,
            symbols_init: tokio::sync::Mutex::new(()),
            order_book_ds: order_book_ds.clone(),
            order_book_tracker: OrderBookTracker::new(order_book_ds, trading_pairs),
            user_stream: UserStreamTracker::new(user_stream_ds),
            order_tracker: OrderTracker::new(bus.clone()),
            bus,
            perpetual: PerpetualTrading::new(),
            trading_rules: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            poll_notifier: PollNotifier::new(),
            funding_fee_notifier: PollNotifier::new(),
            last_timestamp: Mutex::new(0.0),
            last_trade_poll_ms: Mutex::new(0),
            order_not_found: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn order_book_tracker(&self) -> &OrderBookTracker {
        &self.order_book_tracker
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.rest_base, path)
    }

    fn symbol_for(&self, trading_pair: &TradingPair) -> Result<String> {
        self.registry.read().symbol_for_pair(trading_pair)
    }

    fn pair_for(&self, symbol: &str) -> Option<TradingPair> {
        self.registry.read().pair_for_symbol(symbol).ok()
    }

    async fn fetch_server_time(&self) -> Result<f64> {
        let body = self
            .rest
            .call(RestRequest::new(
                RestMethod::Get,
                self.url(constants::SERVER_TIME_PATH),
            ))
            .await?;
        let response: ServerTimeResponse = serde_json::from_value(body)?;
        Ok(response.server_time as f64 / 1_000.0)
    }

    /// Populate the symbol map on first use; concurrent callers share one
    /// exchange-info request.
    async fn ensure_symbols_initialized(&self) -> Result<()> {
        let _guard = self.symbols_init.lock().await;
        if self.registry.read().is_empty() {
            self.update_trading_rules().await?;
        }
        Ok(())
    }

    async fn update_trading_rules(&self) -> Result<()> {
        let body = self
            .rest
            .call(RestRequest::new(
                RestMethod::Get,
                self.url(constants::EXCHANGE_INFO_PATH),
            ))
            .await?;
        let raw_symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut rules = HashMap::new();
        {
            let mut registry = self.registry.write();
            for raw in raw_symbols {
                // One malformed instrument must not abort the whole refresh.
                let symbol: SymbolInfo = match serde_json::from_value(raw) {
                    Ok(symbol) => symbol,
                    Err(e) => {
                        warn!(error = %e, "Skipping unparseable instrument entry");
                        continue;
                    }
                };
                if symbol.status != "TRADING" {
                    continue;
                }
                let pair = TradingPair::new(&symbol.base_asset, &symbol.quote_asset);
                registry.insert(&symbol.symbol, pair.clone());

                let mut rule = TradingRule::new(pair.clone());
                for filter in &symbol.filters {
                    match filter {
                        SymbolFilter::Price { tick_size } => {
                            rule.min_price_increment = *tick_size;
                        }
                        SymbolFilter::LotSize {
                            min_qty,
                            max_qty,
                            step_size,
                        } => {
                            rule.min_order_size = *min_qty;
                            rule.max_order_size = *max_qty;
                            rule.min_base_amount_increment = *step_size;
                        }
                        SymbolFilter::MinNotional { notional } => {
                            rule.min_notional_size = *notional;
                        }
                        SymbolFilter::Other => {}
                    }
                }
                rule.supports_market_orders =
                    symbol.order_types.iter().any(|order_type| order_type == "MARKET");
                rules.insert(pair, rule);
            }
        }
        *self.trading_rules.write() = rules;
        Ok(())
    }

    async fn trading_rules_loop(self: Arc<Self>) {
        loop {
            match self.update_trading_rules().await {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_secs_f64(
                        constants::TRADING_RULES_POLL_INTERVAL,
                    ))
                    .await;
                }
                Err(e) => {
                    warn!(error = %e, "Trading rules refresh failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn status_polling_loop(self: Arc<Self>) {
        loop {
            self.poll_notifier.wait().await;
            self.poll_notifier.reset();

            if let Err(e) = self
                .time_sync
                .update_server_time_offset(|| self.fetch_server_time())
                .await
            {
                warn!(error = %e, "Server time sync failed");
            }

            let (balances, orders, positions, trades) = tokio::join!(
                self.update_balances(),
                self.update_order_status(),
                self.update_positions(),
                self.update_trade_history(),
            );

            let mut failed = false;
            for (task, result) in [
                ("balances", balances),
                ("order_status", orders),
                ("positions", positions),
                ("trade_history", trades),
            ] {
                if let Err(e) = result {
                    warn!(task, error = %e, "Status poll task failed");
                    failed = true;
                }
            }
            if failed {
                // Re-arm and retry shortly instead of waiting for the next
                // tick.
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.poll_notifier.set();
            }
        }
    }

    async fn update_balances(&self) -> Result<()> {
        let body = self
            .rest
            .call(
                RestRequest::new(RestMethod::Get, self.url(constants::ACCOUNT_INFO_PATH))
                    .authenticated(),
            )
            .await?;
        let info: AccountInfoResponse = serde_json::from_value(body)?;
        let fresh: HashMap<String, Balance> = info
            .assets
            .into_iter()
            .map(|asset| {
                (
                    asset.asset,
                    Balance {
                        total: asset.wallet_balance,
                        available: asset.available_balance,
                    },
                )
            })
            .collect();
        // Wholesale replacement drops assets no longer reported.
        *self.balances.write() = fresh;
        Ok(())
    }

    async fn update_order_status(&self) -> Result<()> {
        let now = unix_time_now();
        self.order_tracker
            .fail_stale_pending(now, constants::PENDING_CREATE_TIMEOUT);

        let active = self.order_tracker.active();
        if active.is_empty() {
            return Ok(());
        }
        debug!(count = active.len(), "Polling order status");

        let queries = active.iter().map(|order| async move {
            let symbol = self.symbol_for(&order.trading_pair)?;
            let body = self
                .rest
                .call(
                    RestRequest::new(RestMethod::Get, self.url(constants::ORDER_PATH))
                        .param("symbol", symbol)
                        .param("origClientOrderId", &order.client_order_id)
                        .authenticated(),
                )
                .await?;
            Ok::<OrderResponse, Error>(serde_json::from_value(body)?)
        });
        let results = join_all(queries).await;

        for (order, result) in active.iter().zip(results) {
            match result {
                Ok(response) => {
                    self.order_not_found.lock().remove(&order.client_order_id);
                    if let Some(state) = map_order_status(&response.status) {
                        self.order_tracker.process_order_update(OrderUpdate {
                            client_order_id: response.client_order_id,
                            exchange_order_id: Some(response.order_id.to_string()),
                            new_state: state,
                            update_timestamp: response
                                .update_time
                                .map(|t| t as f64 / 1_000.0)
                                .unwrap_or(now),
                        });
                    } else {
                        debug!(status = %response.status, "Unmapped order status");
                    }
                }
                Err(e) if is_unknown_order_error(&e) => {
                    let failures = {
                        let mut not_found = self.order_not_found.lock();
                        let count = not_found.entry(order.client_order_id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if failures >= constants::ORDER_NOT_FOUND_LIMIT {
                        warn!(
                            client_order_id = %order.client_order_id,
                            "Order repeatedly not found on venue, failing it"
                        );
                        self.order_not_found.lock().remove(&order.client_order_id);
                        self.order_tracker.process_order_update(OrderUpdate {
                            client_order_id: order.client_order_id.clone(),
                            exchange_order_id: None,
                            new_state: OrderState::Failed,
                            update_timestamp: now,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        client_order_id = %order.client_order_id,
                        error = %e,
                        "Order status query failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn update_positions(&self) -> Result<()> {
        let body = self
            .rest
            .call(
                RestRequest::new(
                    RestMethod::Get,
                    self.url(constants::POSITION_INFORMATION_PATH),
                )
                .authenticated(),
            )
            .await?;
        let positions: Vec<PositionRisk> = serde_json::from_value(body)?;
        for risk in positions {
            let Some(trading_pair) = self.pair_for(&risk.symbol) else {
                continue;
            };
            let Some(side) = map_position_side(&risk.position_side) else {
                debug!(side = %risk.position_side, "Unmapped position side");
                continue;
            };
            self.perpetual.update_position(Position {
                trading_pair,
                position_side: side,
                unrealized_pnl: risk.un_realized_profit,
                entry_price: risk.entry_price,
                amount: risk.position_amt,
                leverage: risk.leverage,
            });
        }
        Ok(())
    }

    async fn update_trade_history(&self) -> Result<()> {
        let now_ms = (unix_time_now() * 1_000.0) as i64;
        let since_ms = {
            let mut last = self.last_trade_poll_ms.lock();
            let since = *last;
            *last = now_ms;
            since
        };

        let by_exchange_id: HashMap<String, String> = self
            .order_tracker
            .all()
            .into_iter()
            .filter_map(|order| {
                order
                    .exchange_order_id
                    .clone()
                    .map(|exchange_id| (exchange_id, order.client_order_id))
            })
            .collect();
        if by_exchange_id.is_empty() {
            return Ok(());
        }

        for trading_pair in &self.trading_pairs {
            let symbol = self.symbol_for(trading_pair)?;
            let mut request =
                RestRequest::new(RestMethod::Get, self.url(constants::ACCOUNT_TRADE_LIST_PATH))
                    .param("symbol", symbol)
                    .authenticated();
            if since_ms > 0 {
                request = request.param("startTime", since_ms.to_string());
            }
            let body = self.rest.call(request).await?;
            let trades: Vec<UserTrade> = serde_json::from_value(body)?;

            for trade in trades {
                let Some(client_order_id) = by_exchange_id.get(&trade.order_id.to_string()) else {
                    continue;
                };
                self.order_tracker.process_trade_update(TradeUpdate {
                    trade_id: trade.id.to_string(),
                    client_order_id: client_order_id.clone(),
                    exchange_order_id: Some(trade.order_id.to_string()),
                    trading_pair: trading_pair.clone(),
                    fill_price: trade.price,
                    fill_base_amount: trade.qty,
                    fill_quote_amount: trade.quote_qty,
                    fee: commission_fee(trade.commission, trade.commission_asset),
                    fill_timestamp: trade.time as f64 / 1_000.0,
                });
            }
        }
        Ok(())
    }

    async fn user_stream_listener(self: Arc<Self>) {
        while let Some(event) = self.user_stream.next().await {
            self.process_user_event(event);
        }
    }

    fn process_user_event(&self, event: Value) {
        match event.get("e").and_then(Value::as_str) {
            Some(messages::ORDER_TRADE_UPDATE_EVENT) => {
                match serde_json::from_value::<OrderTradeUpdateEvent>(event.clone()) {
                    Ok(update) => self.process_order_trade_update(update),
                    Err(e) => {
                        warn!(error = %e, body = %event, "Schema deviation in order update, skipping");
                    }
                }
            }
            Some(messages::ACCOUNT_UPDATE_EVENT) => {
                match serde_json::from_value::<AccountUpdateEvent>(event.clone()) {
                    Ok(update) => self.process_account_update(update),
                    Err(e) => {
                        warn!(error = %e, body = %event, "Schema deviation in account update, skipping");
                    }
                }
            }
            Some(messages::MARGIN_CALL_EVENT) => {
                warn!("Margin call received from venue");
            }
            Some(other) => {
                debug!(event = other, "Ignoring unhandled user stream event");
            }
            None => {
                debug!(body = %event, "User stream payload without event type");
            }
        }
    }

    fn process_order_trade_update(&self, event: OrderTradeUpdateEvent) {
        let data = event.order;
        let timestamp = data.transaction_time as f64 / 1_000.0;
        let Some(trading_pair) = self.pair_for(&data.symbol) else {
            debug!(symbol = %data.symbol, "Order update for unmapped symbol");
            return;
        };

        if data.last_filled_qty > Decimal::ZERO && data.trade_id > 0 {
            let fee = match (data.commission, data.commission_asset.clone()) {
                (Some(amount), Some(asset)) => commission_fee(amount, asset),
                _ => commission_fee(Decimal::ZERO, trading_pair.quote().to_string()),
            };
            self.order_tracker.process_trade_update(TradeUpdate {
                trade_id: data.trade_id.to_string(),
                client_order_id: data.client_order_id.clone(),
                exchange_order_id: Some(data.order_id.to_string()),
                trading_pair,
                fill_price: data.last_filled_price,
                fill_base_amount: data.last_filled_qty,
                fill_quote_amount: data.last_filled_qty * data.last_filled_price,
                fee,
                fill_timestamp: timestamp,
            });
        }

        let state = match data.order_status.as_str() {
            "NEW" => Some(OrderState::Open),
            "CANCELED" | "EXPIRED" => Some(OrderState::Cancelled),
            "REJECTED" => Some(OrderState::Failed),
            // Fill-driven states were handled by the trade update above.
            "PARTIALLY_FILLED" | "FILLED" => None,
            other => {
                debug!(status = other, "Unmapped user stream order status");
                None
            }
        };
        if let Some(new_state) = state {
            self.order_tracker.process_order_update(OrderUpdate {
                client_order_id: data.client_order_id,
                exchange_order_id: Some(data.order_id.to_string()),
                new_state,
                update_timestamp: timestamp,
            });
        }
    }

    fn process_account_update(&self, event: AccountUpdateEvent) {
        {
            let mut balances = self.balances.write();
            for balance in event.data.balances {
                balances.insert(
                    balance.asset,
                    Balance {
                        total: balance.wallet_balance,
                        available: balance.cross_wallet_balance.min(balance.wallet_balance),
                    },
                );
            }
        }
        for position in event.data.positions {
            let Some(trading_pair) = self.pair_for(&position.symbol) else {
                continue;
            };
            let Some(side) = map_position_side(&position.position_side) else {
                continue;
            };
            let leverage =
                Decimal::from(self.perpetual.leverage(&trading_pair));
            self.perpetual.update_position(Position {
                trading_pair,
                position_side: side,
                unrealized_pnl: position.unrealized_pnl,
                entry_price: position.entry_price,
                amount: position.position_amount,
                leverage,
            });
        }
    }

    async fn funding_info_loop(self: Arc<Self>) {
        loop {
            for trading_pair in &self.trading_pairs {
                match self.order_book_ds.get_funding_info(trading_pair).await {
                    Ok(info) => self.perpetual.update_funding_info(info),
                    Err(e) => {
                        warn!(pair = %trading_pair, error = %e, "Funding info refresh failed");
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(constants::FUNDING_INFO_POLL_INTERVAL))
                .await;
        }
    }

    async fn funding_stream_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FundingInfo>) {
        while let Some(info) = rx.recv().await {
            self.perpetual.update_funding_info(info);
        }
    }

    async fn funding_fee_loop(self: Arc<Self>) {
        // First sweep initializes the per-pair timestamps without events.
        let _ = self.update_all_funding_payments(false).await;
        loop {
            self.funding_fee_notifier.wait().await;
            if self.update_all_funding_payments(true).await {
                self.funding_fee_notifier.reset();
            } else {
                // Leave the notifier armed so the sweep repeats until every
                // pair succeeds.
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    }

    async fn update_all_funding_payments(&self, fire_event_on_new: bool) -> bool {
        let sweeps = self
            .trading_pairs
            .iter()
            .map(|pair| self.update_funding_payment(pair, fire_event_on_new));
        join_all(sweeps).await.into_iter().all(|success| success)
    }

    async fn update_funding_payment(
        &self,
        trading_pair: &TradingPair,
        fire_event_on_new: bool,
    ) -> bool {
        match self.fetch_last_fee_payment(trading_pair).await {
            Ok(Some((timestamp, funding_rate, amount))) => {
                if self.perpetual.funding_payments().register(
                    trading_pair,
                    timestamp,
                    amount,
                    fire_event_on_new,
                ) {
                    let action = if amount < Decimal::ZERO { "paid" } else { "received" };
                    info!(pair = %trading_pair, %amount, action, "Funding payment");
                    self.bus.trigger_event(MarketEvent::FundingPaymentCompleted(
                        FundingPaymentCompletedEvent {
                            timestamp_ms: (timestamp * 1_000.0) as i64,
                            market: constants::EXCHANGE_NAME.to_string(),
                            trading_pair: trading_pair.clone(),
                            funding_rate,
                            amount,
                        },
                    ));
                }
                true
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pair = %trading_pair, error = %e, "Funding payment fetch failed");
                false
            }
        }
    }

    /// Latest funding payment as (timestamp, rate, amount), or `None` when
    /// the venue has no payment on record yet.
    async fn fetch_last_fee_payment(
        &self,
        trading_pair: &TradingPair,
    ) -> Result<Option<(f64, Decimal, Decimal)>> {
        let symbol = self.symbol_for(trading_pair)?;
        let body = self
            .rest
            .call(
                RestRequest::new(RestMethod::Get, self.url(constants::INCOME_HISTORY_PATH))
                    .param("symbol", symbol)
                    .param("incomeType", "FUNDING_FEE")
                    .param("limit", "1")
                    .authenticated(),
            )
            .await?;
        let records: Vec<IncomeRecord> = serde_json::from_value(body)?;
        let Some(record) = records.into_iter().last() else {
            return Ok(None);
        };
        let rate = self
            .perpetual
            .funding_info(trading_pair)
            .map(|info| info.rate)
            .unwrap_or(Decimal::ZERO);
        Ok(Some((record.time as f64 / 1_000.0, rate, record.income)))
    }

    fn place_order(
        &self,
        trade_type: TradeType,
        trading_pair: &TradingPair,
        amount: Decimal,
        order_type: OrderType,
        price: Decimal,
        options: OrderOptions,
    ) -> String {
        let client_order_id = utils::new_client_order_id(
            trade_type.is_buy(),
            trading_pair,
            self.settings.order_id_prefix,
            self.settings.max_order_id_len,
        );
        let quantized_price = if order_type.is_limit() {
            self.quantize_order_price(trading_pair, price)
        } else {
            Decimal::ZERO
        };
        let quantized_amount = self.quantize_order_amount(
            trading_pair,
            amount,
            order_type.is_limit().then_some(quantized_price),
        );

        // Enter the in-flight book before any network traffic so a fast ack
        // can never observe an untracked order.
        let order = InFlightOrder::new(
            &client_order_id,
            trading_pair.clone(),
            order_type,
            trade_type,
            quantized_price,
            quantized_amount,
            unix_time_now(),
        )
        .with_leverage(self.perpetual.leverage(trading_pair))
        .with_position_action(options.position_action);
        self.order_tracker.start_tracking(order);

        if let Some(this) = self.weak_self.upgrade() {
            let trading_pair = trading_pair.clone();
            let client_order_id = client_order_id.clone();
            tokio::spawn(async move {
                this.execute_place_order(
                    client_order_id,
                    trading_pair,
                    trade_type,
                    order_type,
                    quantized_amount,
                    quantized_price,
                    options.position_action,
                )
                .await;
            });
        }
        client_order_id
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_place_order(
        &self,
        client_order_id: String,
        trading_pair: TradingPair,
        trade_type: TradeType,
        order_type: OrderType,
        amount: Decimal,
        price: Decimal,
        position_action: PositionAction,
    ) {
        let refusal = self.preflight_refusal(&trading_pair, order_type, amount, price);
        if let Some(reason) = refusal {
            warn!(
                %client_order_id,
                pair = %trading_pair,
                reason,
                "Refusing order pre-flight"
            );
            self.order_tracker.process_order_update(OrderUpdate {
                client_order_id,
                exchange_order_id: None,
                new_state: OrderState::Failed,
                update_timestamp: unix_time_now(),
            });
            return;
        }

        match self
            .submit_order(
                &client_order_id,
                &trading_pair,
                trade_type,
                order_type,
                amount,
                price,
                position_action,
            )
            .await
        {
            Ok(response) => {
                info!(
                    %client_order_id,
                    exchange_order_id = response.order_id,
                    pair = %trading_pair,
                    %amount,
                    "Order placed"
                );
                let state = map_order_status(&response.status).unwrap_or(OrderState::Open);
                self.order_tracker.process_order_update(OrderUpdate {
                    client_order_id,
                    exchange_order_id: Some(response.order_id.to_string()),
                    new_state: state,
                    update_timestamp: unix_time_now(),
                });
            }
            Err(e) => {
                warn!(%client_order_id, pair = %trading_pair, error = %e, "Order placement failed");
                self.order_tracker.process_order_update(OrderUpdate {
                    client_order_id,
                    exchange_order_id: None,
                    new_state: OrderState::Failed,
                    update_timestamp: unix_time_now(),
                });
            }
        }
    }

    fn preflight_refusal(
        &self,
        trading_pair: &TradingPair,
        order_type: OrderType,
        amount: Decimal,
        price: Decimal,
    ) -> Option<&'static str> {
        let Some(rule) = self.trading_rule(trading_pair) else {
            return Some("no trading rule for pair");
        };
        if amount.is_zero() || amount < rule.min_order_size {
            return Some("amount below the minimum order size");
        }
        if order_type.is_limit() && price.is_zero() {
            return Some("price quantized to zero");
        }
        if order_type == OrderType::Market && !rule.supports_market_orders {
            return Some("market orders not supported for pair");
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_order(
        &self,
        client_order_id: &str,
        trading_pair: &TradingPair,
        trade_type: TradeType,
        order_type: OrderType,
        amount: Decimal,
        price: Decimal,
        position_action: PositionAction,
    ) -> Result<OrderResponse> {
        let symbol = self.symbol_for(trading_pair)?;
        let mut request = RestRequest::new(RestMethod::Post, self.url(constants::ORDER_PATH))
            .param("symbol", symbol)
            .param("side", if trade_type.is_buy() { "BUY" } else { "SELL" })
            .param("quantity", amount.to_string())
            .param("newClientOrderId", client_order_id)
            .authenticated();

        request = match order_type {
            OrderType::Limit => request
                .param("type", "LIMIT")
                .param("timeInForce", "GTC")
                .param("price", price.to_string()),
            OrderType::LimitMaker => request
                .param("type", "LIMIT")
                .param("timeInForce", "GTX")
                .param("price", price.to_string()),
            OrderType::Market => request.param("type", "MARKET"),
        };

        if self.perpetual.position_mode() == PositionMode::Hedge {
            let position_side = match (trade_type, position_action) {
                (TradeType::Buy, PositionAction::Open)
                | (TradeType::Sell, PositionAction::Close) => "LONG",
                _ => "SHORT",
            };
            request = request.param("positionSide", position_side);
        }

        let body = self.rest.call(request).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn execute_cancel(
        &self,
        trading_pair: &TradingPair,
        client_order_id: &str,
    ) -> Result<String> {
        let Some(order) = self.order_tracker.get(client_order_id) else {
            debug!(%client_order_id, "Cancel requested for untracked order, ignoring");
            return Err(Error::Execution(format!(
                "order {client_order_id} is not being tracked"
            )));
        };
        if order.is_done() {
            return Ok(client_order_id.to_string());
        }

        let symbol = self.symbol_for(trading_pair)?;
        let result = self
            .rest
            .call(
                RestRequest::new(RestMethod::Delete, self.url(constants::ORDER_PATH))
                    .param("symbol", symbol)
                    .param("origClientOrderId", client_order_id)
                    .authenticated(),
            )
            .await;

        match result {
            Ok(body) => {
                let response: OrderResponse = serde_json::from_value(body)?;
                if let Some(state) = map_order_status(&response.status) {
                    self.order_tracker.process_order_update(OrderUpdate {
                        client_order_id: client_order_id.to_string(),
                        exchange_order_id: Some(response.order_id.to_string()),
                        new_state: state,
                        update_timestamp: unix_time_now(),
                    });
                }
                Ok(client_order_id.to_string())
            }
            Err(e) if is_unknown_order_error(&e) => {
                // The order may already be terminal on the venue; the status
                // poll settles it.
                info!(%client_order_id, "Cancel target unknown to venue");
                Err(e)
            }
            Err(e) => {
                warn!(%client_order_id, error = %e, "Cancel request failed");
                Err(e)
            }
        }
    }

    async fn execute_set_leverage(&self, trading_pair: TradingPair, leverage: u32) {
        let symbol = match self.symbol_for(&trading_pair) {
            Ok(symbol) => symbol,
            Err(e) => {
                warn!(pair = %trading_pair, error = %e, "Cannot set leverage for unmapped pair");
                return;
            }
        };
        let result = self
            .rest
            .call(
                RestRequest::new(RestMethod::Post, self.url(constants::SET_LEVERAGE_PATH))
                    .param("symbol", symbol)
                    .param("leverage", leverage.to_string())
                    .authenticated(),
            )
            .await;
        match result {
            Ok(_) => {
                self.perpetual.set_leverage(&trading_pair, leverage);
                info!(pair = %trading_pair, leverage, "Leverage set");
            }
            Err(e) => {
                warn!(pair = %trading_pair, leverage, error = %e, "Failed to set leverage");
            }
        }
    }

    async fn execute_set_position_mode(&self, mode: PositionMode) {
        let dual = mode == PositionMode::Hedge;
        let result = self
            .rest
            .call(
                RestRequest::new(
                    RestMethod::Post,
                    self.url(constants::CHANGE_POSITION_MODE_PATH),
                )
                .param("dualSidePosition", dual.to_string())
                .authenticated(),
            )
            .await;

        let timestamp_ms = (unix_time_now() * 1_000.0) as i64;
        // "No need to change position side" means the venue is already in
        // the requested mode.
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(Error::RestResponse { ref body, .. }) if body.contains("-4059") => Ok(()),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.perpetual.set_position_mode(mode);
                for trading_pair in &self.trading_pairs {
                    self.bus.trigger_event(MarketEvent::PositionModeChangeSucceeded(
                        PositionModeChangeEvent {
                            timestamp_ms,
                            trading_pair: trading_pair.clone(),
                            position_mode: mode,
                            message: None,
                        },
                    ));
                }
                info!(?mode, "Position mode switched");
            }
            Err(e) => {
                let message = e.to_string();
                for trading_pair in &self.trading_pairs {
                    self.bus.trigger_event(MarketEvent::PositionModeChangeFailed(
                        PositionModeChangeEvent {
                            timestamp_ms,
                            trading_pair: trading_pair.clone(),
                            position_mode: mode,
                            message: Some(message.clone()),
                        },
                    ));
                }
                warn!(?mode, error = %message, "Position mode change failed");
            }
        }
    }
}

#[async_trait]
impl Connector for BinancePerpetual {
    fn name(&self) -> &'static str {
        constants::EXCHANGE_NAME
    }

    fn trading_pairs(&self) -> Vec<TradingPair> {
        self.trading_pairs.clone()
    }

    async fn start_network(&self) -> Result<()> {
        self.stop_network().await;
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::Execution("connector dropped".into()))?;

        if let Err(e) = self.ensure_symbols_initialized().await {
            // The trading-rules loop keeps retrying; streams come up once
            // the symbol map exists.
            warn!(error = %e, "Initial symbol map fetch failed");
        }

        let (funding_tx, funding_rx) = mpsc::unbounded_channel();
        self.order_book_ds.set_funding_sender(funding_tx);
        self.order_book_tracker.start();

        let mut handles = Vec::new();
        handles.push(tokio::spawn(this.clone().trading_rules_loop()));
        handles.push(tokio::spawn(this.clone().funding_info_loop()));
        handles.push(tokio::spawn(this.clone().funding_stream_loop(funding_rx)));

        if self.trading_required {
            self.user_stream.start().await;
            handles.push(tokio::spawn(this.clone().user_stream_listener()));
            handles.push(tokio::spawn(this.clone().status_polling_loop()));
            handles.push(tokio::spawn(this.clone().funding_fee_loop()));
        }

        *self.tasks.lock() = handles;
        Ok(())
    }

    async fn stop_network(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.order_book_tracker.stop();
        self.user_stream.stop().await;
        self.order_tracker.clear();
        self.perpetual.clear();
        self.balances.write().clear();
        self.poll_notifier.reset();
        self.funding_fee_notifier.reset();
        self.order_not_found.lock().clear();
        *self.last_trade_poll_ms.lock() = 0;
    }

    async fn check_network(&self) -> NetworkStatus {
        match self
            .rest
            .call(RestRequest::new(
                RestMethod::Get,
                self.url(constants::PING_PATH),
            ))
            .await
        {
            Ok(_) => NetworkStatus::Connected,
            Err(_) => NetworkStatus::NotConnected,
        }
    }

    fn status_snapshot(&self) -> HashMap<&'static str, bool> {
        HashMap::from([
            ("symbols_mapping_initialized", !self.registry.read().is_empty()),
            ("order_books_initialized", self.order_book_tracker.ready()),
            (
                "trading_rules_initialized",
                !self.trading_rules.read().is_empty(),
            ),
            (
                "account_balance",
                !self.trading_required || !self.balances.read().is_empty(),
            ),
            (
                "user_stream_initialized",
                !self.trading_required || self.user_stream.last_recv_time() > 0.0,
            ),
            (
                "funding_info",
                self.perpetual
                    .is_funding_info_initialized(&self.trading_pairs),
            ),
        ])
    }

    fn tick(&self, timestamp: f64) {
        let now = unix_time_now();
        let poll_interval = if now - self.user_stream.last_recv_time()
            > constants::USER_STREAM_STALENESS_THRESHOLD
        {
            constants::SHORT_POLL_INTERVAL
        } else {
            constants::LONG_POLL_INTERVAL
        };

        let last_timestamp = {
            let mut last = self.last_timestamp.lock();
            let previous = *last;
            *last = timestamp;
            previous
        };

        if (timestamp / poll_interval).floor() > (last_timestamp / poll_interval).floor() {
            self.poll_notifier.set();
        }
        if self.trading_required
            && (timestamp / self.funding_fee_poll_interval()).floor()
                > (last_timestamp / self.funding_fee_poll_interval()).floor()
        {
            self.funding_fee_notifier.set();
        }
    }

    fn supported_order_types(&self) -> Vec<OrderType> {
        vec![OrderType::Limit, OrderType::LimitMaker, OrderType::Market]
    }

    fn buy(
        &self,
        trading_pair: &TradingPair,
        amount: Decimal,
        order_type: OrderType,
        price: Decimal,
        options: OrderOptions,
    ) -> String {
        self.place_order(TradeType::Buy, trading_pair, amount, order_type, price, options)
    }

    fn sell(
        &self,
        trading_pair: &TradingPair,
        amount: Decimal,
        order_type: OrderType,
        price: Decimal,
        options: OrderOptions,
    ) -> String {
        self.place_order(TradeType::Sell, trading_pair, amount, order_type, price, options)
    }

    fn cancel(&self, trading_pair: &TradingPair, client_order_id: &str) -> String {
        if let Some(this) = self.weak_self.upgrade() {
            let trading_pair = trading_pair.clone();
            let client_order_id = client_order_id.to_string();
            tokio::spawn(async move {
                let _ = this.execute_cancel(&trading_pair, &client_order_id).await;
            });
        }
        client_order_id.to_string()
    }

    async fn cancel_all(&self, timeout: Duration) -> Vec<CancellationResult> {
        let orders = self.order_tracker.active();
        let order_ids: Vec<String> = orders
            .iter()
            .map(|order| order.client_order_id.clone())
            .collect();
        let Some(this) = self.weak_self.upgrade() else {
            return order_ids
                .into_iter()
                .map(|order_id| CancellationResult {
                    order_id,
                    success: false,
                })
                .collect();
        };

        let successes: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let batch = {
            let successes = successes.clone();
            tokio::spawn(async move {
                let cancels = orders.into_iter().map(|order| {
                    let this = this.clone();
                    let successes = successes.clone();
                    async move {
                        if this
                            .execute_cancel(&order.trading_pair, &order.client_order_id)
                            .await
                            .is_ok()
                        {
                            successes.lock().insert(order.client_order_id);
                        }
                    }
                });
                join_all(cancels).await;
            })
        };

        // Dropping the handle on timeout leaves the batch running: the
        // cancels themselves are shielded from the caller's deadline.
        if tokio::time::timeout(timeout, batch).await.is_err() {
            warn!("cancel_all stopped waiting after its timeout");
        }

        let successes = successes.lock();
        order_ids
            .into_iter()
            .map(|order_id| CancellationResult {
                success: successes.contains(&order_id),
                order_id,
            })
            .collect()
    }

    fn get_fee(
        &self,
        _trading_pair: &TradingPair,
        trade_type: TradeType,
        order_type: OrderType,
        _amount: Decimal,
        _price: Decimal,
        is_maker: Option<bool>,
    ) -> TradeFee {
        let is_maker = is_maker.unwrap_or(order_type == OrderType::LimitMaker);
        build_trade_fee(
            self.settings.name,
            &self.settings.fee_schema,
            &self.overrides,
            is_maker,
            trade_type,
        )
    }

    fn quantize_order_price(&self, trading_pair: &TradingPair, price: Decimal) -> Decimal {
        match self.trading_rule(trading_pair) {
            Some(rule) => rule.quantize_price(price),
            None => price,
        }
    }

    fn quantize_order_amount(
        &self,
        trading_pair: &TradingPair,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Decimal {
        let Some(rule) = self.trading_rule(trading_pair) else {
            return amount;
        };
        let quantized = rule.quantize_amount(amount.min(rule.max_order_size));
        if quantized < rule.min_order_size {
            return Decimal::ZERO;
        }
        if let Some(price) = price {
            if price * quantized < rule.min_notional_size {
                return Decimal::ZERO;
            }
        }
        quantized
    }

    fn order_book(&self, trading_pair: &TradingPair) -> Option<Arc<RwLock<OrderBook>>> {
        self.order_book_tracker.order_book(trading_pair)
    }

    fn trading_rule(&self, trading_pair: &TradingPair) -> Option<TradingRule> {
        self.trading_rules.read().get(trading_pair).cloned()
    }

    fn in_flight_orders(&self) -> Vec<InFlightOrder> {
        self.order_tracker.all()
    }

    fn balances(&self) -> HashMap<String, Balance> {
        self.balances.read().clone()
    }

    fn tracking_states(&self) -> HashMap<String, Value> {
        self.order_tracker.tracking_states()
    }

    fn restore_tracking_states(&self, states: HashMap<String, Value>) {
        self.order_tracker.restore_tracking_states(states);
    }

    async fn last_traded_prices(
        &self,
        trading_pairs: &[TradingPair],
    ) -> Result<HashMap<TradingPair, Decimal>> {
        self.ensure_symbols_initialized().await?;
        self.order_book_ds.last_traded_prices(trading_pairs).await
    }
}

impl PerpetualConnector for BinancePerpetual {
    fn positions(&self) -> Vec<Position> {
        self.perpetual.positions()
    }

    fn position_mode(&self) -> PositionMode {
        self.perpetual.position_mode()
    }

    fn set_position_mode(&self, mode: PositionMode) {
        if !self.supported_position_modes().contains(&mode) {
            error!(?mode, "Position mode is not supported, not set");
            return;
        }
        if mode == self.perpetual.position_mode() {
            return;
        }
        if let Some(this) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                this.execute_set_position_mode(mode).await;
            });
        }
    }

    fn supported_position_modes(&self) -> Vec<PositionMode> {
        vec![PositionMode::OneWay, PositionMode::Hedge]
    }

    fn get_leverage(&self, trading_pair: &TradingPair) -> u32 {
        self.perpetual.leverage(trading_pair)
    }

    fn set_leverage(&self, trading_pair: &TradingPair, leverage: u32) {
        if let Some(this) = self.weak_self.upgrade() {
            let trading_pair = trading_pair.clone();
            tokio::spawn(async move {
                this.execute_set_leverage(trading_pair, leverage).await;
            });
        }
    }

    fn get_funding_info(&self, trading_pair: &TradingPair) -> Option<FundingInfo> {
        self.perpetual.funding_info(trading_pair)
    }

    fn funding_fee_poll_interval(&self) -> f64 {
        constants::FUNDING_FEE_POLL_INTERVAL
    }

    fn buy_collateral_token(&self, trading_pair: &TradingPair) -> String {
        trading_pair.quote().to_string()
    }

    fn sell_collateral_token(&self, trading_pair: &TradingPair) -> String {
        trading_pair.quote().to_string()
    }
}

impl crate::clock::TimeIterator for BinancePerpetual {
    fn tick(&self, timestamp: f64) -> Result<()> {
        Connector::tick(self, timestamp);
        Ok(())
    }

    fn ready(&self) -> bool {
        Connector::ready(self)
    }
}

fn is_unknown_order_error(error: &Error) -> bool {
    // -2013: order does not exist; -2011: unknown order sent (cancel path).
    matches!(
        error,
        Error::RestResponse { body, .. } if body.contains("-2013") || body.contains("-2011")
    )
}

fn body_error(body: &Value) -> Option<String> {
    match body.get("code").and_then(Value::as_i64) {
        Some(code) if code < 0 => {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or_default();
            Some(format!("code {code}: {msg}"))
        }
        _ => None,
    }
}

fn map_order_status(status: &str) -> Option<OrderState> {
    match status {
        "NEW" => Some(OrderState::Open),
        "PARTIALLY_FILLED" => Some(OrderState::PartiallyFilled),
        "FILLED" => Some(OrderState::Filled),
        "CANCELED" | "EXPIRED" => Some(OrderState::Cancelled),
        "REJECTED" => Some(OrderState::Failed),
        _ => None,
    }
}

fn map_position_side(side: &str) -> Option<PositionSide> {
    match side {
        "LONG" => Some(PositionSide::Long),
        "SHORT" => Some(PositionSide::Short),
        "BOTH" => Some(PositionSide::Both),
        _ => None,
    }
}

fn commission_fee(amount: Decimal, asset: String) -> TradeFee {
    TradeFee {
        percent: Decimal::ZERO,
        percent_token: None,
        application: TradeFeePercentageApplication::DeductedFromReturns,
        fixed_fees: vec![FixedFee { asset, amount }],
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventListener, MarketEventTag};
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn connector() -> Arc<BinancePerpetual> {
        let connector = BinancePerpetual::new(
            ApiCredentials::new("key", "secret"),
            vec![pair()],
            true,
            OverrideMap::default(),
        );
        connector.registry.write().insert("BTCUSDT", pair());
        let mut rule = TradingRule::new(pair());
        rule.min_order_size = dec!(0.01);
        rule.max_order_size = dec!(1000);
        rule.min_price_increment = dec!(0.1);
        rule.min_base_amount_increment = dec!(0.001);
        rule.min_notional_size = dec!(10);
        connector.trading_rules.write().insert(pair(), rule);
        connector
    }

    struct TagCollector {
        tags: Mutex<Vec<MarketEventTag>>,
    }

    impl EventListener for TagCollector {
        fn on_event(&self, event: &MarketEvent) {
            self.tags.lock().push(event.tag());
        }
    }

    #[test]
    fn order_status_mapping_covers_the_catalogue() {
        assert_eq!(map_order_status("NEW"), Some(OrderState::Open));
        assert_eq!(
            map_order_status("PARTIALLY_FILLED"),
            Some(OrderState::PartiallyFilled)
        );
        assert_eq!(map_order_status("FILLED"), Some(OrderState::Filled));
        assert_eq!(map_order_status("CANCELED"), Some(OrderState::Cancelled));
        assert_eq!(map_order_status("EXPIRED"), Some(OrderState::Cancelled));
        assert_eq!(map_order_status("REJECTED"), Some(OrderState::Failed));
        assert_eq!(map_order_status("NEW_INSURANCE"), None);
    }

    #[test]
    fn body_error_flags_negative_codes_only() {
        assert!(body_error(&serde_json::json!({"code": -2013, "msg": "Order does not exist."}))
            .is_some());
        assert!(body_error(&serde_json::json!({"code": 200, "msg": "success"})).is_none());
        assert!(body_error(&serde_json::json!({"lastUpdateId": 5})).is_none());
    }

    #[tokio::test]
    async fn quantization_applies_rules() {
        let connector = connector();
        assert_eq!(
            connector.quantize_order_price(&pair(), dec!(20000.17)),
            dec!(20000.1)
        );
        // Below minimum size quantizes to zero.
        assert_eq!(
            connector.quantize_order_amount(&pair(), dec!(0.005), None),
            dec!(0)
        );
        // Below minimum notional quantizes to zero.
        assert_eq!(
            connector.quantize_order_amount(&pair(), dec!(0.02), Some(dec!(100))),
            dec!(0)
        );
        assert_eq!(
            connector.quantize_order_amount(&pair(), dec!(0.0159), Some(dec!(20000))),
            dec!(0.015)
        );
    }

    #[tokio::test]
    async fn buy_tracks_pending_order_before_placement() {
        let connector = connector();
        let id = connector.buy(
            &pair(),
            dec!(0.1),
            OrderType::Limit,
            dec!(20000),
            OrderOptions::default(),
        );
        let orders = connector.in_flight_orders();
        let order = orders
            .iter()
            .find(|order| order.client_order_id == id)
            .expect("tracked immediately");
        assert_eq!(order.state, OrderState::PendingCreate);
        assert_eq!(order.amount, dec!(0.1));
        assert!(id.starts_with(constants::ORDER_ID_PREFIX));
    }

    #[tokio::test]
    async fn undersized_order_fails_pre_flight_without_network() {
        let connector = connector();
        let listener = Arc::new(TagCollector {
            tags: Mutex::new(Vec::new()),
        });
        connector.event_bus().add_listener(
            MarketEventTag::OrderFailure,
            &(listener.clone() as Arc<dyn EventListener>),
        );

        let id = connector.buy(
            &pair(),
            dec!(0.001),
            OrderType::Limit,
            dec!(20000),
            OrderOptions::default(),
        );
        // Let the spawned placement task run its pre-flight check.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(*listener.tags.lock(), vec![MarketEventTag::OrderFailure]);
        assert!(connector.order_tracker.get(&id).is_none());
    }

    #[test]
    fn tick_arms_poll_notifier_on_interval_boundaries() {
        let connector = connector();
        // No user stream data yet: the short (5s) interval applies.
        Connector::tick(connector.as_ref(), 4.0);
        assert!(!connector.poll_notifier.is_set());
        Connector::tick(connector.as_ref(), 6.0);
        assert!(connector.poll_notifier.is_set());
        connector.poll_notifier.reset();
        Connector::tick(connector.as_ref(), 7.0);
        assert!(!connector.poll_notifier.is_set());
    }

    #[test]
    fn funding_fee_tick_crossing_arms_notifier() {
        let connector = connector();
        let interval = connector.funding_fee_poll_interval();
        Connector::tick(connector.as_ref(), interval - 1.0);
        assert!(!connector.funding_fee_notifier.is_set());
        Connector::tick(connector.as_ref(), interval + 1.0);
        assert!(connector.funding_fee_notifier.is_set());
    }

    #[test]
    fn user_stream_fill_produces_delta_and_created_events() {
        let connector = connector();
        let listener = Arc::new(TagCollector {
            tags: Mutex::new(Vec::new()),
        });
        for tag in [
            MarketEventTag::BuyOrderCreated,
            MarketEventTag::OrderFilled,
            MarketEventTag::BuyOrderCompleted,
        ] {
            connector
                .event_bus()
                .add_listener(tag, &(listener.clone() as Arc<dyn EventListener>));
        }

        let order = InFlightOrder::new(
            "cw-Btest",
            pair(),
            OrderType::Limit,
            TradeType::Buy,
            dec!(20000),
            dec!(0.1),
            0.0,
        );
        connector.order_tracker.start_tracking(order);
        connector.order_tracker.process_order_update(OrderUpdate {
            client_order_id: "cw-Btest".into(),
            exchange_order_id: Some("1".into()),
            new_state: OrderState::Open,
            update_timestamp: 1.0,
        });

        let fill = |trade_id: i64, qty: &str| {
            serde_json::json!({
                "e": "ORDER_TRADE_UPDATE", "E": 2_000,
                "o": {
                    "s": "BTCUSDT", "c": "cw-Btest", "S": "BUY", "o": "LIMIT",
                    "X": "PARTIALLY_FILLED", "i": 1,
                    "l": qty, "L": "20000", "n": "0.01", "N": "USDT",
                    "T": 2_000, "t": trade_id, "z": qty
                }
            })
        };
        connector.process_user_event(fill(1, "0.04"));
        // The same trade replayed must not double-fill.
        connector.process_user_event(fill(1, "0.04"));
        connector.process_user_event(fill(2, "0.06"));

        assert_eq!(
            *listener.tags.lock(),
            vec![
                MarketEventTag::BuyOrderCreated,
                MarketEventTag::OrderFilled,
                MarketEventTag::OrderFilled,
                MarketEventTag::BuyOrderCompleted,
            ]
        );
    }

    #[test]
    fn account_update_refreshes_balances_and_positions() {
        let connector = connector();
        connector.process_user_event(serde_json::json!({
            "e": "ACCOUNT_UPDATE", "E": 3_000,
            "a": {
                "B": [{"a": "USDT", "wb": "1000.5", "cw": "900.5"}],
                "P": [{"s": "BTCUSDT", "pa": "0.1", "ep": "20000", "up": "5.5", "ps": "LONG"}]
            }
        }));

        let balances = Connector::balances(connector.as_ref());
        assert_eq!(balances["USDT"].total, dec!(1000.5));
        assert_eq!(balances["USDT"].available, dec!(900.5));

        let positions = PerpetualConnector::positions(connector.as_ref());
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].amount, dec!(0.1));
        assert_eq!(positions[0].position_side, PositionSide::Long);
    }
}
