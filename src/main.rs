// ============================================================================
// CoinPulse – main.rs (Gestructureerd met Hoofdstukken & Secties)
// ============================================================================
//
// Overzicht:
//  0. Imports & dependencies
//  1. Configuratie & constantes
//  2. Coins, timeframes & views
//  3. Backend wire modellen
//  4. Fouten (fetch & bind)
//  5. Backend client (REST)
//  6. Chart data & binding
//  7. View router
//  8. Display formatting
//  9. Engine (hart van het systeem)
//     9.1 Panel loads
//     9.2 Refresh cycli & generaties
//     9.3 Autosync scheduler
//     9.4 Retrain
//     9.5 Selectie & snapshots
// 10. Countdown driver
// 11. HTTP server & API
// 12. Main entrypoint
// 13. Tests
// ============================================================================

use chrono::{Local, Utc};
use dashmap::DashMap;
use futures::try_join;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;

// ============================================================================
// HOOFDSTUK 1 – CONFIGURATIE & CONSTANTES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppConfig {
    // 1. Backend verbinding
    backend_url: String,
    history_limit: u32,

    // 2. HTTP server
    listen_port: u16,

    // 3. Sync instellingen
    default_coin: String,
    default_timeframe: String,
    sync_interval_secs: u64,
    autosync_on_start: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            // Backend
            backend_url: "http://127.0.0.1:8000".to_string(),
            history_limit: 100,

            // HTTP server
            listen_port: 8080,

            // Sync
            default_coin: "BTC".to_string(),
            default_timeframe: "1h".to_string(),
            sync_interval_secs: 120,
            autosync_on_start: false,
        }
    }
}

// Functies voor config laden/opslaan
const CONFIG_FILE: &str = "config.json";

async fn load_config() -> AppConfig {
    match tokio::fs::read_to_string(CONFIG_FILE).await {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => {
            let default = AppConfig::default();
            if let Ok(json) = serde_json::to_string_pretty(&default) {
                let _ = tokio::fs::write(CONFIG_FILE, json).await;
            }
            default
        }
    }
}

async fn save_config(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(config)?;
    tokio::fs::write(CONFIG_FILE, json).await?;
    Ok(())
}

// ============================================================================
// HOOFDSTUK 2 – COINS, TIMEFRAMES & VIEWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Coin {
    Btc,
    Eth,
}

impl Coin {
    fn as_str(&self) -> &'static str {
        match self {
            Coin::Btc => "BTC",
            Coin::Eth => "ETH",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Coin::Btc => "Bitcoin",
            Coin::Eth => "Ethereum",
        }
    }

    fn pair(&self) -> &'static str {
        match self {
            Coin::Btc => "BTC/USDT",
            Coin::Eth => "ETH/USDT",
        }
    }

    fn accent(&self) -> &'static str {
        match self {
            Coin::Btc => "#F7931A",
            Coin::Eth => "#627EEA",
        }
    }

    fn parse(s: &str) -> Option<Coin> {
        match s {
            "BTC" => Some(Coin::Btc),
            "ETH" => Some(Coin::Eth),
            _ => None,
        }
    }

    fn all() -> [Coin; 2] {
        [Coin::Btc, Coin::Eth]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Timeframe {
    M5,
    H1,
    H4,
}

impl Timeframe {
    fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    fn prediction_label(&self) -> &'static str {
        match self {
            Timeframe::M5 => "Next 5 Minutes",
            Timeframe::H1 => "Next 1 Hour",
            Timeframe::H4 => "Next 4 Hours",
        }
    }

    fn parse(s: &str) -> Option<Timeframe> {
        match s {
            "5m" => Some(Timeframe::M5),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            _ => None,
        }
    }

    fn all() -> [Timeframe; 3] {
        [Timeframe::M5, Timeframe::H1, Timeframe::H4]
    }
}

// De pagina die op dit moment zichtbaar is; bepaalt welke panels meegaan
// in een sync-tick (zie panels_for_view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Dashboard,
    Prediction,
    History,
    Performance,
}

impl View {
    fn as_str(&self) -> &'static str {
        match self {
            View::Dashboard => "dashboard",
            View::Prediction => "prediction",
            View::History => "history",
            View::Performance => "performance",
        }
    }

    fn parse(s: &str) -> Option<View> {
        match s {
            "dashboard" => Some(View::Dashboard),
            "prediction" => Some(View::Prediction),
            "history" => Some(View::History),
            "performance" => Some(View::Performance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Panel {
    Dashboard,
    History,
    Prediction,
    Performance,
}

impl Panel {
    fn as_str(&self) -> &'static str {
        match self {
            Panel::Dashboard => "dashboard",
            Panel::History => "history",
            Panel::Prediction => "prediction",
            Panel::Performance => "performance",
        }
    }

    fn parse(s: &str) -> Option<Panel> {
        match s {
            "dashboard" => Some(Panel::Dashboard),
            "history" => Some(Panel::History),
            "prediction" => Some(Panel::Prediction),
            "performance" => Some(Panel::Performance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChartSlot {
    Dashboard,
    Prediction,
}

impl ChartSlot {
    fn as_str(&self) -> &'static str {
        match self {
            ChartSlot::Dashboard => "dashboard",
            ChartSlot::Prediction => "prediction",
        }
    }

    fn parse(s: &str) -> Option<ChartSlot> {
        match s {
            "dashboard" => Some(ChartSlot::Dashboard),
            "prediction" => Some(ChartSlot::Prediction),
            _ => None,
        }
    }
}

// ============================================================================
// HOOFDSTUK 3 – BACKEND WIRE MODELLEN
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct PredictResponse {
    current: f64,
    predicted: f64,
    // De backend kan een vorm zonder tijd-as terugsturen; dan geen bind.
    #[serde(default)]
    times: Option<Vec<String>>,
    #[serde(default)]
    actual_prices: Vec<f64>,
    #[serde(default)]
    predicted_prices: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct BacktestResponse {
    mae: f64,
    rmse: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct OhlcvRow {
    date: String,
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    change: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct OhlcvResponse {
    data: Vec<OhlcvRow>,
}

// Per timeframe óf metrics óf een foutmarkering ("No model for ...").
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PerformanceEntry {
    Metrics {
        mae: f64,
        rmse: f64,
        accuracy: f64,
        current_price: f64,
        predicted_price: f64,
    },
    Unavailable {
        error: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct PerformanceResponse {
    performance: BTreeMap<String, PerformanceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RetrainResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    logs: Option<String>,
}

// ============================================================================
// HOOFDSTUK 4 – FOUTEN (FETCH & BIND)
// ============================================================================

#[derive(Debug, Error)]
enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("backend returned HTTP {status}: {body}")]
    Response { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    // 200-antwoord met een foutenvelop, of een retrain met status != success
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
#[error("series length mismatch: {labels} labels, {actual} actual, {predicted} predicted")]
struct SeriesMismatch {
    labels: usize,
    actual: usize,
    predicted: usize,
}

#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Bind(#[from] SeriesMismatch),
}

// ============================================================================
// HOOFDSTUK 5 – BACKEND CLIENT (REST)
// ============================================================================


#[derive(Clone)]
struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            // Geen eigen timeout: een hangende backend blokkeert alleen die ene cyclus.
            http: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(FetchError::Response {
                status: status.as_u16(),
                body: snippet(&body),
            });
        }

        // De backend meldt een onbekende coin met HTTP 200 + {"error": ...}
        let value: Value = serde_json::from_str(&body)?;
        if let Some(msg) = value.get("error").and_then(Value::as_str) {
            return Err(FetchError::Backend(msg.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    // Prediction + backtest horen bij elkaar: faalt er één, dan faalt het geheel
    // en wordt er niets half toegepast.
    async fn fetch_prediction_bundle(
        &self,
        coin: Coin,
        timeframe: Timeframe,
    ) -> Result<(PredictResponse, BacktestResponse), FetchError> {
        let predict_path = format!(
            "/predict?coin={}&timeframe={}",
            coin.as_str(),
            timeframe.as_str()
        );
        let backtest_path = format!(
            "/backtest?coin={}&timeframe={}",
            coin.as_str(),
            timeframe.as_str()
        );
        try_join!(
            self.get_json::<PredictResponse>(&predict_path),
            self.get_json::<BacktestResponse>(&backtest_path)
        )
    }

    async fn fetch_history(
        &self,
        coin: Coin,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<OhlcvResponse, FetchError> {
        self.get_json(&format!(
            "/ohlcv?coin={}&timeframe={}&limit={}",
            coin.as_str(),
            timeframe.as_str(),
            limit
        ))
        .await
    }

    async fn fetch_performance(&self, coin: Coin) -> Result<PerformanceResponse, FetchError> {
        self.get_json(&format!("/performance?coin={}", coin.as_str()))
            .await
    }

    // Langlopend (~20-40s serverzijde); wordt nooit opnieuw geprobeerd.
    async fn trigger_retrain(&self, timeframe: Timeframe) -> Result<RetrainResponse, FetchError> {
        let url = format!("{}/retrain?timeframe={}", self.base_url, timeframe.as_str());
        let resp = self.http.post(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(FetchError::Response {
                status: status.as_u16(),
                body: snippet(&body),
            });
        }

        let parsed: RetrainResponse = serde_json::from_str(&body)?;
        if parsed.status != "success" {
            let msg = if parsed.message.is_empty() {
                "Unknown error".to_string()
            } else {
                parsed.message
            };
            return Err(FetchError::Backend(msg));
        }
        Ok(parsed)
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(200).collect();
        format!("{}...", head)
    }
}

// ============================================================================
// HOOFDSTUK 6 – CHART DATA & BINDING
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
struct ChartData {
    labels: Vec<String>,
    actual: Vec<f64>,
    predicted: Vec<f64>,
    // Loopt op bij iedere geslaagde bind; pollers tekenen opnieuw bij verandering.
    revision: u64,
}

impl ChartData {
    // Alle drie de reeksen in één keer vervangen. Zonder tijd-as is dit een
    // no-op (oude chart blijft staan); bij ongelijke lengtes een harde fout,
    // er wordt nooit stilletjes afgekapt.
    fn bind(&mut self, series: &PredictResponse) -> Result<bool, SeriesMismatch> {
        let labels = match &series.times {
            Some(labels) => labels,
            None => return Ok(false),
        };

        if labels.len() != series.actual_prices.len()
            || labels.len() != series.predicted_prices.len()
        {
            return Err(SeriesMismatch {
                labels: labels.len(),
                actual: series.actual_prices.len(),
                predicted: series.predicted_prices.len(),
            });
        }

        self.labels = labels.clone();
        self.actual = series.actual_prices.clone();
        self.predicted = series.predicted_prices.clone();
        self.revision = self.revision.wrapping_add(1);
        Ok(true)
    }
}

// ============================================================================
// HOOFDSTUK 7 – VIEW ROUTER
// ============================================================================

// History is het primaire sync-doel en gaat altijd mee; prediction en
// performance alleen als hun pagina zichtbaar is. Handmatige refreshes
// lopen niet via deze functie.
fn panels_for_view(view: View) -> Vec<Panel> {
    let mut panels = vec![Panel::History];
    match view {
        View::Prediction => panels.push(Panel::Prediction),
        View::Performance => panels.push(Panel::Performance),
        View::Dashboard | View::History => {}
    }
    panels
}

// ============================================================================
// HOOFDSTUK 8 – DISPLAY FORMATTING
// ============================================================================

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn format_grouped(value: f64, decimals: usize) -> String {
    let negative = value < 0.0;
    let formatted = format!("{:.prec$}", value.abs(), prec = decimals);
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (formatted, None),
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&group_thousands(&int_part));
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(&frac);
    }
    out
}

fn trim_fraction(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

// "$50,000.00" – prijsvelden op dashboard en prediction pagina
fn format_price(value: f64) -> String {
    format!("${}", format_grouped(value, 2))
}

// "$50,000" / "$50,250.5" – performance tabel, tot 2 decimalen
fn format_price_loose(value: f64) -> String {
    format!("${}", trim_fraction(&format_grouped(value, 2)))
}

// "120" – MAE/RMSE zonder decimalen
fn format_metric(value: f64) -> String {
    format_grouped(value, 0)
}

// "95,123.457" – OHLCV tabelcellen, tot 3 decimalen
fn format_amount(value: f64) -> String {
    trim_fraction(&format_grouped(value, 3))
}

fn trend_label(current: f64, predicted: f64) -> &'static str {
    if predicted > current {
        "Uptrend"
    } else {
        "Downtrend"
    }
}

// ============================================================================
// HOOFDSTUK 9 – ENGINE (HART VAN HET SYSTEEM)
// ============================================================================


#[derive(Debug, Clone, Default, Serialize)]
struct HistoryRowView {
    date: String,
    time: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    change: String,
    positive: bool,
}

#[derive(Debug, Clone, Serialize)]
struct PerformanceRowView {
    timeframe: String,
    mae: String,
    rmse: String,
    accuracy: String,
    current_price: String,
    predicted_price: String,
}

// Het volledige view-model zoals de frontend het toont: alles voorgeformatteerd.
#[derive(Debug, Clone, Serialize)]
struct DisplayState {
    // Dashboard
    coin_name: String,
    coin_pair: String,
    current_price: String,
    predicted_price: String,
    trend: String,
    mae: String,
    rmse: String,
    prediction_label: String,

    // Prediction pagina
    pred_current: String,
    pred_predicted: String,
    pred_trend: String,
    pred_errors: String,

    // History pagina
    history_rows: Vec<HistoryRowView>,
    record_count: usize,

    // Performance pagina
    performance_rows: BTreeMap<String, PerformanceRowView>,

    // Sync widget
    sync_status: String,
    countdown: String,
    last_sync: String,
    last_error: Option<String>,

    // Retrain widget
    retrain_busy: bool,
    retrain_status: String,
    retrain_logs: Option<String>,
}

impl DisplayState {
    fn new(coin: Coin, timeframe: Timeframe) -> Self {
        Self {
            coin_name: coin.name().to_string(),
            coin_pair: coin.pair().to_string(),
            current_price: "--".to_string(),
            predicted_price: "--".to_string(),
            trend: "--".to_string(),
            mae: "--".to_string(),
            rmse: "--".to_string(),
            prediction_label: timeframe.prediction_label().to_string(),

            pred_current: "--".to_string(),
            pred_predicted: "--".to_string(),
            pred_trend: "--".to_string(),
            pred_errors: "--".to_string(),

            history_rows: Vec::new(),
            record_count: 0,

            performance_rows: BTreeMap::new(),

            sync_status: "Sync Off".to_string(),
            countdown: "--".to_string(),
            last_sync: "--".to_string(),
            last_error: None,

            retrain_busy: false,
            retrain_status: String::new(),
            retrain_logs: None,
        }
    }
}

// Actief betekent: er draait precies één countdown driver en next_fire_at_ms
// is het enige geplande vuurmoment.
struct SyncState {
    active: bool,
    interval_secs: u64,
    next_fire_at_ms: i64,
    driver: Option<JoinHandle<()>>,
}

impl SyncState {
    fn idle(interval_secs: u64) -> Self {
        Self {
            active: false,
            interval_secs,
            next_fire_at_ms: 0,
            driver: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Selection {
    coin: Coin,
    timeframe: Timeframe,
}

#[derive(Clone)]
struct Engine {
    client: BackendClient,
    charts: Arc<DashMap<ChartSlot, ChartData>>,
    display: Arc<Mutex<DisplayState>>,
    sync: Arc<Mutex<SyncState>>,
    selection: Arc<Mutex<Selection>>,
    view: Arc<Mutex<View>>,
    // Monotone teller per refresh-verzoek; verouderde resultaten worden
    // bij het toepassen genegeerd in plaats van nieuwere data te overschrijven.
    generation: Arc<AtomicU64>,
    config: Arc<Mutex<AppConfig>>,
}

impl Engine {
    fn new(config: Arc<Mutex<AppConfig>>) -> Self {
        let (backend_url, coin, timeframe, interval_secs) = {
            let cfg = config.lock().unwrap();
            (
                cfg.backend_url.clone(),
                Coin::parse(&cfg.default_coin).unwrap_or(Coin::Btc),
                Timeframe::parse(&cfg.default_timeframe).unwrap_or(Timeframe::H1),
                cfg.sync_interval_secs,
            )
        };

        Self {
            client: BackendClient::new(&backend_url),
            charts: Arc::new(DashMap::new()),
            display: Arc::new(Mutex::new(DisplayState::new(coin, timeframe))),
            sync: Arc::new(Mutex::new(SyncState::idle(interval_secs))),
            selection: Arc::new(Mutex::new(Selection { coin, timeframe })),
            view: Arc::new(Mutex::new(View::Dashboard)),
            generation: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn selection(&self) -> Selection {
        *self.selection.lock().unwrap()
    }

    fn current_view(&self) -> View {
        *self.view.lock().unwrap()
    }

    // -------------------------------------------------------------------------
    // 9.1 PANEL LOADS
    // -------------------------------------------------------------------------

    fn bind_chart(
        &self,
        slot: ChartSlot,
        series: &PredictResponse,
        generation: u64,
    ) -> Result<(), SeriesMismatch> {
        if !self.is_current_generation(generation) {
            debug!(generation, slot = slot.as_str(), "verouderde chart-bind genegeerd");
            return Ok(());
        }
        let mut chart = self.charts.entry(slot).or_default();
        chart.bind(series)?;
        Ok(())
    }

    async fn load_dashboard(&self, generation: u64) -> Result<(), SyncError> {
        let Selection { coin, timeframe } = self.selection();
        let (predict, backtest) = self.client.fetch_prediction_bundle(coin, timeframe).await?;

        self.bind_chart(ChartSlot::Dashboard, &predict, generation)?;
        if !self.is_current_generation(generation) {
            debug!(generation, "verouderd dashboard-resultaat genegeerd");
            return Ok(());
        }

        let mut d = self.display.lock().unwrap();
        d.coin_name = coin.name().to_string();
        d.coin_pair = coin.pair().to_string();
        d.current_price = format_price(predict.current);
        d.predicted_price = format_price(predict.predicted);
        d.trend = trend_label(predict.current, predict.predicted).to_string();
        d.mae = format_metric(backtest.mae);
        d.rmse = format_metric(backtest.rmse);
        d.prediction_label = timeframe.prediction_label().to_string();
        Ok(())
    }

    async fn load_prediction_page(&self, generation: u64) -> Result<(), SyncError> {
        let Selection { coin, timeframe } = self.selection();
        let (predict, backtest) = self.client.fetch_prediction_bundle(coin, timeframe).await?;

        self.bind_chart(ChartSlot::Prediction, &predict, generation)?;
        if !self.is_current_generation(generation) {
            debug!(generation, "verouderd prediction-resultaat genegeerd");
            return Ok(());
        }

        let mut d = self.display.lock().unwrap();
        d.pred_current = format_price(predict.current);
        d.pred_predicted = format_price(predict.predicted);
        d.pred_trend = trend_label(predict.current, predict.predicted).to_string();
        d.pred_errors = format!("{:.0} / {:.0}", backtest.mae, backtest.rmse);
        Ok(())
    }

    async fn load_history(&self, generation: u64) -> Result<(), SyncError> {
        let Selection { coin, timeframe } = self.selection();
        let limit = self.config.lock().unwrap().history_limit;
        let resp = self.client.fetch_history(coin, timeframe, limit).await?;

        if !self.is_current_generation(generation) {
            debug!(generation, "verouderd history-resultaat genegeerd");
            return Ok(());
        }

        // Volgorde zoals de backend levert (nieuwste eerst), ongewijzigd.
        let rows: Vec<HistoryRowView> = resp.data.iter().map(history_row_view).collect();
        let mut d = self.display.lock().unwrap();
        d.record_count = rows.len();
        d.history_rows = rows;
        Ok(())
    }

    async fn load_performance(&self, generation: u64) -> Result<(), SyncError> {
        let Selection { coin, .. } = self.selection();
        let resp = self.client.fetch_performance(coin).await?;

        if !self.is_current_generation(generation) {
            debug!(generation, "verouderd performance-resultaat genegeerd");
            return Ok(());
        }

        let mut d = self.display.lock().unwrap();
        for tf in Timeframe::all() {
            match resp.performance.get(tf.as_str()) {
                Some(PerformanceEntry::Metrics {
                    mae,
                    rmse,
                    accuracy,
                    current_price,
                    predicted_price,
                }) => {
                    d.performance_rows.insert(
                        tf.as_str().to_string(),
                        PerformanceRowView {
                            timeframe: tf.as_str().to_string(),
                            mae: format!("{:.2}", mae),
                            rmse: format!("{:.2}", rmse),
                            accuracy: format!("{:.2}%", accuracy),
                            current_price: format_price_loose(*current_price),
                            predicted_price: format_price_loose(*predicted_price),
                        },
                    );
                }
                // Foutmarkering of ontbrekende key: de oude rij blijft staan.
                Some(PerformanceEntry::Unavailable { .. }) | None => {}
            }
        }
        Ok(())
    }

    async fn load_panel(&self, panel: Panel, generation: u64) -> Result<(), SyncError> {
        match panel {
            Panel::Dashboard => self.load_dashboard(generation).await,
            Panel::History => self.load_history(generation).await,
            Panel::Prediction => self.load_prediction_page(generation).await,
            Panel::Performance => self.load_performance(generation).await,
        }
    }

    // -------------------------------------------------------------------------
    // 9.2 REFRESH CYCLI & GENERATIES
    // -------------------------------------------------------------------------

    // Handmatige refresh: de router wordt overgeslagen, alleen dit ene panel.
    async fn manual_refresh(&self, panel: Panel) -> Result<(), SyncError> {
        let generation = self.next_generation();
        debug!(generation, panel = panel.as_str(), "handmatige refresh");
        self.load_panel(panel, generation).await
    }

    async fn sync_visible_panels(&self, generation: u64) -> Result<(), SyncError> {
        for panel in panels_for_view(self.current_view()) {
            self.load_panel(panel, generation).await?;
        }
        Ok(())
    }

    // Eén volledige cyclus: status -> router -> panels -> status. Een fout is
    // terminaal voor deze ene cyclus; de scheduler blijft gewoon Active.
    async fn run_refresh_cycle(&self) {
        let generation = self.next_generation();
        {
            self.display.lock().unwrap().sync_status = "Updating...".to_string();
        }

        let outcome = self.sync_visible_panels(generation).await;

        if !self.is_current_generation(generation) {
            debug!(generation, "cyclus ingehaald door nieuwere refresh, status ongemoeid");
            return;
        }

        let active = self.sync.lock().unwrap().active;
        let mut d = self.display.lock().unwrap();
        match outcome {
            Ok(()) => {
                d.last_sync = Local::now().format("%H:%M:%S").to_string();
                d.last_error = None;
                if active {
                    d.sync_status = "Active".to_string();
                }
                info!(generation, "refresh-cyclus voltooid");
            }
            Err(e) => {
                d.sync_status = "Error".to_string();
                d.last_error = Some(e.to_string());
                warn!(generation, error = %e, "refresh-cyclus mislukt");
            }
        }
    }

    // -------------------------------------------------------------------------
    // 9.3 AUTOSYNC SCHEDULER
    // -------------------------------------------------------------------------

    // Idle -> Active. Directe refresh (niet op het interval wachten), daarna
    // neemt de countdown driver het over. Nogmaals aanroepen terwijl al
    // actief herstart netjes: de oude driver gaat eerst weg.
    fn enable_autosync(&self, interval_secs: u64) {
        let interval_secs = interval_secs.max(1);
        {
            let mut s = self.sync.lock().unwrap();
            if let Some(driver) = s.driver.take() {
                driver.abort();
            }
            s.active = true;
            s.interval_secs = interval_secs;
            s.next_fire_at_ms = Utc::now().timestamp_millis() + interval_secs as i64 * 1000;
            s.driver = Some(tokio::spawn(run_countdown_driver(self.clone())));
        }
        {
            let mut d = self.display.lock().unwrap();
            d.sync_status = "Syncing...".to_string();
            d.countdown = format!("{}s", interval_secs);
        }
        info!(interval_secs, "autosync ingeschakeld");

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_refresh_cycle().await;
        });
    }

    // Active -> Idle. Alleen de timer stopt; fetches die al onderweg zijn
    // maken gewoon af en passen hun resultaat nog toe.
    fn disable_autosync(&self) {
        {
            let mut s = self.sync.lock().unwrap();
            s.active = false;
            if let Some(driver) = s.driver.take() {
                driver.abort();
            }
        }
        let mut d = self.display.lock().unwrap();
        d.countdown = "--".to_string();
        d.sync_status = "Sync Off".to_string();
        info!("autosync uitgeschakeld");
    }

    // Alleen geldig terwijl Active: vuurmoment wordt volledig herbaseerd op
    // nu + nieuw interval (opgebouwde voortgang telt niet mee). Geen directe
    // refresh. In Idle een strikte no-op.
    fn reconfigure_autosync(&self, new_interval_secs: u64) {
        let new_interval_secs = new_interval_secs.max(1);
        {
            let mut s = self.sync.lock().unwrap();
            if !s.active {
                return;
            }
            s.interval_secs = new_interval_secs;
            s.next_fire_at_ms = Utc::now().timestamp_millis() + new_interval_secs as i64 * 1000;
            if let Some(driver) = s.driver.take() {
                driver.abort();
            }
            s.driver = Some(tokio::spawn(run_countdown_driver(self.clone())));
        }
        info!(interval_secs = new_interval_secs, "autosync-interval aangepast");
    }

    // -------------------------------------------------------------------------
    // 9.4 RETRAIN
    // -------------------------------------------------------------------------

    async fn run_retrain(&self, timeframe: Timeframe) -> Result<RetrainResponse, FetchError> {
        {
            let mut d = self.display.lock().unwrap();
            if d.retrain_busy {
                return Err(FetchError::Backend(
                    "Training already in progress".to_string(),
                ));
            }
            d.retrain_busy = true;
            d.retrain_status = format!(
                "Training {} model in progress... please wait (~20-40s)",
                timeframe.as_str()
            );
            d.retrain_logs = None;
        }
        info!(timeframe = timeframe.as_str(), "retrain gestart");

        let result = self.client.trigger_retrain(timeframe).await;

        let mut d = self.display.lock().unwrap();
        d.retrain_busy = false;
        match &result {
            Ok(resp) => {
                d.retrain_status = format!("Success! {}", resp.message);
                d.retrain_logs = resp.logs.clone();
                info!(timeframe = timeframe.as_str(), "retrain geslaagd");
            }
            Err(e) => {
                d.retrain_status = format!("Error: {}", e);
                warn!(timeframe = timeframe.as_str(), error = %e, "retrain mislukt");
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // 9.5 SELECTIE & SNAPSHOTS
    // -------------------------------------------------------------------------

    // Coin-klik in de UI: context wijzigen en het dashboard direct verversen.
    fn select_coin(&self, coin: Coin) {
        {
            self.selection.lock().unwrap().coin = coin;
        }
        {
            let mut d = self.display.lock().unwrap();
            d.coin_name = coin.name().to_string();
            d.coin_pair = coin.pair().to_string();
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.manual_refresh(Panel::Dashboard).await {
                warn!(error = %e, "dashboard-load na coinwissel mislukt");
            }
        });
    }

    fn select_timeframe(&self, timeframe: Timeframe) {
        {
            self.selection.lock().unwrap().timeframe = timeframe;
        }
        {
            self.display.lock().unwrap().prediction_label =
                timeframe.prediction_label().to_string();
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.manual_refresh(Panel::Dashboard).await {
                warn!(error = %e, "dashboard-load na timeframewissel mislukt");
            }
        });
    }

    fn set_view(&self, view: View) {
        *self.view.lock().unwrap() = view;
    }

    fn sync_snapshot(&self) -> SyncSnapshot {
        let s = self.sync.lock().unwrap();
        SyncSnapshot {
            active: s.active,
            interval_secs: s.interval_secs,
            next_fire_at_ms: s.next_fire_at_ms,
        }
    }

    fn state_snapshot(&self) -> StateSnapshot {
        let Selection { coin, timeframe } = self.selection();
        StateSnapshot {
            coin: coin.as_str().to_string(),
            coin_accent: coin.accent().to_string(),
            timeframe: timeframe.as_str().to_string(),
            view: self.current_view().as_str().to_string(),
            sync: self.sync_snapshot(),
            display: self.display.lock().unwrap().clone(),
        }
    }

    fn chart_snapshot(&self, slot: ChartSlot) -> ChartData {
        self.charts
            .get(&slot)
            .map(|chart| chart.value().clone())
            .unwrap_or_default()
    }

    fn history_snapshot(&self) -> Vec<HistoryRowView> {
        self.display.lock().unwrap().history_rows.clone()
    }

    fn performance_snapshot(&self) -> BTreeMap<String, PerformanceRowView> {
        self.display.lock().unwrap().performance_rows.clone()
    }
}

fn history_row_view(row: &OhlcvRow) -> HistoryRowView {
    HistoryRowView {
        date: row.date.clone(),
        time: row.time.clone(),
        open: format_amount(row.open),
        high: format_amount(row.high),
        low: format_amount(row.low),
        close: format_amount(row.close),
        volume: format_amount(row.volume),
        change: format!("{}%", row.change),
        positive: row.change >= 0.0,
    }
}

#[derive(Debug, Clone, Serialize)]
struct SyncSnapshot {
    active: bool,
    interval_secs: u64,
    next_fire_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
struct StateSnapshot {
    coin: String,
    coin_accent: String,
    timeframe: String,
    view: String,
    sync: SyncSnapshot,
    display: DisplayState,
}

// ============================================================================
// HOOFDSTUK 10 – COUNTDOWN DRIVER
// ============================================================================

// remaining = ceil((next_fire - now) / 1000), nooit negatief
fn remaining_seconds(next_fire_at_ms: i64, now_ms: i64) -> i64 {
    ((next_fire_at_ms - now_ms).max(0) + 999) / 1000
}

// Tikt iedere seconde zolang autosync actief is. Bij 0 wordt het volgende
// vuurmoment herbaseerd en draait de cyclus los van de driver, zodat het
// aftellen doorloopt terwijl er gefetcht wordt.
async fn run_countdown_driver(engine: Engine) {
    loop {
        sleep(Duration::from_secs(1)).await;

        let (remaining, fire) = {
            let mut s = engine.sync.lock().unwrap();
            if !s.active {
                break;
            }
            let now = Utc::now().timestamp_millis();
            let remaining = remaining_seconds(s.next_fire_at_ms, now);
            let fire = remaining <= 0;
            if fire {
                s.next_fire_at_ms = now + s.interval_secs as i64 * 1000;
            }
            (remaining, fire)
        };

        {
            engine.display.lock().unwrap().countdown = format!("{}s", remaining);
        }

        if fire {
            let e = engine.clone();
            tokio::spawn(async move {
                e.run_refresh_cycle().await;
            });
        }
    }
}

// ============================================================================
// HOOFDSTUK 11 – HTTP SERVER & API
// ============================================================================


async fn run_http(engine: Engine, config: Arc<Mutex<AppConfig>>) {
    let start_port = config.lock().unwrap().listen_port;
    let engine_filter = warp::any().map(move || engine.clone());
    let config_filter = warp::any().map(move || config.clone());

    let api_state = warp::path!("api" / "state")
        .and(engine_filter.clone())
        .map(|engine: Engine| warp::reply::json(&engine.state_snapshot()));

    let api_chart = warp::path!("api" / "chart" / String)
        .and(engine_filter.clone())
        .map(|slot: String, engine: Engine| match ChartSlot::parse(&slot) {
            Some(slot) => warp::reply::json(&engine.chart_snapshot(slot)),
            None => warp::reply::json(
                &serde_json::json!({"status": "error", "message": "Unknown chart"}),
            ),
        });

    let api_history = warp::path!("api" / "history")
        .and(engine_filter.clone())
        .map(|engine: Engine| warp::reply::json(&engine.history_snapshot()));

    let api_performance = warp::path!("api" / "performance")
        .and(engine_filter.clone())
        .map(|engine: Engine| warp::reply::json(&engine.performance_snapshot()));

    let api_config_get = warp::path!("api" / "config")
        .and(config_filter.clone())
        .map(|config: Arc<Mutex<AppConfig>>| {
            let cfg = config.lock().unwrap();
            warp::reply::json(&*cfg)
        });

    let api_config_post = warp::path!("api" / "config")
        .and(warp::post())
        .and(warp::body::json())
        .and(config_filter.clone())
        .and_then(
            |new_cfg: AppConfig, config: Arc<Mutex<AppConfig>>| async move {
                {
                    *config.lock().unwrap() = new_cfg.clone();
                }
                if let Err(e) = save_config(&new_cfg).await {
                    warn!(error = %e, "config opslaan mislukt");
                }
                Ok::<_, warp::Rejection>(warp::reply::json(
                    &serde_json::json!({"status": "saved"}),
                ))
            },
        );

    let api_config_reset = warp::path!("api" / "config" / "reset")
        .and(warp::post())
        .and(config_filter.clone())
        .and_then(|config: Arc<Mutex<AppConfig>>| async move {
            let default = AppConfig::default();
            {
                *config.lock().unwrap() = default.clone();
            }
            if let Err(e) = save_config(&default).await {
                warn!(error = %e, "config opslaan mislukt");
            }
            Ok::<_, warp::Rejection>(warp::reply::json(
                &serde_json::json!({"status": "reset"}),
            ))
        });

    let api_sync_enable = warp::path!("api" / "sync" / "enable")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and(config_filter.clone())
        .and_then(
            |body: Value, engine: Engine, config: Arc<Mutex<AppConfig>>| async move {
                let default_interval = config.lock().unwrap().sync_interval_secs;
                let interval_secs = body["interval_secs"].as_u64().unwrap_or(default_interval);
                engine.enable_autosync(interval_secs);
                Ok::<_, warp::Rejection>(warp::reply::json(
                    &serde_json::json!({"status": "enabled", "interval_secs": interval_secs}),
                ))
            },
        );

    let api_sync_disable = warp::path!("api" / "sync" / "disable")
        .and(warp::post())
        .and(engine_filter.clone())
        .map(|engine: Engine| {
            engine.disable_autosync();
            warp::reply::json(&serde_json::json!({"status": "disabled"}))
        });

    let api_sync_interval = warp::path!("api" / "sync" / "interval")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and_then(|body: Value, engine: Engine| async move {
            let reply = match body["interval_secs"].as_u64() {
                Some(interval_secs) => {
                    engine.reconfigure_autosync(interval_secs);
                    serde_json::json!({"status": "ok", "active": engine.sync_snapshot().active})
                }
                None => {
                    serde_json::json!({"status": "error", "message": "interval_secs required"})
                }
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&reply))
        });

    let api_view = warp::path!("api" / "view")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and_then(|body: Value, engine: Engine| async move {
            let reply = match View::parse(body["view"].as_str().unwrap_or("")) {
                Some(view) => {
                    engine.set_view(view);
                    serde_json::json!({"status": "ok", "view": view.as_str()})
                }
                None => serde_json::json!({"status": "error", "message": "Invalid view"}),
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&reply))
        });

    let api_coin = warp::path!("api" / "coin")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and_then(|body: Value, engine: Engine| async move {
            let reply = match Coin::parse(body["coin"].as_str().unwrap_or("")) {
                Some(coin) => {
                    engine.select_coin(coin);
                    serde_json::json!({"status": "ok", "coin": coin.as_str()})
                }
                None => serde_json::json!({"status": "error", "message": "Invalid coin"}),
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&reply))
        });

    let api_timeframe = warp::path!("api" / "timeframe")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and_then(|body: Value, engine: Engine| async move {
            let reply = match Timeframe::parse(body["timeframe"].as_str().unwrap_or("")) {
                Some(timeframe) => {
                    engine.select_timeframe(timeframe);
                    serde_json::json!({"status": "ok", "timeframe": timeframe.as_str()})
                }
                None => serde_json::json!({"status": "error", "message": "Invalid timeframe"}),
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&reply))
        });

    let api_refresh = warp::path!("api" / "refresh")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and_then(|body: Value, engine: Engine| async move {
            let reply = match Panel::parse(body["panel"].as_str().unwrap_or("")) {
                Some(panel) => match engine.manual_refresh(panel).await {
                    Ok(()) => serde_json::json!({"status": "ok", "panel": panel.as_str()}),
                    Err(e) => {
                        serde_json::json!({"status": "error", "message": e.to_string()})
                    }
                },
                None => serde_json::json!({"status": "error", "message": "Invalid panel"}),
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&reply))
        });

    // Wacht net als de dashboard-UI op het einde van de training (~20-40s).
    let api_retrain = warp::path!("api" / "retrain")
        .and(warp::post())
        .and(warp::body::json())
        .and(engine_filter.clone())
        .and_then(|body: Value, engine: Engine| async move {
            let reply = match Timeframe::parse(body["timeframe"].as_str().unwrap_or("")) {
                Some(timeframe) => match engine.run_retrain(timeframe).await {
                    Ok(resp) => serde_json::json!({
                        "status": "success",
                        "message": resp.message,
                        "logs": resp.logs,
                    }),
                    Err(e) => {
                        serde_json::json!({"status": "error", "message": e.to_string()})
                    }
                },
                None => serde_json::json!({"status": "error", "message": "Invalid timeframe"}),
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&reply))
        });

    let index = warp::path::end().map(|| {
        let coins: Vec<&str> = Coin::all().iter().map(|c| c.as_str()).collect();
        let timeframes: Vec<&str> = Timeframe::all().iter().map(|t| t.as_str()).collect();
        warp::reply::json(&serde_json::json!({
            "status": "CoinPulse engine running",
            "supported_coins": coins,
            "supported_timeframes": timeframes,
            "endpoints": [
                "/api/state", "/api/chart/{slot}", "/api/history", "/api/performance",
                "/api/config", "/api/config/reset",
                "/api/sync/enable", "/api/sync/disable", "/api/sync/interval",
                "/api/view", "/api/coin", "/api/timeframe", "/api/refresh", "/api/retrain",
            ],
        }))
    });

    let routes = api_state
        .or(api_chart)
        .or(api_history)
        .or(api_performance)
        .or(api_config_post)
        .or(api_config_reset)
        .or(api_config_get)
        .or(api_sync_enable)
        .or(api_sync_disable)
        .or(api_sync_interval)
        .or(api_view)
        .or(api_coin)
        .or(api_timeframe)
        .or(api_refresh)
        .or(api_retrain)
        .or(index);

    let mut port = start_port;
    loop {
        let addr_str = format!("127.0.0.1:{}", port);

        match TcpListener::bind(&addr_str) {
            Ok(listener) => {
                drop(listener);
                info!("API: http://{}", addr_str);
                warp::serve(routes.clone()).run(([127, 0, 0, 1], port)).await;
                break;
            }
            Err(_) => {
                warn!(port, "poort bezet, probeer volgende");
                port += 1;
                if port > start_port + 10 {
                    error!(start_port, "geen vrije poort gevonden, HTTP-server stopt");
                    break;
                }
            }
        }
    }
}

// ============================================================================
// HOOFDSTUK 12 – MAIN ENTRYPOINT
// ============================================================================


fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("coin_pulse=info".parse().expect("Invalid log directive")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = Arc::new(Mutex::new(load_config().await));
    let engine = Engine::new(config.clone());

    {
        let cfg = config.lock().unwrap();
        info!(backend = %cfg.backend_url, "CoinPulse engine start");
    }

    // Startgedrag van de dashboard-UI: één dashboard- en één history-load.
    let engine_boot = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine_boot.manual_refresh(Panel::Dashboard).await {
            warn!(error = %e, "initiële dashboard-load mislukt");
        }
        if let Err(e) = engine_boot.manual_refresh(Panel::History).await {
            warn!(error = %e, "initiële history-load mislukt");
        }
    });

    let (autosync_on_start, interval_secs) = {
        let cfg = config.lock().unwrap();
        (cfg.autosync_on_start, cfg.sync_interval_secs)
    };
    if autosync_on_start {
        engine.enable_autosync(interval_secs);
    }

    run_http(engine, config).await;

    Ok(())
}

// ============================================================================
// HOOFDSTUK 13 – TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use warp::http::StatusCode;

    // -------------------------------------------------------------------------
    // MOCK BACKEND
    // -------------------------------------------------------------------------

    #[derive(Clone, Copy)]
    struct PredictPlan {
        delay_ms: u64,
        current: f64,
        predicted: f64,
    }

    #[derive(Clone)]
    struct MockState {
        predict_hits: Arc<AtomicUsize>,
        backtest_hits: Arc<AtomicUsize>,
        history_hits: Arc<AtomicUsize>,
        performance_hits: Arc<AtomicUsize>,
        retrain_hits: Arc<AtomicUsize>,
        fail_backtest: Arc<AtomicBool>,
        fail_retrain: Arc<AtomicBool>,
        predict_error_envelope: Arc<AtomicBool>,
        perf_error_1h: Arc<AtomicBool>,
        // Per /predict-call afgewerkt (FIFO); leeg betekent het standaardantwoord.
        predict_plan: Arc<Mutex<VecDeque<PredictPlan>>>,
    }

    impl MockState {
        fn new() -> Self {
            Self {
                predict_hits: Arc::new(AtomicUsize::new(0)),
                backtest_hits: Arc::new(AtomicUsize::new(0)),
                history_hits: Arc::new(AtomicUsize::new(0)),
                performance_hits: Arc::new(AtomicUsize::new(0)),
                retrain_hits: Arc::new(AtomicUsize::new(0)),
                fail_backtest: Arc::new(AtomicBool::new(false)),
                fail_retrain: Arc::new(AtomicBool::new(false)),
                predict_error_envelope: Arc::new(AtomicBool::new(false)),
                perf_error_1h: Arc::new(AtomicBool::new(false)),
                predict_plan: Arc::new(Mutex::new(VecDeque::new())),
            }
        }
    }

    fn predict_body(current: f64, predicted: f64) -> Value {
        serde_json::json!({
            "coin": "BTC",
            "symbol": "BTCUSDT",
            "timeframe": "1h",
            "current": current,
            "predicted": predicted,
            "times": ["10:00", "11:00"],
            "actual_prices": [49000.0, 50000.0],
            "predicted_prices": [49200.0, 50500.0],
        })
    }

    async fn spawn_mock_backend() -> (std::net::SocketAddr, MockState) {
        let state = MockState::new();

        let st = state.clone();
        let predict = warp::path!("predict").and_then(move || {
            let st = st.clone();
            async move {
                st.predict_hits.fetch_add(1, Ordering::SeqCst);
                if st.predict_error_envelope.load(Ordering::SeqCst) {
                    return Ok::<_, warp::Rejection>(warp::reply::json(
                        &serde_json::json!({"error": "Coin DOGE not supported"}),
                    ));
                }
                let plan = { st.predict_plan.lock().unwrap().pop_front() };
                let (delay_ms, current, predicted) = match plan {
                    Some(p) => (p.delay_ms, p.current, p.predicted),
                    None => (0, 50000.0, 50500.0),
                };
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(warp::reply::json(&predict_body(current, predicted)))
            }
        });

        let st = state.clone();
        let backtest = warp::path!("backtest").and_then(move || {
            let st = st.clone();
            async move {
                st.backtest_hits.fetch_add(1, Ordering::SeqCst);
                if st.fail_backtest.load(Ordering::SeqCst) {
                    Ok::<_, warp::Rejection>(warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({"detail": "backtest unavailable"})),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ))
                } else {
                    Ok(warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({
                            "coin": "BTC", "symbol": "BTCUSDT", "timeframe": "1h",
                            "mae": 120.0, "rmse": 150.0,
                        })),
                        StatusCode::OK,
                    ))
                }
            }
        });

        let st = state.clone();
        let ohlcv = warp::path!("ohlcv").and_then(move || {
            let st = st.clone();
            async move {
                st.history_hits.fetch_add(1, Ordering::SeqCst);
                Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                    "coin": "BTC", "symbol": "BTCUSDT", "timeframe": "1h",
                    "data": [
                        {"date": "2024-05-02", "time": "12:00:00", "open": 50200.0,
                         "high": 50600.0, "low": 50100.0, "close": 50450.75,
                         "volume": 1234.5, "change": 1.25},
                        {"date": "2024-05-02", "time": "11:00:00", "open": 50000.0,
                         "high": 50300.0, "low": 49900.0, "close": 50200.0,
                         "volume": 987.25, "change": -0.4},
                    ],
                })))
            }
        });

        let st = state.clone();
        let performance = warp::path!("performance").and_then(move || {
            let st = st.clone();
            async move {
                st.performance_hits.fetch_add(1, Ordering::SeqCst);
                let h1 = if st.perf_error_1h.load(Ordering::SeqCst) {
                    serde_json::json!({"error": "No model for 1h"})
                } else {
                    serde_json::json!({"mae": 180.25, "rmse": 220.5, "accuracy": 97.12,
                                       "current_price": 50000.0, "predicted_price": 50250.5})
                };
                Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                    "coin": "BTC", "symbol": "BTCUSDT",
                    "performance": {
                        "5m": {"mae": 261.84, "rmse": 327.77, "accuracy": 98.5,
                               "current_price": 50000.0, "predicted_price": 50100.0},
                        "1h": h1,
                        "4h": {"mae": 95.5, "rmse": 140.0, "accuracy": 99.01,
                               "current_price": 50000.0, "predicted_price": 49800.0},
                    },
                })))
            }
        });

        let st = state.clone();
        let retrain = warp::path!("retrain")
            .and(warp::post())
            .and_then(move || {
                let st = st.clone();
                async move {
                    st.retrain_hits.fetch_add(1, Ordering::SeqCst);
                    if st.fail_retrain.load(Ordering::SeqCst) {
                        Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                            "status": "error",
                            "message": "Training failed: boom",
                        })))
                    } else {
                        Ok(warp::reply::json(&serde_json::json!({
                            "status": "success",
                            "message": "Model 1h retrained and reloaded successfully",
                            "logs": "epoch 10/10 done",
                        })))
                    }
                }
            });

        let routes = predict.or(backtest).or(ohlcv).or(performance).or(retrain);
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (addr, state)
    }

    fn test_engine(addr: &std::net::SocketAddr) -> Engine {
        let cfg = AppConfig {
            backend_url: format!("http://{}", addr),
            history_limit: 2,
            ..AppConfig::default()
        };
        Engine::new(Arc::new(Mutex::new(cfg)))
    }

    // -------------------------------------------------------------------------
    // PURE LOGICA
    // -------------------------------------------------------------------------

    #[test]
    fn remaining_seconds_ceils_and_clamps() {
        assert_eq!(remaining_seconds(10_000, 8_000), 2);
        assert_eq!(remaining_seconds(10_000, 9_001), 1);
        assert_eq!(remaining_seconds(10_000, 9_999), 1);
        assert_eq!(remaining_seconds(10_000, 10_000), 0);
        assert_eq!(remaining_seconds(10_000, 12_000), 0);
    }

    #[test]
    fn router_always_includes_history() {
        assert_eq!(panels_for_view(View::Dashboard), vec![Panel::History]);
        assert_eq!(panels_for_view(View::History), vec![Panel::History]);
        assert_eq!(
            panels_for_view(View::Prediction),
            vec![Panel::History, Panel::Prediction]
        );
        assert_eq!(
            panels_for_view(View::Performance),
            vec![Panel::History, Panel::Performance]
        );
    }

    fn sample_series(
        times: Option<Vec<&str>>,
        actual: Vec<f64>,
        predicted: Vec<f64>,
    ) -> PredictResponse {
        PredictResponse {
            current: 50000.0,
            predicted: 50500.0,
            times: times.map(|t| t.into_iter().map(String::from).collect()),
            actual_prices: actual,
            predicted_prices: predicted,
        }
    }

    #[test]
    fn bind_replaces_all_series_atomically() {
        let mut chart = ChartData::default();
        let redrawn = chart
            .bind(&sample_series(
                Some(vec!["10:00", "11:00"]),
                vec![1.0, 2.0],
                vec![1.5, 2.5],
            ))
            .unwrap();

        assert!(redrawn);
        assert_eq!(chart.labels, vec!["10:00", "11:00"]);
        assert_eq!(chart.actual, vec![1.0, 2.0]);
        assert_eq!(chart.predicted, vec![1.5, 2.5]);
        assert_eq!(chart.revision, 1);
    }

    #[test]
    fn bind_without_labels_keeps_chart() {
        let mut chart = ChartData::default();
        chart
            .bind(&sample_series(
                Some(vec!["10:00"]),
                vec![1.0],
                vec![1.5],
            ))
            .unwrap();

        let redrawn = chart
            .bind(&sample_series(None, vec![9.0, 9.0], vec![9.0, 9.0]))
            .unwrap();

        assert!(!redrawn);
        assert_eq!(chart.labels, vec!["10:00"]);
        assert_eq!(chart.actual, vec![1.0]);
        assert_eq!(chart.revision, 1);
    }

    #[test]
    fn bind_rejects_length_mismatch() {
        let mut chart = ChartData::default();
        let err = chart
            .bind(&sample_series(
                Some(vec!["10:00", "11:00"]),
                vec![1.0, 2.0, 3.0],
                vec![1.5, 2.5],
            ))
            .unwrap_err();

        assert_eq!(err.labels, 2);
        assert_eq!(err.actual, 3);
        assert!(chart.labels.is_empty());
        assert_eq!(chart.revision, 0);
    }

    #[test]
    fn price_formatting_matches_dashboard_display() {
        assert_eq!(format_price(50000.0), "$50,000.00");
        assert_eq!(format_price(50500.0), "$50,500.00");
        assert_eq!(format_price(0.5), "$0.50");
        assert_eq!(format_price(1234567.891), "$1,234,567.89");
    }

    #[test]
    fn metric_formatting_drops_decimals() {
        assert_eq!(format_metric(120.0), "120");
        assert_eq!(format_metric(150.0), "150");
        assert_eq!(format_metric(1234.4), "1,234");
    }

    #[test]
    fn loose_price_trims_trailing_zeros() {
        assert_eq!(format_price_loose(50000.0), "$50,000");
        assert_eq!(format_price_loose(50250.5), "$50,250.5");
        assert_eq!(format_price_loose(99.99), "$99.99");
    }

    #[test]
    fn amount_formatting_caps_three_decimals() {
        assert_eq!(format_amount(95123.4567), "95,123.457");
        assert_eq!(format_amount(1234.5), "1,234.5");
        assert_eq!(format_amount(1200.0), "1,200");
    }

    #[test]
    fn trend_follows_prediction_direction() {
        assert_eq!(trend_label(50000.0, 50500.0), "Uptrend");
        assert_eq!(trend_label(50000.0, 49500.0), "Downtrend");
        assert_eq!(trend_label(50000.0, 50000.0), "Downtrend");
    }

    #[test]
    fn catalogs_parse_their_wire_names() {
        assert_eq!(Coin::parse("BTC"), Some(Coin::Btc));
        assert_eq!(Coin::parse("DOGE"), None);
        assert_eq!(Coin::Eth.pair(), "ETH/USDT");
        assert_eq!(Timeframe::parse("4h"), Some(Timeframe::H4));
        assert_eq!(Timeframe::H1.prediction_label(), "Next 1 Hour");
        assert_eq!(View::parse("performance"), Some(View::Performance));
        assert_eq!(Panel::parse("dashboard"), Some(Panel::Dashboard));
    }

    #[test]
    fn config_defaults_round_trip() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.backend_url, "http://127.0.0.1:8000");
        assert_eq!(cfg.sync_interval_secs, 120);
        assert!(!cfg.autosync_on_start);

        let json = serde_json::to_string(&cfg).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.listen_port, cfg.listen_port);
        assert_eq!(back.history_limit, cfg.history_limit);
    }

    #[test]
    fn predict_response_tolerates_missing_times() {
        let json = r#"{"coin":"BTC","symbol":"BTCUSDT","timeframe":"1h",
                       "current":100.0,"predicted":101.0,
                       "actual_prices":[1.0],"predicted_prices":[2.0]}"#;
        let parsed: PredictResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.times.is_none());
        assert_eq!(parsed.current, 100.0);
    }

    #[test]
    fn performance_entry_distinguishes_error_marker() {
        let json = r#"{"coin":"BTC","symbol":"BTCUSDT","performance":{
            "5m":{"mae":261.84,"rmse":327.77,"accuracy":98.5,
                  "current_price":50000.0,"predicted_price":50250.5},
            "1h":{"error":"No model for 1h"}}}"#;
        let parsed: PerformanceResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            parsed.performance.get("5m"),
            Some(PerformanceEntry::Metrics { .. })
        ));
        assert!(matches!(
            parsed.performance.get("1h"),
            Some(PerformanceEntry::Unavailable { .. })
        ));
    }

    // -------------------------------------------------------------------------
    // SCHEDULER SEMANTIEK (tegen de mock backend)
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn enable_fires_immediate_refresh_and_sets_next_fire() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        let before = Utc::now().timestamp_millis();
        engine.enable_autosync(60);

        sleep(Duration::from_millis(400)).await;
        // directe refresh, onafhankelijk van het interval van 60s
        assert!(mock.history_hits.load(Ordering::SeqCst) >= 1);

        let snap = engine.sync_snapshot();
        assert!(snap.active);
        assert_eq!(snap.interval_secs, 60);
        assert!(snap.next_fire_at_ms >= before + 59_000);
        assert!(snap.next_fire_at_ms <= Utc::now().timestamp_millis() + 60_000);

        sleep(Duration::from_millis(1200)).await;
        let countdown = engine.display.lock().unwrap().countdown.clone();
        assert!(countdown.ends_with('s'), "countdown was {:?}", countdown);
    }

    #[tokio::test]
    async fn disable_stops_future_ticks() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        engine.enable_autosync(1);
        sleep(Duration::from_millis(1600)).await;
        engine.disable_autosync();
        sleep(Duration::from_millis(200)).await;

        let after_disable = mock.history_hits.load(Ordering::SeqCst);
        assert!(after_disable >= 1);

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(mock.history_hits.load(Ordering::SeqCst), after_disable);

        let snap = engine.sync_snapshot();
        assert!(!snap.active);
        let d = engine.display.lock().unwrap();
        assert_eq!(d.countdown, "--");
        assert_eq!(d.sync_status, "Sync Off");
    }

    #[tokio::test]
    async fn reconfigure_rebases_without_immediate_refresh() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        engine.enable_autosync(120);
        sleep(Duration::from_millis(300)).await;
        let after_enable = mock.history_hits.load(Ordering::SeqCst);
        assert_eq!(after_enable, 1);

        let rebased_at = Utc::now().timestamp_millis();
        engine.reconfigure_autosync(1);

        sleep(Duration::from_millis(300)).await;
        // reconfigure zelf veroorzaakt geen refresh
        assert_eq!(mock.history_hits.load(Ordering::SeqCst), after_enable);

        let snap = engine.sync_snapshot();
        assert_eq!(snap.interval_secs, 1);
        assert!(snap.next_fire_at_ms <= rebased_at + 1100);

        sleep(Duration::from_millis(1600)).await;
        // volgende fire ~1s na de reconfigure, niet pas na de oorspronkelijke 120s
        assert!(mock.history_hits.load(Ordering::SeqCst) > after_enable);
    }

    #[tokio::test]
    async fn reconfigure_while_idle_is_noop() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        engine.reconfigure_autosync(1);
        sleep(Duration::from_millis(1500)).await;

        assert_eq!(mock.history_hits.load(Ordering::SeqCst), 0);
        let snap = engine.sync_snapshot();
        assert!(!snap.active);
        assert_eq!(snap.interval_secs, 120);
        assert_eq!(snap.next_fire_at_ms, 0);
        assert_eq!(engine.display.lock().unwrap().countdown, "--");
    }

    #[tokio::test]
    async fn failed_cycle_sets_error_and_next_tick_recovers() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);
        engine.set_view(View::Prediction);

        mock.fail_backtest.store(true, Ordering::SeqCst);
        engine.enable_autosync(1);
        sleep(Duration::from_millis(400)).await;
        {
            let d = engine.display.lock().unwrap();
            assert_eq!(d.sync_status, "Error");
            assert!(d.last_error.is_some());
        }
        // falen haalt de scheduler niet uit Active
        assert!(engine.sync_snapshot().active);

        mock.fail_backtest.store(false, Ordering::SeqCst);
        sleep(Duration::from_millis(2200)).await;

        let d = engine.display.lock().unwrap();
        assert_eq!(d.sync_status, "Active");
        assert!(d.last_error.is_none());
        assert_eq!(d.pred_errors, "120 / 150");
    }

    // -------------------------------------------------------------------------
    // FETCH & BIND GEDRAG (tegen de mock backend)
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn bundle_failure_leaves_dashboard_untouched_then_retry_succeeds() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        mock.fail_backtest.store(true, Ordering::SeqCst);
        assert!(engine.manual_refresh(Panel::Dashboard).await.is_err());

        {
            let d = engine.display.lock().unwrap();
            assert_eq!(d.current_price, "--");
            assert_eq!(d.mae, "--");
        }
        assert_eq!(engine.chart_snapshot(ChartSlot::Dashboard).revision, 0);

        mock.fail_backtest.store(false, Ordering::SeqCst);
        engine.manual_refresh(Panel::Dashboard).await.unwrap();

        {
            let d = engine.display.lock().unwrap();
            assert_eq!(d.current_price, "$50,000.00");
            assert_eq!(d.predicted_price, "$50,500.00");
            assert_eq!(d.trend, "Uptrend");
            assert_eq!(d.mae, "120");
            assert_eq!(d.rmse, "150");
        }

        let chart = engine.chart_snapshot(ChartSlot::Dashboard);
        assert_eq!(chart.labels, vec!["10:00", "11:00"]);
        assert_eq!(chart.actual, vec![49000.0, 50000.0]);
        assert_eq!(chart.predicted, vec![49200.0, 50500.0]);
        assert_eq!(chart.revision, 1);
    }

    #[tokio::test]
    async fn error_envelope_surfaces_message() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        mock.predict_error_envelope.store(true, Ordering::SeqCst);
        let err = engine.manual_refresh(Panel::Dashboard).await.unwrap_err();
        assert!(err.to_string().contains("Coin DOGE not supported"));
    }

    #[tokio::test]
    async fn later_refresh_wins_even_if_earlier_resolves_last() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        {
            let mut plan = mock.predict_plan.lock().unwrap();
            plan.push_back(PredictPlan {
                delay_ms: 800,
                current: 100.0,
                predicted: 110.0,
            });
            plan.push_back(PredictPlan {
                delay_ms: 0,
                current: 200.0,
                predicted: 210.0,
            });
        }

        let slow_engine = engine.clone();
        let slow =
            tokio::spawn(async move { slow_engine.manual_refresh(Panel::Dashboard).await });
        sleep(Duration::from_millis(150)).await;

        // nieuwere generatie, landt als eerste
        engine.manual_refresh(Panel::Dashboard).await.unwrap();
        // oudere generatie landt later en moet genegeerd worden
        slow.await.unwrap().unwrap();

        let d = engine.display.lock().unwrap();
        assert_eq!(d.current_price, "$200.00");
    }

    #[tokio::test]
    async fn history_rows_render_in_backend_order() {
        let (addr, _mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        engine.manual_refresh(Panel::History).await.unwrap();

        let d = engine.display.lock().unwrap();
        assert_eq!(d.record_count, 2);
        assert_eq!(d.history_rows[0].date, "2024-05-02");
        assert_eq!(d.history_rows[0].time, "12:00:00");
        assert_eq!(d.history_rows[0].close, "50,450.75");
        assert_eq!(d.history_rows[0].volume, "1,234.5");
        assert_eq!(d.history_rows[0].change, "1.25%");
        assert!(d.history_rows[0].positive);
        assert_eq!(d.history_rows[1].change, "-0.4%");
        assert!(!d.history_rows[1].positive);
    }

    #[tokio::test]
    async fn performance_error_entries_keep_stale_rows() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        engine.manual_refresh(Panel::Performance).await.unwrap();
        let old_mae = {
            let d = engine.display.lock().unwrap();
            assert_eq!(d.performance_rows.len(), 3);
            d.performance_rows["1h"].mae.clone()
        };

        mock.perf_error_1h.store(true, Ordering::SeqCst);
        engine.manual_refresh(Panel::Performance).await.unwrap();

        let d = engine.display.lock().unwrap();
        assert_eq!(d.performance_rows["1h"].mae, old_mae);
        assert_eq!(d.performance_rows["5m"].accuracy, "98.50%");
        assert_eq!(d.performance_rows["4h"].predicted_price, "$49,800");
    }

    #[tokio::test]
    async fn retrain_success_and_failure_clear_busy_flag() {
        let (addr, mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        let resp = engine.run_retrain(Timeframe::H1).await.unwrap();
        assert_eq!(resp.status, "success");
        {
            let d = engine.display.lock().unwrap();
            assert!(!d.retrain_busy);
            assert!(d.retrain_status.starts_with("Success!"));
            assert_eq!(d.retrain_logs.as_deref(), Some("epoch 10/10 done"));
        }

        mock.fail_retrain.store(true, Ordering::SeqCst);
        let err = engine.run_retrain(Timeframe::H1).await.unwrap_err();
        assert!(err.to_string().contains("Training failed"));

        let d = engine.display.lock().unwrap();
        assert!(!d.retrain_busy);
        assert_eq!(d.retrain_status, format!("Error: {}", err));
    }

    #[tokio::test]
    async fn state_snapshot_reflects_selection_and_view() {
        let (addr, _mock) = spawn_mock_backend().await;
        let engine = test_engine(&addr);

        engine.set_view(View::Performance);
        engine.select_timeframe(Timeframe::H4);
        engine.select_coin(Coin::Eth);
        sleep(Duration::from_millis(300)).await;

        let snap = engine.state_snapshot();
        assert_eq!(snap.coin, "ETH");
        assert_eq!(snap.coin_accent, "#627EEA");
        assert_eq!(snap.timeframe, "4h");
        assert_eq!(snap.view, "performance");
        assert_eq!(snap.display.coin_name, "Ethereum");
        assert_eq!(snap.display.prediction_label, "Next 4 Hours");
    }
}
