//! HTTP façade over the auction engine.
//!
//! Booting replaces the current exchange; until the first boot every bid
//! answers code 100. The status endpoints read the collector snapshot, so
//! they never touch the store lock.

use axum::{
    extract::{Form, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

use crate::engine::config::{local_offset, AuctionConfig};
use crate::engine::exchange::Exchange;
use crate::engine::store::Bid;
use crate::models::{BidForm, BidResponse, BootForm, StatusInfo, StatusResponse};

/// Default round lengths when boot omits the schedule.
const FIRST_ROUND_SECS: i64 = 1800;
const SECOND_ROUND_SECS: i64 = 1800;

/// Code returned while no exchange is booted.
const CODE_NO_GAME: u16 = 100;

/// Shared application state.
#[derive(Clone, Default)]
pub struct AppState {
    pub exchange: Arc<RwLock<Option<Arc<Exchange>>>>,
}

/// Create the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/bid", post(post_bid))
        .route("/status", get(get_status))
        .route("/system/status", get(get_status))
        .route("/system/boot", post(post_boot))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn post_bid(
    State(state): State<AppState>,
    Form(form): Form<BidForm>,
) -> Json<BidResponse> {
    let exchange = state.exchange.read().clone();
    let Some(exchange) = exchange else {
        return Json(BidResponse {
            code: CODE_NO_GAME,
            message: "No game".to_string(),
            bid: None,
        });
    };

    let mut bid = Bid {
        client: form.client,
        price: form.price,
        ..Bid::default()
    };
    match exchange.bid(&mut bid).await {
        Ok(()) => Json(BidResponse {
            code: 0,
            message: "Success".to_string(),
            bid: Some(bid),
        }),
        Err(e) => Json(BidResponse {
            code: e.code(),
            message: e.to_string(),
            bid: None,
        }),
    }
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let exchange = state.exchange.read().clone();
    let Some(exchange) = exchange else {
        return Json(StatusResponse {
            code: CODE_NO_GAME,
            message: "No game".to_string(),
            info: StatusInfo::default(),
        });
    };
    Json(status_of(&exchange))
}

async fn post_boot(
    State(state): State<AppState>,
    Form(form): Form<BootForm>,
) -> Json<StatusResponse> {
    let config = boot_config(&form);
    info!(
        sid = %config.session_id(),
        capacity = config.capacity,
        warning_price = config.warning_price,
        "booting exchange"
    );

    // Retire the previous session gracefully before replacing it.
    let previous = state.exchange.write().take();
    if let Some(old) = previous {
        old.close().await;
    }

    match Exchange::from_env(config).await {
        Ok(exchange) => {
            tokio::spawn(Arc::clone(&exchange).serve());
            *state.exchange.write() = Some(Arc::clone(&exchange));
            Json(status_of(&exchange))
        }
        Err(e) => {
            error!(error = %e, "booting exchange failed");
            Json(StatusResponse {
                code: 1,
                message: e.to_string(),
                info: StatusInfo::default(),
            })
        }
    }
}

fn status_of(exchange: &Exchange) -> StatusResponse {
    let config = exchange.config();
    let state = exchange.state();
    StatusResponse {
        code: 0,
        message: "Success".to_string(),
        info: StatusInfo {
            start_time: fmt_time(Some(config.start_time)),
            half_time: fmt_time(Some(config.half_time)),
            end_time: fmt_time(Some(config.end_time)),
            capacity: config.capacity,
            warning_price: config.warning_price,
            time: fmt_time(state.time),
            session: state.session,
            bidders: state.bidders,
            lowest_price: state.lowest_price,
            lowest_time: fmt_time(state.lowest_time),
        },
    }
}

fn boot_config(form: &BootForm) -> AuctionConfig {
    // A schedule is taken only when all three times are present and parse;
    // a malformed field rejects the whole schedule and the defaults boot
    // instead of a session with a zeroed boundary.
    let schedule = form
        .start_time
        .as_deref()
        .zip(form.half_time.as_deref())
        .zip(form.end_time.as_deref())
        .and_then(|((start, half), end)| {
            Some((parse_time(start)?, parse_time(half)?, parse_time(end)?))
        });

    let (start_time, half_time, end_time) = schedule.unwrap_or_else(|| {
        let now = Utc::now();
        (
            now,
            now + Duration::seconds(FIRST_ROUND_SECS),
            now + Duration::seconds(FIRST_ROUND_SECS + SECOND_ROUND_SECS),
        )
    });

    AuctionConfig {
        start_time,
        half_time,
        end_time,
        capacity: form.capacity.unwrap_or_else(|| env_u32("CAPACITY")),
        warning_price: form
            .warning_price
            .unwrap_or_else(|| env_u32("WARNINGPRICE")),
    }
}

fn env_u32(name: &str) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    naive
        .and_local_timezone(local_offset())
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| {
        t.with_timezone(&local_offset())
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_default()
}
