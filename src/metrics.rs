use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, register_counter, register_gauge};

lazy_static! {
    pub static ref RATE_LIMIT_ADMITTED: Counter = register_counter!(
        "user_api_rate_limit_admitted_total",
        "Requests admitted by the rate limiter"
    )
    .unwrap();
    pub static ref RATE_LIMIT_REJECTED: Counter = register_counter!(
        "user_api_rate_limit_rejected_total",
        "Requests rejected with 429 by the rate limiter"
    )
    .unwrap();
    pub static ref TRACKED_CLIENTS: Gauge = register_gauge!(
        "user_api_rate_limit_tracked_clients",
        "Client keys currently held in the request log"
    )
    .unwrap();
}
