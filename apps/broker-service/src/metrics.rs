use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, Opts};
use topic_bus::metrics::REGISTRY;

pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "broker_requests_total",
            "requests to /handle by action and outcome",
        ),
        &["action", "result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    Lazy::force(&REQUESTS);
    topic_bus::metrics::gather()
}
