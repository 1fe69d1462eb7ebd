use once_cell::sync::Lazy;
use prometheus::{
    IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec,
};

static REQ_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "registry_requests",
        "Requests by handler",
        &["handler"]
    )
    .unwrap()
});

static ERR_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "registry_errors",
        "Failed service calls by function",
        &["func"]
    )
    .unwrap()
});

static LIMITER_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "registry_limiter_rejected",
        "Requests rejected by the admission limiter"
    )
    .unwrap()
});

static PULLTHROUGH_BLOB: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "registry_pullthrough_blob",
        "Blobs served from remote repositories"
    )
    .unwrap()
});

// the only metrics surface the services see. the prometheus wiring behind
// it stays in this module
pub trait Sink: Send + Sync {
    fn request(&self, handler: &str);
    fn failure(&self, func: &str);
    fn limiter_rejected(&self);
    fn pullthrough_blob(&self);
}

pub struct PrometheusSink;

impl Sink for PrometheusSink {
    fn request(&self, handler: &str) {
        REQ_COUNT.with_label_values(&[handler]).inc();
    }

    fn failure(&self, func: &str) {
        ERR_COUNT.with_label_values(&[func]).inc();
    }

    fn limiter_rejected(&self) {
        LIMITER_REJECTED.inc();
    }

    fn pullthrough_blob(&self) {
        PULLTHROUGH_BLOB.inc();
    }
}

// a sink that drops everything, used when metrics are disabled
pub struct NullSink;

impl Sink for NullSink {
    fn request(&self, _handler: &str) {}
    fn failure(&self, _func: &str) {}
    fn limiter_rejected(&self) {}
    fn pullthrough_blob(&self) {}
}

pub fn gather_text() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        log::error!("encoding metrics failed: {:?}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
