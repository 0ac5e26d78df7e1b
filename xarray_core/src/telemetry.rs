//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process registers a raw callback that
//! receives name/value pairs for every counter and gauge update. Gauges are
//! reported as their current level, clamped at zero.

use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Signature for external collectors. `name` is NUL-terminated and only
/// valid for the duration of the call.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages and install the recorder.
/// Only the first registration wins.
#[no_mangle]
pub extern "C" fn xarray_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
    init();
}

fn emit(name: &CString, value: u64) {
    if let Some(cb) = CALLBACK.get() {
        // SAFETY: `name` outlives the call; the callback contract is the
        // host's.
        unsafe { cb(name.as_ptr(), value as c_ulonglong) };
    }
}

/// Forwarding recorder. Uses the callback **if** it was registered.
///
/// Metrics are cached per key so that a gauge keeps one level across the
/// handles the macros hand out.
#[derive(Default)]
struct FfiRecorder {
    metrics: DashMap<Key, Arc<FfiMetric>>,
}

impl FfiRecorder {
    fn metric(&self, key: &Key) -> Arc<FfiMetric> {
        if let Some(found) = self.metrics.get(key) {
            return Arc::clone(found.value());
        }
        let entry = self.metrics.entry(key.clone()).or_insert_with(|| FfiMetric::new(key));
        Arc::clone(entry.value())
    }
}

/// One registered metric; the C name is built once at registration.
struct FfiMetric {
    name: CString,
    /// Gauge level as `f64` bits.
    level: AtomicU64,
}

impl FfiMetric {
    fn new(key: &Key) -> Arc<Self> {
        let name = CString::new(key.name()).unwrap_or_default();
        Arc::new(Self {
            name,
            level: AtomicU64::new(0f64.to_bits()),
        })
    }

    fn level(&self) -> f64 {
        f64::from_bits(self.level.load(Ordering::Acquire))
    }

    /// Apply `f` to the gauge level and return the new level.
    fn update(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut cur = self.level.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(cur));
            match self.level.compare_exchange_weak(cur, next.to_bits(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return next,
                Err(seen) => cur = seen,
            }
        }
    }

    fn emit_level(&self, level: f64) {
        emit(&self.name, level.max(0.0) as u64);
    }
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(self.metric(key))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.metric(key))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.metric(key))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        emit(&self.name, value);
    }
    fn absolute(&self, value: u64) {
        emit(&self.name, value);
    }
}

impl metrics::GaugeFn for FfiMetric {
    fn set(&self, value: f64) {
        self.level.store(value.to_bits(), Ordering::Release);
        self.emit_level(value);
    }
    fn increment(&self, value: f64) {
        let level = self.update(|cur| cur + value);
        self.emit_level(level);
    }
    fn decrement(&self, value: f64) {
        let level = self.update(|cur| cur - value);
        self.emit_level(level);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        emit(&self.name, value as u64);
    }
}

/// Install exactly **once**.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(FfiRecorder::default());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{Level, Metadata};

    fn metadata() -> Metadata<'static> {
        Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
    }

    #[test]
    fn gauges_track_their_level_across_handles() {
        let recorder = FfiRecorder::default();
        let key = Key::from_name("xarray_live_nodes");
        let up = recorder.register_gauge(&key, &metadata());
        let down = recorder.register_gauge(&key, &metadata());

        up.set(5.0);
        down.decrement(2.0);
        up.increment(1.0);
        let level = recorder.metrics.get(&key).map(|m| m.level());
        assert_eq!(level, Some(4.0));

        down.decrement(10.0);
        let level = recorder.metrics.get(&key).map(|m| m.level());
        assert_eq!(level, Some(-6.0));
        assert_eq!(recorder.metrics.len(), 1);
    }
}
