// Phi-accrual failure detector: for each monitored endpoint, a bounded
// sliding window of heartbeat inter-arrival times. `interpret` derives a
// suspicion level phi from an exponential-tail approximation over the
// window's mean; crossing the configured threshold convicts the endpoint.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use submerge_net::{Duration, NodeID, NodeTime};
use tracing::debug;

pub trait FailureDetectionEventListener: Send + Sync {
    fn convict(&self, endpoint: NodeID);
}

struct ArrivalWindow {
    last_arrival: Option<NodeTime>,
    intervals: std::collections::VecDeque<i64>,
    max_samples: usize,
}

impl ArrivalWindow {
    fn new(max_samples: usize) -> Self {
        ArrivalWindow {
            last_arrival: None,
            intervals: std::collections::VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    fn add(&mut self, arrival: NodeTime) {
        if let Some(last) = self.last_arrival {
            let interval = arrival.elapsed_since(last).as_micros();
            if interval > 0 {
                if self.intervals.len() == self.max_samples {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(interval);
            }
        }
        self.last_arrival = Some(arrival);
    }

    fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            // No samples yet: assume a generous mean so a freshly-seen
            // endpoint isn't convicted before it's had a chance to build
            // up a window.
            return 1.0;
        }
        self.intervals.iter().sum::<i64>() as f64 / self.intervals.len() as f64
    }

    // phi = -log10(P(time since last heartbeat > `since_last_micros`))
    // under an exponential distribution with the window's mean.
    fn phi(&self, since_last_micros: f64) -> f64 {
        let mean = self.mean().max(1.0);
        let exponent = since_last_micros / mean;
        exponent / std::f64::consts::LN_10
    }
}

pub struct FailureDetectorConfig {
    pub phi_threshold: f64,
    pub max_sample_size: usize,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        FailureDetectorConfig {
            phi_threshold: 8.0,
            max_sample_size: 1000,
        }
    }
}

pub struct FailureDetector {
    config: FailureDetectorConfig,
    windows: RwLock<HashMap<NodeID, ArrivalWindow>>,
    listeners: RwLock<Vec<Arc<dyn FailureDetectionEventListener>>>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        FailureDetector {
            config,
            windows: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register_failure_detection_event_listener(
        &self,
        listener: Arc<dyn FailureDetectionEventListener>,
    ) {
        let mut guard = self.listeners.write().unwrap();
        let mut next = (*guard).clone();
        next.push(listener);
        *guard = next;
    }

    // Appends the interval since the endpoint's last report. Called
    // whenever the gossiper observes a strictly newer generation or
    // version from `endpoint` (see gossip.rs).
    pub fn report(&self, endpoint: NodeID, now: NodeTime) {
        let mut windows = self.windows.write().unwrap();
        windows
            .entry(endpoint)
            .or_insert_with(|| ArrivalWindow::new(self.config.max_sample_size))
            .add(now);
    }

    // Computes phi for `endpoint` given `now`; if it exceeds the
    // configured threshold, notifies listeners via `convict` and returns
    // true.
    pub fn interpret(&self, endpoint: NodeID, now: NodeTime) -> bool {
        let phi = {
            let windows = self.windows.read().unwrap();
            let Some(window) = windows.get(&endpoint) else {
                return false;
            };
            let Some(last) = window.last_arrival else {
                return false;
            };
            let since = now.elapsed_since(last).as_micros().max(0) as f64;
            window.phi(since)
        };
        if phi > self.config.phi_threshold {
            debug!(?endpoint, phi, threshold = self.config.phi_threshold, "phi crossed threshold, convicting");
            let listeners = self.listeners.read().unwrap().clone();
            for l in listeners.iter() {
                l.convict(endpoint);
            }
            true
        } else {
            false
        }
    }

    pub fn remove(&self, endpoint: NodeID) {
        self.windows.write().unwrap().remove(&endpoint);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);
    impl FailureDetectionEventListener for Counter {
        fn convict(&self, _endpoint: NodeID) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn steady_heartbeats_do_not_convict() {
        let fd = FailureDetector::new(FailureDetectorConfig::default());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        fd.register_failure_detection_event_listener(counter.clone());
        let mut t = NodeTime::from_micros(0);
        for _ in 0..20 {
            fd.report(NodeID(1), t);
            t = t.advance(Duration::from_millis(100));
        }
        assert!(!fd.interpret(NodeID(1), t.advance(Duration::from_millis(100))));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn long_silence_convicts() {
        let fd = FailureDetector::new(FailureDetectorConfig::default());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        fd.register_failure_detection_event_listener(counter.clone());
        let mut t = NodeTime::from_micros(0);
        for _ in 0..20 {
            fd.report(NodeID(1), t);
            t = t.advance(Duration::from_millis(100));
        }
        // silence for 50 seconds, way beyond the ~100ms mean
        let convicted = fd.interpret(NodeID(1), t.advance(Duration::from_secs(50)));
        assert!(convicted);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_endpoint_is_never_convicted() {
        let fd = FailureDetector::new(FailureDetectorConfig::default());
        assert!(!fd.interpret(NodeID(99), NodeTime::from_micros(1_000_000)));
    }
}
