use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::{ Duration, Instant };
use tracing::info;

/// Lock-free link / audio counters
#[derive(Debug)]
pub struct Stats {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_suppressed: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub control_sent: AtomicU64,
    pub control_received: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_suppressed: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            control_sent: AtomicU64::new(0),
            control_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Inbound frame dropped because we were transmitting.
    #[inline(always)]
    pub fn record_frame_suppressed(&self) {
        self.frames_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Empty outbound frame never put on the wire.
    #[inline(always)]
    pub fn record_frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_control_sent(&self) {
        self.control_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_control_received(&self) {
        self.control_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let sent = self.frames_sent.swap(0, Ordering::Relaxed);
        let sent_bytes = self.bytes_sent.swap(0, Ordering::Relaxed);
        let received = self.frames_received.swap(0, Ordering::Relaxed);
        let received_bytes = self.bytes_received.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            tx_fps: (sent as f64) / secs,
            tx_kbps: ((sent_bytes as f64) * 8.0) / (secs * 1_000.0),
            rx_fps: (received as f64) / secs,
            rx_kbps: ((received_bytes as f64) * 8.0) / (secs * 1_000.0),
            suppressed: self.frames_suppressed.swap(0, Ordering::Relaxed),
            rejected: self.frames_rejected.swap(0, Ordering::Relaxed),
            control_sent: self.control_sent.swap(0, Ordering::Relaxed),
            control_received: self.control_received.swap(0, Ordering::Relaxed),
            protocol_errors: self.protocol_errors.swap(0, Ordering::Relaxed),
            transport_errors: self.transport_errors.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub tx_fps: f64,
    pub tx_kbps: f64,
    pub rx_fps: f64,
    pub rx_kbps: f64,
    pub suppressed: u64,
    pub rejected: u64,
    pub control_sent: u64,
    pub control_received: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
}

impl StatsSnapshot {
    fn is_quiet(&self) -> bool {
        self.tx_fps == 0.0 &&
            self.rx_fps == 0.0 &&
            self.suppressed == 0 &&
            self.rejected == 0 &&
            self.control_sent == 0 &&
            self.control_received == 0 &&
            self.protocol_errors == 0 &&
            self.transport_errors == 0
    }
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // stats disabled, park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        if snap.is_quiet() {
            continue;
        }
        info!(
            tx_fps = format!("{:.1}", snap.tx_fps),
            tx_kbps = format!("{:.1}", snap.tx_kbps),
            rx_fps = format!("{:.1}", snap.rx_fps),
            rx_kbps = format!("{:.1}", snap.rx_kbps),
            suppressed = snap.suppressed,
            rejected = snap.rejected,
            ctrl_tx = snap.control_sent,
            ctrl_rx = snap.control_received,
            protocol_errors = snap.protocol_errors,
            transport_errors = snap.transport_errors,
            "📊 stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rates_and_reset() {
        let stats = Stats::new();
        for _ in 0..10 {
            stats.record_frame_sent(2048);
        }
        stats.record_frame_received(1000);
        stats.record_frame_suppressed();
        stats.record_protocol_error();

        let snap = stats.snapshot_and_reset(Duration::from_secs(2));
        assert!((snap.tx_fps - 5.0).abs() < 1e-9);
        assert!((snap.tx_kbps - (10.0 * 2048.0 * 8.0) / 2_000.0).abs() < 1e-9);
        assert!((snap.rx_fps - 0.5).abs() < 1e-9);
        assert_eq!(snap.suppressed, 1);
        assert_eq!(snap.protocol_errors, 1);
        assert!(!snap.is_quiet());

        let again = stats.snapshot_and_reset(Duration::from_secs(1));
        assert!(again.is_quiet());
    }
}
