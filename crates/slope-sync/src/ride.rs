//! Ride tracker for the home screen. Stats are simulated: each tick adds a
//! random distance and samples a random speed.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use slope_types::models::RideData;

pub const START_ELEVATION_M: f64 = 2453.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideState {
    Idle,
    Tracking,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RideStats {
    pub elapsed_secs: u64,
    pub distance_km: f64,
    pub speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub elevation_m: f64,
}

impl Default for RideStats {
    fn default() -> Self {
        Self {
            elapsed_secs: 0,
            distance_km: 0.0,
            speed_kmh: 0.0,
            top_speed_kmh: 0.0,
            elevation_m: START_ELEVATION_M,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RideTracker {
    state: RideState,
    stats: RideStats,
}

impl RideTracker {
    pub fn new() -> Self {
        Self {
            state: RideState::Idle,
            stats: RideStats::default(),
        }
    }

    pub fn state(&self) -> RideState {
        self.state
    }

    pub fn stats(&self) -> &RideStats {
        &self.stats
    }

    /// Begin a ride. No effect unless idle.
    pub fn start(&mut self) -> bool {
        if self.state != RideState::Idle {
            return false;
        }
        self.state = RideState::Tracking;
        info!("Ride started");
        true
    }

    pub fn toggle_pause(&mut self) -> RideState {
        self.state = match self.state {
            RideState::Tracking => RideState::Paused,
            RideState::Paused => RideState::Tracking,
            RideState::Idle => RideState::Idle,
        };
        self.state
    }

    /// End the ride and reset. Returns the final stats.
    pub fn stop(&mut self) -> RideStats {
        self.state = RideState::Idle;
        let stats = std::mem::take(&mut self.stats);
        info!(
            "Ride stopped after {} ({:.2} km, top {:.1} km/h)",
            format_elapsed(stats.elapsed_secs),
            stats.distance_km,
            stats.top_speed_kmh
        );
        stats
    }

    /// One second of riding with random samples. Only counts while tracking.
    pub fn tick(&mut self) -> bool {
        let mut rng = rand::rng();
        let distance = rng.random::<f64>() * 0.1;
        let speed = rng.random::<f64>() * 60.0;
        self.advance(distance, speed)
    }

    /// One second of riding with the given samples.
    pub fn advance(&mut self, distance_km: f64, speed_kmh: f64) -> bool {
        if self.state != RideState::Tracking {
            return false;
        }
        self.stats.elapsed_secs += 1;
        self.stats.distance_km += distance_km;
        self.stats.speed_kmh = speed_kmh;
        self.stats.top_speed_kmh = self.stats.top_speed_kmh.max(speed_kmh);
        true
    }

    /// Current readings, for tagging a photo.
    pub fn ride_data(&self) -> RideData {
        RideData {
            speed: self.stats.speed_kmh,
            elevation: self.stats.elevation_m,
        }
    }
}

impl Default for RideTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `HH:MM:SS`; hours keep counting past 99.
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Tick `tracker` every `interval` until cancelled.
pub async fn run(tracker: Arc<Mutex<RideTracker>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick of an interval fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tracker.lock().unwrap_or_else(PoisonError::into_inner).tick();
            }
        }
    }
    debug!("Ride ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0), "00:00:00");
        assert_eq!(format_elapsed(61), "00:01:01");
        assert_eq!(format_elapsed(3725), "01:02:05");
        assert_eq!(format_elapsed(360_000), "100:00:00");
    }

    #[test]
    fn ticks_only_count_while_tracking() {
        let mut tracker = RideTracker::new();
        assert!(!tracker.advance(0.05, 30.0));

        assert!(tracker.start());
        assert!(!tracker.start());
        assert!(tracker.advance(0.05, 30.0));
        assert!(tracker.advance(0.05, 20.0));
        assert_eq!(tracker.stats().elapsed_secs, 2);
        assert_eq!(tracker.stats().top_speed_kmh, 30.0);
        assert_eq!(tracker.stats().speed_kmh, 20.0);
        assert!((tracker.stats().distance_km - 0.1).abs() < 1e-9);

        assert_eq!(tracker.toggle_pause(), RideState::Paused);
        assert!(!tracker.tick());
        assert_eq!(tracker.stats().elapsed_secs, 2);
        assert_eq!(tracker.toggle_pause(), RideState::Tracking);
    }

    #[test]
    fn stop_resets() {
        let mut tracker = RideTracker::new();
        tracker.start();
        tracker.advance(0.02, 45.0);
        let done = tracker.stop();
        assert_eq!(done.elapsed_secs, 1);
        assert_eq!(tracker.state(), RideState::Idle);
        assert_eq!(tracker.stats(), &RideStats::default());
        assert_eq!(tracker.ride_data().elevation, START_ELEVATION_M);
    }

    #[test]
    fn random_samples_stay_in_range() {
        let mut tracker = RideTracker::new();
        tracker.start();
        for _ in 0..100 {
            tracker.tick();
        }
        let stats = tracker.stats();
        assert!(stats.distance_km <= 10.0);
        assert!(stats.top_speed_kmh < 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_ticks_until_cancelled() {
        let tracker = Arc::new(Mutex::new(RideTracker::new()));
        tracker.lock().unwrap().start();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(tracker.clone(), Duration::from_secs(1), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(tracker.lock().unwrap().stats().elapsed_secs, 3);
    }
}
