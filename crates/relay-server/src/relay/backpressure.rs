//! Frame admission and throughput accounting.
//!
//! Each directed link carries an atomic pending counter. A frame is
//! admitted while `pending <= max_pending` and dropped otherwise; the
//! decision never waits. Admitted frames hold a [`FramePermit`]; dropping it
//! once the transport has written the frame is the release.
//!
//! Per-link counters are discarded when their connection goes away, but the
//! process-wide totals only ever grow.

use relay_core::{unix_millis, ConnectionId, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::warn;

/// Travel direction of a frame across a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ControllerToTarget,
    TargetToController,
}

impl Direction {
    /// Direction of frames sent by a connection holding `role`.
    pub fn from_sender(role: Role) -> Self {
        match role {
            Role::Controller => Direction::ControllerToTarget,
            _ => Direction::TargetToController,
        }
    }
}

/// A directed channel subject to admission control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkKey {
    /// Frames travelling on a resolved session.
    Session {
        session_id: String,
        direction: Direction,
    },
    /// Frames broadcast by a sender with no resolvable session.
    Connection {
        role: Role,
        connection_id: ConnectionId,
    },
}

impl LinkKey {
    /// Whether this link belongs to `connection_id` or one of `session_ids`.
    fn belongs_to(&self, connection_id: ConnectionId, session_ids: &[String]) -> bool {
        match self {
            LinkKey::Session { session_id, .. } => session_ids.contains(session_id),
            LinkKey::Connection {
                connection_id: id, ..
            } => *id == connection_id,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug)]
pub enum Admission {
    /// Holds the pending slot until dropped.
    Admitted(FramePermit),
    Dropped,
}

impl Admission {
    #[cfg(test)]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Live counters for one link.
#[derive(Debug, Default)]
pub struct LinkStats {
    pending: AtomicUsize,
    frames_processed: AtomicU64,
    total_bytes: AtomicU64,
    dropped: AtomicU64,
    last_frame_at: AtomicU64,
}

impl LinkStats {
    /// Give back one pending slot. Saturates at zero.
    fn release(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
    }

    fn snapshot(&self) -> LinkSnapshot {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let bytes = self.total_bytes.load(Ordering::Relaxed);
        LinkSnapshot {
            pending: self.pending.load(Ordering::Relaxed),
            frames_processed: frames,
            total_bytes: bytes,
            dropped: self.dropped.load(Ordering::Relaxed),
            last_frame_at: self.last_frame_at.load(Ordering::Relaxed),
            average_frame_size: average(bytes, frames),
        }
    }
}

/// Point-in-time copy of a link's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub pending: usize,
    pub frames_processed: u64,
    pub total_bytes: u64,
    pub dropped: u64,
    /// Unix milliseconds of the last admitted frame, 0 if none.
    pub last_frame_at: u64,
    pub average_frame_size: f64,
}

/// Process-wide traffic totals.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficTotals {
    pub uptime_secs: f64,
    pub frames_processed: u64,
    pub total_bytes: u64,
    pub frames_dropped: u64,
    pub frames_per_second: f64,
    pub average_frame_size: f64,
}

/// RAII permit for one admitted frame.
///
/// Dropping the permit is the release: it gives back the link's pending
/// slot. The writer drops it after the frame is flushed, or the router drops
/// it at once when no recipient queue took the frame. Owns an
/// `Arc<LinkStats>` so it is `Send` and stays valid after the link's
/// accounting is discarded.
#[derive(Debug)]
pub struct FramePermit {
    stats: Arc<LinkStats>,
}

impl Drop for FramePermit {
    fn drop(&mut self) {
        self.stats.release();
    }
}

/// Bounds outstanding frames per link and keeps throughput statistics.
pub struct BackpressureController {
    max_pending: usize,
    /// Emit one diagnostic per this many drops on a link.
    drop_log_every: u64,
    links: RwLock<HashMap<LinkKey, Arc<LinkStats>>>,
    frames_processed: AtomicU64,
    total_bytes: AtomicU64,
    frames_dropped: AtomicU64,
    started_at: Instant,
}

impl BackpressureController {
    /// Create a controller allowing `max_pending` outstanding frames per link
    /// before it starts dropping.
    pub fn new(max_pending: usize, drop_log_every: u64) -> Self {
        Self {
            max_pending,
            drop_log_every: drop_log_every.max(1),
            links: RwLock::new(HashMap::new()),
            frames_processed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    async fn link_stats(&self, key: &LinkKey) -> Arc<LinkStats> {
        if let Some(stats) = self.links.read().await.get(key) {
            return stats.clone();
        }
        self.links
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Decide whether a frame of `size` bytes may be forwarded on `key`.
    pub async fn admit(&self, key: &LinkKey, size: usize) -> Admission {
        let stats = self.link_stats(key).await;
        let max = self.max_pending;

        let reserved = stats
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                if p > max {
                    None
                } else {
                    Some(p + 1)
                }
            });

        match reserved {
            Ok(_) => {
                let now = unix_millis();
                stats.frames_processed.fetch_add(1, Ordering::Relaxed);
                stats.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
                stats.last_frame_at.store(now, Ordering::Relaxed);
                self.frames_processed.fetch_add(1, Ordering::Relaxed);
                self.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
                Admission::Admitted(FramePermit { stats })
            }
            Err(_) => {
                let dropped = stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if dropped % self.drop_log_every == 0 {
                    let link = stats.snapshot();
                    warn!(
                        link = ?key,
                        pending = link.pending,
                        dropped = link.dropped,
                        processed = link.frames_processed,
                        "consumer behind, dropping frames"
                    );
                }
                Admission::Dropped
            }
        }
    }

    /// Like [`admit`](Self::admit), yielding the permit directly.
    pub async fn admit_with_permit(&self, key: &LinkKey, size: usize) -> Option<FramePermit> {
        match self.admit(key, size).await {
            Admission::Admitted(permit) => Some(permit),
            Admission::Dropped => None,
        }
    }

    /// Forget the per-link accounting of a departed connection.
    ///
    /// Process totals are left untouched.
    pub async fn discard_connection(&self, connection_id: ConnectionId, session_ids: &[String]) {
        self.links
            .write()
            .await
            .retain(|key, _| !key.belongs_to(connection_id, session_ids));
    }

    /// Snapshot a single link.
    #[cfg(test)]
    pub async fn link(&self, key: &LinkKey) -> Option<LinkSnapshot> {
        self.links.read().await.get(key).map(|s| s.snapshot())
    }

    /// Process-wide totals since start.
    pub fn totals(&self) -> TrafficTotals {
        let uptime_secs = self.started_at.elapsed().as_secs_f64();
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let bytes = self.total_bytes.load(Ordering::Relaxed);
        TrafficTotals {
            uptime_secs,
            frames_processed: frames,
            total_bytes: bytes,
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_per_second: if uptime_secs > 0.0 {
                frames as f64 / uptime_secs
            } else {
                0.0
            },
            average_frame_size: average(bytes, frames),
        }
    }
}

fn average(bytes: u64, frames: u64) -> f64 {
    if frames == 0 {
        0.0
    } else {
        bytes as f64 / frames as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts `WARN` events seen on this thread.
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn session_link(id: &str) -> LinkKey {
        LinkKey::Session {
            session_id: id.to_string(),
            direction: Direction::TargetToController,
        }
    }

    #[tokio::test]
    async fn burst_admits_max_pending_plus_one() {
        let bp = BackpressureController::new(5, 10);
        let key = session_link("s1");

        let mut held = Vec::new();
        let mut dropped = 0u64;
        for i in 0..100 {
            match bp.admit(&key, 1000).await {
                Admission::Admitted(permit) => {
                    assert!(i < 6, "frame {} admitted past the bound", i + 1);
                    held.push(permit);
                }
                Admission::Dropped => {
                    assert!(i >= 6, "frame {} dropped too early", i + 1);
                    dropped += 1;
                }
            }
        }

        let link = bp.link(&key).await.unwrap();
        assert_eq!(held.len(), 6);
        assert_eq!(link.pending, 6);
        assert_eq!(link.frames_processed, 6);
        assert_eq!(link.dropped, dropped);
        assert_eq!(link.dropped, 100 - held.len() as u64);
        assert_eq!(link.total_bytes, 6000);
        assert_eq!(link.average_frame_size, 1000.0);
        assert!(link.last_frame_at > 0);

        let totals = bp.totals();
        assert_eq!(totals.frames_processed, 6);
        assert_eq!(totals.frames_dropped, 94);
    }

    #[tokio::test]
    async fn dropping_permit_frees_a_slot() {
        let bp = BackpressureController::new(0, 10);
        let key = session_link("s1");

        let permit = bp.admit_with_permit(&key, 10).await.unwrap();
        assert!(bp.admit_with_permit(&key, 10).await.is_none());

        drop(permit);
        assert_eq!(bp.link(&key).await.unwrap().pending, 0);
        assert!(bp.admit(&key, 10).await.is_admitted());
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let bp = BackpressureController::new(0, 10);
        let key = session_link("s1");

        let permit = bp.admit_with_permit(&key, 10).await.unwrap();
        let stats = permit.stats.clone();
        drop(permit);
        stats.release();
        assert_eq!(bp.link(&key).await.unwrap().pending, 0);
        assert!(bp.admit(&key, 10).await.is_admitted());
    }

    #[tokio::test]
    async fn drop_warning_is_sampled() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let bp = BackpressureController::new(0, 10);
        let key = session_link("s1");
        let _held = bp.admit_with_permit(&key, 1).await.unwrap();
        for _ in 0..25 {
            assert!(!bp.admit(&key, 1).await.is_admitted());
        }

        assert_eq!(bp.link(&key).await.unwrap().dropped, 25);
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn links_are_independent() {
        let bp = BackpressureController::new(0, 10);
        let a = session_link("a");
        let b = LinkKey::Connection {
            role: Role::Target,
            connection_id: 7,
        };

        let _held = bp.admit_with_permit(&a, 1).await.unwrap();
        assert!(bp.admit_with_permit(&a, 1).await.is_none());
        assert!(bp.admit_with_permit(&b, 1).await.is_some());
    }

    #[tokio::test]
    async fn discard_keeps_process_totals() {
        let bp = BackpressureController::new(5, 10);
        let session = session_link("s1");
        let broadcast = LinkKey::Connection {
            role: Role::Target,
            connection_id: 3,
        };
        let other = LinkKey::Connection {
            role: Role::Target,
            connection_id: 4,
        };
        for key in [&session, &broadcast, &other] {
            drop(bp.admit(key, 200).await);
        }

        bp.discard_connection(3, &["s1".to_string()]).await;
        assert!(bp.link(&session).await.is_none());
        assert!(bp.link(&broadcast).await.is_none());
        assert!(bp.link(&other).await.is_some());

        let totals = bp.totals();
        assert_eq!(totals.frames_processed, 3);
        assert_eq!(totals.total_bytes, 600);
        assert_eq!(totals.average_frame_size, 200.0);
    }

    #[tokio::test]
    async fn permit_outlives_discarded_link() {
        let bp = BackpressureController::new(5, 10);
        let key = session_link("s1");
        let permit = bp.admit_with_permit(&key, 1).await.unwrap();
        bp.discard_connection(1, &["s1".to_string()]).await;
        drop(permit);

        // A fresh link starts from zero.
        assert!(bp.admit(&key, 1).await.is_admitted());
        assert_eq!(bp.link(&key).await.unwrap().frames_processed, 1);
    }

    #[tokio::test]
    async fn concurrent_admission_respects_bound() {
        let bp = Arc::new(BackpressureController::new(5, 10));
        let key = session_link("s1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bp = bp.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let mut held = Vec::new();
                for _ in 0..25 {
                    if let Some(permit) = bp.admit_with_permit(&key, 1).await {
                        held.push(permit);
                    }
                }
                held
            }));
        }

        let mut admitted = 0;
        let mut permits = Vec::new();
        for handle in handles {
            let held = handle.await.unwrap();
            admitted += held.len();
            permits.push(held);
        }

        let link = bp.link(&key).await.unwrap();
        assert_eq!(admitted, 6);
        assert_eq!(link.dropped, 200 - 6);
    }

    #[test]
    fn direction_follows_sender_role() {
        assert_eq!(
            Direction::from_sender(Role::Controller),
            Direction::ControllerToTarget
        );
        assert_eq!(
            Direction::from_sender(Role::Target),
            Direction::TargetToController
        );
    }
}
