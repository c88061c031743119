//! Local movement engine: walks the local avatar toward a target.
//!
//! DESIGN
//! ======
//! A walk is a task ticking at a fixed interval, advancing a constant
//! distance along the straight line to the target and snapping onto it once
//! within one step. Local snapshot emission and network tracking have
//! separate throttles: local feedback stays smooth while channel traffic is
//! bounded whatever the tick rate.
//!
//! Starting a new walk aborts the previous task (last caller wins, nothing is
//! queued). A floor change teleports instead of gliding across maps.
//!
//! The engine's state is explicit: `MotionState::Idle` or
//! `MotionState::Moving`, published on a `watch` channel so observers see
//! arrivals and cancellations as transitions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};
use uuid::Uuid;

use super::transport::{PresenceService, TransportError};
use crate::config::LiveMapConfig;
use crate::model::{PlayerPatch, Point};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionState {
    Idle,
    Moving { target: Point, started_at: Instant },
}

impl MotionState {
    #[must_use]
    pub fn is_moving(&self) -> bool {
        matches!(self, Self::Moving { .. })
    }
}

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Advanced(Point),
    Arrived(Point),
}

/// Advance `from` toward `target` by `speed`. Arrives (snapping exactly onto
/// the target) when the remaining distance is within one step.
#[must_use]
pub fn step_toward(from: Point, target: Point, speed: f64) -> Step {
    let distance = from.distance_to(target);
    if distance <= speed || distance == 0.0 {
        return Step::Arrived(target);
    }
    let ratio = speed / distance;
    Step::Advanced(Point::new(from.x + (target.x - from.x) * ratio, from.y + (target.y - from.y) * ratio))
}

/// How `walk_to` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStart {
    /// Different floor: placed instantly.
    Teleported,
    /// Already within one step: snapped.
    Arrived,
    /// Animation running.
    Walking,
    /// No local player yet; the location was buffered for spawn.
    Buffered,
}

#[derive(Debug, Clone, Copy)]
struct Tuning {
    tick: Duration,
    speed: f64,
    local_emit: Duration,
    broadcast: Duration,
}

struct Walker {
    task: Option<JoinHandle<()>>,
    walk_id: u64,
}

#[derive(Clone)]
pub struct MovementEngine {
    presence: PresenceService,
    tuning: Tuning,
    walker: Arc<Mutex<Walker>>,
    motion: Arc<watch::Sender<MotionState>>,
}

impl MovementEngine {
    #[must_use]
    pub fn new(presence: PresenceService, config: &LiveMapConfig) -> Self {
        let (motion, _) = watch::channel(MotionState::Idle);
        Self {
            presence,
            tuning: Tuning {
                tick: config.walk_tick,
                speed: config.walk_speed,
                local_emit: config.local_emit_throttle,
                broadcast: config.broadcast_throttle,
            },
            walker: Arc::new(Mutex::new(Walker { task: None, walk_id: 0 })),
            motion: Arc::new(motion),
        }
    }

    fn walker(&self) -> MutexGuard<'_, Walker> {
        self.walker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> MotionState {
        *self.motion.borrow()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<MotionState> {
        self.motion.subscribe()
    }

    /// Stop any walk in progress where it stands.
    pub fn cancel(&self) {
        let mut walker = self.walker();
        walker.walk_id += 1;
        if let Some(task) = walker.task.take() {
            task.abort();
            drop(walker);
            self.presence.apply_local(&PlayerPatch {
                is_walking: Some(false),
                target: Some(None),
                ..PlayerPatch::default()
            });
            self.presence.emit_local();
            if let Err(e) = self.presence.broadcast_local() {
                warn!(error = %e, "broadcast after walk cancel failed");
            }
            self.presence.persist_location();
        }
        self.motion.send_replace(MotionState::Idle);
    }

    /// Walk the local player to (`x`, `y`). `floor_id` of `None` stays on
    /// the current floor.
    pub fn walk_to(&self, x: f64, y: f64, floor_id: Option<Uuid>) -> Result<WalkStart, TransportError> {
        let target = Point::clamped(x, y);

        let Some(local) = self.presence.local_player() else {
            self.presence.set_exact_location(target.x, target.y, floor_id)?;
            return Ok(WalkStart::Buffered);
        };

        let walk_id = {
            let mut walker = self.walker();
            if let Some(task) = walker.task.take() {
                task.abort();
            }
            walker.walk_id += 1;
            walker.walk_id
        };

        if floor_id.is_some_and(|floor| local.floor_id != Some(floor)) {
            self.motion.send_replace(MotionState::Idle);
            self.presence.set_exact_location(target.x, target.y, floor_id)?;
            return Ok(WalkStart::Teleported);
        }

        let floor = floor_id.or(local.floor_id);
        if matches!(step_toward(local.position(), target, self.tuning.speed), Step::Arrived(_)) {
            self.motion.send_replace(MotionState::Idle);
            self.presence.set_exact_location(target.x, target.y, floor)?;
            return Ok(WalkStart::Arrived);
        }

        self.presence.update_local_player(&PlayerPatch {
            is_walking: Some(true),
            target: Some(Some(target)),
            ..PlayerPatch::default()
        })?;
        self.motion
            .send_replace(MotionState::Moving { target, started_at: Instant::now() });

        let task = tokio::spawn(run_walk(self.clone(), walk_id, target));
        let mut walker = self.walker();
        if walker.walk_id == walk_id {
            walker.task = Some(task);
        } else {
            task.abort();
        }
        Ok(WalkStart::Walking)
    }

    fn finish(&self, walk_id: u64) {
        let mut walker = self.walker();
        if walker.walk_id == walk_id {
            walker.task = None;
            drop(walker);
            self.motion.send_replace(MotionState::Idle);
        }
    }
}

async fn run_walk(engine: MovementEngine, walk_id: u64, target: Point) {
    let tuning = engine.tuning;
    let presence = &engine.presence;
    let mut ticker = tokio::time::interval_at(Instant::now() + tuning.tick, tuning.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_emit = Instant::now();
    let mut last_broadcast = Instant::now();

    loop {
        ticker.tick().await;
        let Some(current) = presence.local_player() else {
            break;
        };
        match step_toward(current.position(), target, tuning.speed) {
            Step::Advanced(next) => {
                presence.apply_local(&PlayerPatch::position(next));
                let now = Instant::now();
                if now.duration_since(last_emit) >= tuning.local_emit {
                    presence.emit_local();
                    last_emit = now;
                }
                if now.duration_since(last_broadcast) >= tuning.broadcast {
                    if let Err(e) = presence.broadcast_local() {
                        trace!(error = %e, "walk broadcast skipped");
                    }
                    last_broadcast = now;
                }
            }
            Step::Arrived(point) => {
                presence.apply_local(&PlayerPatch {
                    is_walking: Some(false),
                    target: Some(None),
                    ..PlayerPatch::position(point)
                });
                presence.emit_local();
                if let Err(e) = presence.broadcast_local() {
                    warn!(error = %e, "arrival broadcast failed");
                }
                presence.persist_location();
                break;
            }
        }
    }
    engine.finish(walk_id);
}

#[cfg(test)]
#[path = "movement_test.rs"]
mod tests;
