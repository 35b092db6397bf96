//! Goal-seeking motion helpers.
//!
//! Long moves are awaited by polling position on the control thread rather
//! than blocking inside the driver, so that cancellation and timeouts stay
//! observable. A device error while polling is returned as `Err`, distinct
//! from the three [`GoalOutcome`]s.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::MotionConfig;
use crate::experiment::state::CancelToken;
use crate::hardware::{Axis, Movable};

/// How a goal wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalOutcome {
    /// Axis is within tolerance and not moving
    Reached,
    /// Cancellation was requested while waiting
    Cancelled,
    /// Goal not reached before the deadline
    TimedOut,
}

/// Polling policy for [`wait_for_goal`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalWait {
    /// Maximum distance from the goal counted as reached
    pub tolerance: f64,
    /// Give up after this long
    pub timeout: Duration,
    /// Interval between position polls
    pub poll: Duration,
}

impl From<&MotionConfig> for GoalWait {
    fn from(config: &MotionConfig) -> Self {
        Self {
            tolerance: config.goal_tolerance,
            timeout: Duration::from_millis(config.goal_timeout_ms),
            poll: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

impl GoalWait {
    /// Same policy with a different timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Poll `axis` until it rests within tolerance of `goal`.
pub fn wait_for_goal<M: Movable + ?Sized>(
    device: &M,
    axis: Axis,
    goal: f64,
    wait: &GoalWait,
    cancel: &CancelToken,
) -> Result<GoalOutcome> {
    let deadline = Instant::now() + wait.timeout;
    loop {
        let position = device.position(axis)?;
        if (position - goal).abs() <= wait.tolerance && !device.is_moving(axis)? {
            return Ok(GoalOutcome::Reached);
        }
        if cancel.is_cancelled() {
            return Ok(GoalOutcome::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(%axis, goal, position, "Goal not reached before timeout");
            return Ok(GoalOutcome::TimedOut);
        }
        std::thread::sleep(wait.poll.min(deadline - now));
    }
}

/// Sleep up to `duration`, waking every `poll` to check `cancel`.
///
/// Returns `false` if cancellation cut the sleep short.
pub fn cancellable_sleep(duration: Duration, cancel: &CancelToken, poll: Duration) -> bool {
    let deadline = Instant::now() + duration;
    let poll = poll.max(Duration::from_millis(1));
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

/// Velocity used for drift relocation: the configured creep velocity, else
/// the slowest velocity the controller allows.
pub fn creep_velocity<M: Movable + ?Sized>(
    device: &M,
    axis: Axis,
    config: &MotionConfig,
) -> Result<Option<f64>> {
    if let Some(v) = config.creep_velocity {
        return Ok(Some(v));
    }
    let allowed = device.allowed_velocities(axis)?;
    Ok(allowed
        .into_iter()
        .filter(|v| v.is_finite() && *v > 0.0)
        .reduce(f64::min))
}

/// Time to cover `distance` at `velocity`, `None` when that is not a finite
/// duration.
pub fn travel_time(distance: f64, velocity: f64) -> Option<Duration> {
    if velocity.is_nan() || velocity <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(distance.abs() / velocity).ok()
}

/// Move `axis` through `targets` at `velocity`, restoring the previous
/// velocity whatever the outcome.
///
/// Each leg may take `wait.timeout` plus its travel time at the velocity in
/// effect.
pub fn move_at_velocity<M: Movable + ?Sized>(
    device: &M,
    axis: Axis,
    targets: &[f64],
    velocity: Option<f64>,
    wait: &GoalWait,
    cancel: &CancelToken,
) -> Result<GoalOutcome> {
    let start = device.position(axis)?;
    let (previous, effective) = match velocity {
        Some(v) => {
            let previous = device.velocity(axis)?;
            device.set_velocity(axis, v)?;
            (Some(previous), Some(v))
        }
        // Unknown velocity gives no travel allowance.
        None => (None, device.velocity(axis).ok()),
    };

    let mut from = start;
    let outcome = targets.iter().try_fold(GoalOutcome::Reached, |outcome, &target| {
        if outcome != GoalOutcome::Reached {
            return Ok(outcome);
        }
        let travel = effective
            .and_then(|v| travel_time(target - from, v))
            .unwrap_or_default();
        let leg = wait.with_timeout(wait.timeout.saturating_add(travel));
        from = target;
        device.move_abs(axis, target)?;
        wait_for_goal(device, axis, target, &leg, cancel)
    });

    if let Some(previous) = previous {
        if let Err(e) = device.set_velocity(axis, previous) {
            warn!(%axis, error = %e, "Failed to restore axis velocity");
            // Motion errors take precedence over the restore failure.
            outcome?;
            return Err(e);
        }
    }
    outcome
}

/// Relocate `axis` from wherever it is to `base + offset` at creep velocity,
/// passing through the `base + factor·offset` waypoint first.
pub fn creep_relocate<M: Movable + ?Sized>(
    device: &M,
    axis: Axis,
    base: f64,
    offset: f64,
    config: &MotionConfig,
    cancel: &CancelToken,
) -> Result<GoalOutcome> {
    let target = base + offset;
    if offset == 0.0 {
        device.move_abs(axis, target)?;
        device.wait_settled(axis)?;
        return Ok(GoalOutcome::Reached);
    }
    let waypoint = base + config.waypoint_factor * offset;
    let velocity = creep_velocity(device, axis, config)?;
    debug!(%axis, base, offset, waypoint, ?velocity, "Creep relocation");
    let outcome = move_at_velocity(
        device,
        axis,
        &[waypoint, target],
        velocity,
        &GoalWait::from(config),
        cancel,
    )?;
    if outcome == GoalOutcome::Reached {
        info!(%axis, target, "Drift correction applied");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockMicroscope;

    fn fast_wait() -> GoalWait {
        GoalWait {
            tolerance: 1e-9,
            timeout: Duration::from_secs(2),
            poll: Duration::from_millis(1),
        }
    }

    #[test]
    fn goal_reached_after_motion() {
        let scope = MockMicroscope::new(4, 4).with_velocity(1000.0);
        scope.move_abs(Axis::Z, 10.0).unwrap();
        let outcome =
            wait_for_goal(&scope, Axis::Z, 10.0, &fast_wait(), &CancelToken::new()).unwrap();
        assert_eq!(outcome, GoalOutcome::Reached);
    }

    #[test]
    fn goal_wait_distinguishes_timeout_and_cancel() {
        let scope = MockMicroscope::new(4, 4).with_velocity(1.0);
        scope.move_abs(Axis::Z, 100.0).unwrap();
        let short = fast_wait().with_timeout(Duration::from_millis(20));
        assert_eq!(
            wait_for_goal(&scope, Axis::Z, 100.0, &short, &CancelToken::new()).unwrap(),
            GoalOutcome::TimedOut
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            wait_for_goal(&scope, Axis::Z, 100.0, &fast_wait(), &cancel).unwrap(),
            GoalOutcome::Cancelled
        );
    }

    #[test]
    fn sleep_is_cut_short_by_cancel() {
        let cancel = CancelToken::new();
        assert!(cancellable_sleep(
            Duration::from_millis(5),
            &cancel,
            Duration::from_millis(1)
        ));
        cancel.cancel();
        let start = Instant::now();
        assert!(!cancellable_sleep(
            Duration::from_secs(10),
            &cancel,
            Duration::from_millis(1)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn creep_uses_waypoint_and_restores_velocity() {
        let scope = MockMicroscope::new(4, 4)
            .with_velocity(1.0e6)
            .with_allowed_velocities(vec![1.0e6, 500.0, 2000.0]);
        let config = MotionConfig {
            goal_tolerance: 1e-9,
            poll_interval_ms: 1,
            ..Default::default()
        };
        let outcome =
            creep_relocate(&scope, Axis::X, 10.0, 2.0, &config, &CancelToken::new()).unwrap();
        assert_eq!(outcome, GoalOutcome::Reached);

        let moves = scope.moves();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].target, 13.0);
        assert_eq!(moves[1].target, 12.0);
        assert!(moves.iter().all(|m| m.velocity == 500.0));
        assert_eq!(scope.velocity(Axis::X).unwrap(), 1.0e6);
    }

    #[test]
    fn slow_creep_over_a_long_distance_is_given_its_travel_time() {
        // 40 units at 100 units/s needs ~0.4 s per leg; the base timeout is 50 ms.
        let scope = MockMicroscope::new(4, 4)
            .with_velocity(1.0e6)
            .with_allowed_velocities(vec![100.0, 1.0e6]);
        let config = MotionConfig {
            goal_tolerance: 1e-9,
            goal_timeout_ms: 50,
            poll_interval_ms: 1,
            ..Default::default()
        };
        assert_eq!(config.creep_velocity, None);

        let outcome =
            creep_relocate(&scope, Axis::X, 40.0, 2.0, &config, &CancelToken::new()).unwrap();
        assert_eq!(outcome, GoalOutcome::Reached);
        assert_eq!(scope.position(Axis::X).unwrap(), 42.0);
        let moves = scope.moves();
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.velocity == 100.0));
    }

    #[test]
    fn travel_time_needs_a_positive_finite_velocity() {
        assert_eq!(travel_time(-30.0, 10.0), Some(Duration::from_secs(3)));
        assert_eq!(travel_time(1.0, 0.0), None);
        assert_eq!(travel_time(1.0, f64::NAN), None);
        assert_eq!(travel_time(1.0e-300, 1.0e-300), Some(Duration::from_secs(1)));
        assert_eq!(travel_time(f64::MAX, 1.0e-300), None);
    }

    #[test]
    fn velocity_restored_after_fault() {
        let scope = MockMicroscope::new(4, 4).fail_moves_on(Axis::Y);
        let config = MotionConfig {
            creep_velocity: Some(10.0),
            ..Default::default()
        };
        let before = scope.velocity(Axis::Y).unwrap();
        assert!(creep_relocate(&scope, Axis::Y, 0.0, 1.0, &config, &CancelToken::new()).is_err());
        assert_eq!(scope.velocity(Axis::Y).unwrap(), before);
    }
}
