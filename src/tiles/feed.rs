//! Visibility feed: turns viewport events into view-state commands
//!
//! Scroll snapshots are coalesced on the trailing edge of a throttle window.
//! Scale and rotation changes pass straight through; any snapshot still
//! waiting is flushed ahead of them so commands keep their trigger order.
//! Time is always passed in, so the feed needs no timer of its own.

use std::time::{Duration, Instant};

use super::state::Command;
use super::types::{Rotation, VisibilitySnapshot};

/// Default scroll coalescing window
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct VisibilityFeed {
    interval: Duration,
    pending: Option<VisibilitySnapshot>,
    deadline: Option<Instant>,
}

impl Default for VisibilityFeed {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

impl VisibilityFeed {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            deadline: None,
        }
    }

    /// Record a scroll snapshot; the latest one wins when the window closes
    pub fn push_scroll(&mut self, snapshot: VisibilitySnapshot, now: Instant) {
        self.pending = Some(snapshot);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    /// Emit the coalesced snapshot once its window has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<Command> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Immediate scale change
    pub fn scale_changed(&mut self, scale: f32) -> Vec<Command> {
        self.flush_then(Command::SetScale(scale))
    }

    /// Immediate rotation change
    pub fn rotation_changed(&mut self, rotation: Rotation) -> Vec<Command> {
        self.flush_then(Command::SetRotation(rotation))
    }

    /// Immediate invalidation of pages
    pub fn invalidated(&mut self, pages: Vec<usize>) -> Vec<Command> {
        self.flush_then(Command::Invalidate(pages))
    }

    /// When `poll` will next have something to emit
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn flush(&mut self) -> Option<Command> {
        self.deadline = None;
        self.pending.take().map(Command::UpdateVisibility)
    }

    fn flush_then(&mut self, cmd: Command) -> Vec<Command> {
        let mut commands = Vec::with_capacity(2);
        commands.extend(self.flush());
        commands.push(cmd);
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::types::{Rect, VisibilityMetric};

    fn snapshot(y: f32) -> VisibilitySnapshot {
        vec![VisibilityMetric {
            page_index: 0,
            visible_rect: Rect::new(0.0, y, 100.0, 100.0),
            scroll_position: 1,
        }]
    }

    #[test]
    fn scroll_burst_coalesces_to_latest_snapshot() {
        let start = Instant::now();
        let mut feed = VisibilityFeed::new(Duration::from_millis(50));

        feed.push_scroll(snapshot(0.0), start);
        feed.push_scroll(snapshot(10.0), start + Duration::from_millis(20));
        feed.push_scroll(snapshot(20.0), start + Duration::from_millis(40));

        assert_eq!(feed.poll(start + Duration::from_millis(49)), None);
        assert_eq!(
            feed.poll(start + Duration::from_millis(50)),
            Some(Command::UpdateVisibility(snapshot(20.0)))
        );
        assert_eq!(feed.poll(start + Duration::from_millis(200)), None);
        assert!(!feed.has_pending());
    }

    #[test]
    fn new_burst_opens_new_window() {
        let start = Instant::now();
        let mut feed = VisibilityFeed::new(Duration::from_millis(50));

        feed.push_scroll(snapshot(0.0), start);
        assert!(feed.poll(start + Duration::from_millis(60)).is_some());

        let later = start + Duration::from_millis(100);
        feed.push_scroll(snapshot(5.0), later);
        assert_eq!(feed.next_deadline(), Some(later + Duration::from_millis(50)));
    }

    #[test]
    fn scale_change_is_immediate_and_flushes_pending_scroll() {
        let start = Instant::now();
        let mut feed = VisibilityFeed::new(Duration::from_millis(50));
        feed.push_scroll(snapshot(30.0), start);

        let commands = feed.scale_changed(2.0);

        assert_eq!(
            commands,
            vec![
                Command::UpdateVisibility(snapshot(30.0)),
                Command::SetScale(2.0)
            ]
        );
        assert_eq!(feed.next_deadline(), None);
        assert_eq!(feed.poll(start + Duration::from_secs(1)), None);
    }

    #[test]
    fn rotation_change_without_pending_scroll() {
        let mut feed = VisibilityFeed::default();
        assert_eq!(
            feed.rotation_changed(Rotation::Deg90),
            vec![Command::SetRotation(Rotation::Deg90)]
        );
    }
}
