// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Frame pacing. The engine requests its vsync baton; we answer according to
//! the present mode. Double-buffered answers one request per scanout event;
//! triple-buffered answers at commit, handing the engine the baton a frame
//! early so it can render while the previous frame is still scanning out.
//!
//! Requests are answered in enqueue order. There's no cancellation and no
//! timeout: if the driver stops producing page-flip events, the queue stalls
//! by design.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::kms::monotonic_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    DoubleBufferedVsync,
    TripleBufferedVsync,
}

/// Answered with the frame's start and target time, in nanoseconds.
pub type FrameCallback = Box<dyn FnOnce(u64, u64) + Send>;

enum FrameRequest {
    Pending(FrameCallback),
    /// Answered, but still occupying its slot until the next dequeue.
    Fired,
}

pub struct FrameScheduler {
    mode: PresentMode,
    refresh_period_ns: AtomicU64,
    queue: Mutex<VecDeque<FrameRequest>>,
}

impl FrameScheduler {
    pub fn new(mode: PresentMode) -> Self {
        Self {
            mode,
            // Updated once the output mode is selected.
            refresh_period_ns: AtomicU64::new(16_666_667),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn mode(&self) -> PresentMode {
        self.mode
    }

    pub fn set_refresh_period_ns(&self, period: u64) {
        self.refresh_period_ns.store(period.max(1), Ordering::Relaxed);
    }

    pub fn refresh_period_ns(&self) -> u64 {
        self.refresh_period_ns.load(Ordering::Relaxed)
    }

    /// Queues a frame request from the engine. An engine with no frame in
    /// flight is free-running and gets its baton back immediately; otherwise
    /// the request waits its turn.
    pub fn request_frame(&self, callback: FrameCallback) {
        let fire_now = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                queue.push_back(FrameRequest::Fired);
                Some(callback)
            } else {
                queue.push_back(FrameRequest::Pending(callback));
                None
            }
        };

        if let Some(callback) = fire_now {
            let now = monotonic_ns();
            trace!("answering frame request immediately");
            callback(now, now + self.refresh_period_ns());
        }
    }

    /// A commit was submitted. In triple-buffered mode this answers the next
    /// request; the committed frame's output is guaranteed in flight, so the
    /// engine can start on the one after.
    pub fn on_commit(&self) {
        if self.mode == PresentMode::TripleBufferedVsync {
            self.advance(monotonic_ns());
        }
    }

    /// A frame hit the screen. In double-buffered mode this answers the next
    /// request; in triple-buffered mode the queue was already advanced at
    /// commit time.
    pub fn on_scanout(&self, vblank_ns: u64) {
        if self.mode == PresentMode::DoubleBufferedVsync {
            self.advance(vblank_ns);
        }
    }

    fn advance(&self, timestamp_ns: u64) {
        let next = {
            let mut queue = self.queue.lock();
            if queue.pop_front().is_none() {
                trace!("scanout with an empty frame queue");
                return;
            }

            match queue.front_mut() {
                Some(head) => match std::mem::replace(head, FrameRequest::Fired) {
                    FrameRequest::Pending(callback) => Some(callback),
                    FrameRequest::Fired => None,
                },
                None => None,
            }
        };

        if let Some(callback) = next {
            callback(timestamp_ns, timestamp_ns + self.refresh_period_ns());
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;

    fn recording_callback(log: &Arc<StdMutex<Vec<usize>>>, id: usize) -> FrameCallback {
        let log = log.clone();
        Box::new(move |_, _| log.lock().unwrap().push(id))
    }

    #[test]
    fn test_first_request_fires_immediately() {
        let scheduler = FrameScheduler::new(PresentMode::DoubleBufferedVsync);
        let log = Arc::new(StdMutex::new(Vec::new()));

        scheduler.request_frame(recording_callback(&log, 0));
        assert_eq!(*log.lock().unwrap(), [0]);
        // It still occupies the queue until scanout.
        assert_eq!(scheduler.pending_requests(), 1);
    }

    #[test]
    fn test_double_buffered_fires_once_per_scanout() {
        let scheduler = FrameScheduler::new(PresentMode::DoubleBufferedVsync);
        let log = Arc::new(StdMutex::new(Vec::new()));

        scheduler.request_frame(recording_callback(&log, 0));
        scheduler.request_frame(recording_callback(&log, 1));
        scheduler.request_frame(recording_callback(&log, 2));
        assert_eq!(*log.lock().unwrap(), [0]);

        // Commits don't answer anything in this mode.
        scheduler.on_commit();
        assert_eq!(*log.lock().unwrap(), [0]);

        scheduler.on_scanout(1_000);
        assert_eq!(*log.lock().unwrap(), [0, 1]);

        scheduler.on_scanout(2_000);
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);

        // The last scanout empties the queue; further scanouts are no-ops.
        scheduler.on_scanout(3_000);
        scheduler.on_scanout(4_000);
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
        assert_eq!(scheduler.pending_requests(), 0);
    }

    #[test]
    fn test_triple_buffered_fires_once_per_commit() {
        let scheduler = FrameScheduler::new(PresentMode::TripleBufferedVsync);
        let log = Arc::new(StdMutex::new(Vec::new()));

        scheduler.request_frame(recording_callback(&log, 0));
        scheduler.request_frame(recording_callback(&log, 1));
        scheduler.request_frame(recording_callback(&log, 2));
        assert_eq!(*log.lock().unwrap(), [0]);

        // Scanout events drain nothing in this mode.
        scheduler.on_scanout(1_000);
        assert_eq!(*log.lock().unwrap(), [0]);

        scheduler.on_commit();
        assert_eq!(*log.lock().unwrap(), [0, 1]);

        scheduler.on_commit();
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn test_requests_answered_in_order() {
        let scheduler = FrameScheduler::new(PresentMode::DoubleBufferedVsync);
        let log = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..5 {
            scheduler.request_frame(recording_callback(&log, i));
        }

        for t in 1..5u64 {
            scheduler.on_scanout(t * 1_000);
        }

        assert_eq!(*log.lock().unwrap(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_timestamps_span_one_refresh_period() {
        let scheduler = FrameScheduler::new(PresentMode::DoubleBufferedVsync);
        scheduler.set_refresh_period_ns(10_000);

        let spans = Arc::new(StdMutex::new(Vec::new()));
        let spans_ = spans.clone();
        scheduler.request_frame(Box::new(move |start, end| {
            spans_.lock().unwrap().push(end - start);
        }));

        let spans_ = spans.clone();
        scheduler.request_frame(Box::new(move |start, end| {
            spans_.lock().unwrap().push(end - start);
        }));

        scheduler.on_scanout(123_456);
        assert_eq!(*spans.lock().unwrap(), [10_000, 10_000]);
    }
}
