// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The platform thread's event loop: the DRM fd for page-flip events, plus a
//! waking channel other threads use to post synthetic scanouts and shutdown.

use std::sync::Arc;
use std::time;

use crossbeam_channel as crossbeam;
use tracing::trace;

use crate::kms::KmsDevice;
use crate::Result;

const DEVICE: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// A commit completed synchronously; deliver its scanout callback on the
    /// loop thread, like a real page-flip event.
    Scanout { crtc_index: usize, timestamp_ns: u64 },
    Shutdown,
}

/// A channel sender that wakes the event loop's poll on every send.
#[derive(Clone)]
pub struct WakingSender<T> {
    waker: Arc<mio::Waker>,
    sender: crossbeam::Sender<T>,
}

impl<T> WakingSender<T> {
    pub fn new(waker: Arc<mio::Waker>, sender: crossbeam::Sender<T>) -> Self {
        Self { waker, sender }
    }

    pub fn send(&self, msg: T) -> Result<(), crossbeam::SendError<T>> {
        self.sender.send(msg)?;
        let _ = self.waker.wake();
        Ok(())
    }
}

pub struct EventLoop {
    poll: mio::Poll,
    events: mio::Events,
    rx: crossbeam::Receiver<LoopEvent>,
    sender: WakingSender<LoopEvent>,
    device: Arc<KmsDevice>,
}

impl EventLoop {
    pub fn new(device: Arc<KmsDevice>) -> Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);

        let fd = device.raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&fd),
            DEVICE,
            mio::Interest::READABLE,
        )?;

        let (tx, rx) = crossbeam::unbounded();
        let sender = WakingSender::new(waker, tx);
        device.set_loop_sender(sender.clone());

        Ok(Self {
            poll,
            events: mio::Events::with_capacity(64),
            rx,
            sender,
            device,
        })
    }

    pub fn sender(&self) -> WakingSender<LoopEvent> {
        self.sender.clone()
    }

    /// Polls once and dispatches everything ready. Returns false once a
    /// shutdown has been requested.
    pub fn dispatch(&mut self, timeout: Option<time::Duration>) -> Result<bool> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => return Ok(true),
            Err(err) => return Err(err.into()),
        }

        let mut keep_going = true;
        for event in self.events.iter() {
            match event.token() {
                DEVICE => self.device.dispatch_events()?,
                WAKER => loop {
                    match self.rx.try_recv() {
                        Ok(LoopEvent::Scanout {
                            crtc_index,
                            timestamp_ns,
                        }) => {
                            trace!(crtc_index, "synthetic scanout");
                            self.device.complete_scanout(crtc_index, timestamp_ns);
                        }
                        Ok(LoopEvent::Shutdown) => keep_going = false,
                        Err(crossbeam::TryRecvError::Empty) => break,
                        Err(crossbeam::TryRecvError::Disconnected) => {
                            keep_going = false;
                            break;
                        }
                    }
                },
                _ => unreachable!(),
            }
        }

        Ok(keep_going)
    }

    /// Runs until shutdown, then drains any outstanding page-flip events so
    /// in-flight frames settle before resources are released.
    pub fn run(&mut self) -> Result<()> {
        while self.dispatch(None)? {}

        let mut attempts = 0;
        while self.device.has_pending_scanouts() && attempts < 10 {
            self.dispatch(Some(time::Duration::from_millis(100)))?;
            attempts += 1;
        }

        Ok(())
    }
}
