//! Flush scheduling: one RTT sample, then close segments on a timer derived from it.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, select, tick, Sender};

/// Shortest period a flush timer may run at; a zero RTT would otherwise spin.
pub const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(1);

/// Round-trip time, measured once: from the INITIAL send to its first acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    begin: Option<Instant>,
    sample: Option<Duration>,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the send time of the bundle whose acknowledgement yields the sample.
    pub fn start(&mut self, now: Instant) {
        self.begin = Some(now);
    }

    /// Record an acknowledgement at `now`. Only the first one after `start` produces a sample.
    pub fn on_ack(&mut self, now: Instant) -> Option<Duration> {
        if self.sample.is_none() {
            let begin = self.begin?;
            self.sample = Some(now.saturating_duration_since(begin));
        }
        self.sample
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.sample
    }
}

/// Timing of a flush schedule: first flush after `delay`, then every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTiming {
    pub delay: Duration,
    pub period: Duration,
}

impl FlushTiming {
    /// Batch roughly one RTT of writes per segment: first flush after `factor × rtt`, then every rtt.
    pub fn from_rtt(rtt: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor >= 0.0 {
            factor
        } else {
            0.0
        };
        Self {
            delay: rtt.mul_f64(factor),
            period: rtt.max(MIN_FLUSH_PERIOD),
        }
    }
}

/// Periodic flush timer running on its own thread until cancelled or dropped.
pub struct FlushSchedule {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushSchedule {
    /// Spawn the timer. `flush` runs on the timer thread and must not wait on whoever cancels it.
    pub fn start<F>(timing: FlushTiming, mut flush: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (cancel, cancelled) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("dtn-stream-flush".into())
            .spawn(move || {
                select! {
                    recv(cancelled) -> _ => return,
                    recv(after(timing.delay)) -> _ => flush(),
                }
                let ticker = tick(timing.period);
                loop {
                    select! {
                        recv(cancelled) -> _ => return,
                        recv(ticker) -> _ => flush(),
                    }
                }
            })?;
        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    /// Stop the timer and wait for its thread. A flush already running completes first.
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // dropping the sender disconnects the channel, which wakes the timer thread
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FlushSchedule {
    fn drop(&mut self) {
        self.stop();
    }
}
