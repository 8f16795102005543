//! Playback control
//!
//! The host drives a running macro through a [`PlaybackControl`]: pause,
//! resume and stop. The engine consults it before each command dispatch
//! and while waiting between retries. `Stop` is sticky; once sent, pause
//! and resume requests are ignored.

use std::sync::Arc;

use tokio::sync::watch;

/// Requested playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Run,
    Pause,
    Stop,
}

/// Cloneable handle shared between the host and the engine
#[derive(Debug, Clone)]
pub struct PlaybackControl {
    tx: Arc<watch::Sender<Signal>>,
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Signal::Run);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> Signal {
        *self.tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.signal() == Signal::Stop
    }

    pub fn pause(&self) {
        self.request(Signal::Pause);
    }

    pub fn resume(&self) {
        self.request(Signal::Run);
    }

    pub fn stop(&self) {
        self.request(Signal::Stop);
    }

    /// Receiver that observes every signal change.
    pub fn subscribe(&self) -> watch::Receiver<Signal> {
        self.tx.subscribe()
    }

    fn request(&self, signal: Signal) {
        self.tx.send_if_modified(|current| {
            if *current == Signal::Stop || *current == signal {
                return false;
            }
            *current = signal;
            true
        });
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow_and_update() == Signal::Stop {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone: nobody can ask for a stop any more
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wait out a pause. Returns `Signal::Run` to continue or
    /// `Signal::Stop` if the run was stopped while paused.
    pub async fn wait_while_paused(&self) -> Signal {
        let mut rx = self.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != Signal::Pause {
                return current;
            }
            if rx.changed().await.is_err() {
                return Signal::Stop;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_is_sticky() {
        let ctl = PlaybackControl::new();
        ctl.pause();
        assert_eq!(ctl.signal(), Signal::Pause);
        ctl.stop();
        ctl.resume();
        assert_eq!(ctl.signal(), Signal::Stop);
        assert!(ctl.is_stopped());
    }

    #[tokio::test]
    async fn test_resume_releases_pause() {
        let ctl = PlaybackControl::new();
        ctl.pause();
        let host = ctl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            host.resume();
        });
        assert_eq!(ctl.wait_while_paused().await, Signal::Run);
    }

    #[tokio::test]
    async fn test_stop_releases_pause() {
        let ctl = PlaybackControl::new();
        ctl.pause();
        let host = ctl.clone();
        tokio::spawn(async move { host.stop() });
        assert_eq!(ctl.wait_while_paused().await, Signal::Stop);
        // already stopped: resolves immediately
        ctl.stopped().await;
    }
}
