use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

#[async_trait]
pub trait TypingSink: Send + Sync {
    /// Returns `false` when the flag was dropped (e.g. while disconnected).
    async fn send_typing(&self, is_typing: bool) -> bool;
}

#[derive(Default)]
struct DebounceState {
    active: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Sender-side typing indicator.
///
/// The first keystroke emits `true`; every keystroke re-arms an idle timer
/// that emits `false` once no keystroke has been seen for `timeout`.
pub struct TypingDebouncer {
    sink: Arc<dyn TypingSink>,
    timeout: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl TypingDebouncer {
    pub fn new(sink: Arc<dyn TypingSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub async fn keystroke(&self) {
        let mut guard = self.state.lock().await;
        // A dropped `true` leaves us inactive so the next keystroke retries.
        if !guard.active {
            guard.active = self.sink.send_typing(true).await;
        }

        guard.generation += 1;
        let generation = guard.generation;
        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }

        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let timeout = self.timeout;
        guard.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut guard = state.lock().await;
            if guard.generation != generation || !guard.active {
                return;
            }
            guard.active = false;
            guard.timer = None;
            debug!("typing: idle timeout elapsed");
            sink.send_typing(false).await;
        }));
    }

    pub async fn stop(&self) {
        let mut guard = self.state.lock().await;
        guard.generation += 1;
        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }
        if guard.active {
            guard.active = false;
            self.sink.send_typing(false).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<bool>>,
        offline: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<bool> {
            self.sent.lock().expect("sink lock").clone()
        }
    }

    #[async_trait]
    impl TypingSink for RecordingSink {
        async fn send_typing(&self, is_typing: bool) -> bool {
            if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().expect("sink lock").push(is_typing);
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_true_once_then_false_after_idle() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = TypingDebouncer::new(sink.clone(), Duration::from_secs(2));

        debouncer.keystroke().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.keystroke().await;
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(sink.sent(), vec![true]);
        assert!(debouncer.is_active().await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.sent(), vec![true, false]);
        assert!(!debouncer.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_state_and_cancels_timer() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = TypingDebouncer::new(sink.clone(), Duration::from_secs(2));

        debouncer.keystroke().await;
        debouncer.stop().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.sent(), vec![true, false]);

        debouncer.stop().await;
        assert_eq!(sink.sent(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_after_reconnect_announce_typing() {
        let sink = Arc::new(RecordingSink::default());
        sink.offline.store(true, std::sync::atomic::Ordering::SeqCst);
        let debouncer = TypingDebouncer::new(sink.clone(), Duration::from_secs(2));

        debouncer.keystroke().await;
        assert!(!debouncer.is_active().await);

        sink.offline.store(false, std::sync::atomic::Ordering::SeqCst);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            debouncer.keystroke().await;
        }
        assert_eq!(sink.sent(), vec![true]);
        assert!(debouncer.is_active().await);
    }
}
