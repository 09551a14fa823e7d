use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Notifications a running harvest sends to whoever presents it.
#[derive(Debug, Clone, PartialEq)]
pub enum HarvestEvent {
    Progress { percent: f32, complete: usize },
    Status(String),
    BatchSaved(String),
    Finished { success: bool },
}

/// Sending half of the event channel. Events are dropped silently once the
/// receiver is gone; a harvest never fails because nobody is watching.
/// `EventSink::default()` has no receiver at all.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<HarvestEvent>>);

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<HarvestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    fn emit(&self, event: HarvestEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }

    pub fn progress(&self, complete: usize, target: usize) {
        self.emit(HarvestEvent::Progress {
            percent: percent(complete, target),
            complete,
        });
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(status = %message);
        self.emit(HarvestEvent::Status(message));
    }

    pub fn batch_saved(&self, message: impl Into<String>) {
        self.emit(HarvestEvent::BatchSaved(message.into()));
    }

    pub fn finished(&self, success: bool) {
        self.emit(HarvestEvent::Finished { success });
    }
}

fn percent(complete: usize, target: usize) -> f32 {
    if target == 0 {
        return 100.0;
    }
    (complete as f32 * 100.0 / target as f32).min(100.0)
}

/// Cooperative stop request, polled by the harvest loop between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
