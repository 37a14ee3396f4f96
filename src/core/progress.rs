//! Progress and result reporting for transfers.
//!
//! The coordinator pushes updates through a [`TransferObserver`]. Observers
//! only watch; control goes through the coordinator's cancel handle and the
//! confirmation callback.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::coordinator::{TransferOutcome, TransferState};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Progress {
    /// Completed share of the current step, `0.0..=1.0`.
    Fraction(f64),
    Indeterminate,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Fraction(fraction) => write!(f, "{:.0}%", fraction * 100.0),
            Progress::Indeterminate => write!(f, "..."),
        }
    }
}

pub trait TransferObserver: Send + Sync {
    fn on_state(&self, _state: TransferState) {}

    fn on_progress(&self, label: &str, progress: Progress);

    fn on_result(&self, outcome: &TransferOutcome);
}

/// Observer that ignores everything.
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_progress(&self, _label: &str, _progress: Progress) {}

    fn on_result(&self, _outcome: &TransferOutcome) {}
}

/// Owned form of the observer callbacks, for sending across threads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TransferEvent {
    State(TransferState),
    Progress { label: String, progress: Progress },
    Finished { state: TransferState, reason: Option<String> },
}

/// Forwards every callback into an unbounded channel.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl TransferObserver for ChannelObserver {
    fn on_state(&self, state: TransferState) {
        let _ = self.tx.send(TransferEvent::State(state));
    }

    fn on_progress(&self, label: &str, progress: Progress) {
        let _ = self.tx.send(TransferEvent::Progress {
            label: label.to_string(),
            progress,
        });
    }

    fn on_result(&self, outcome: &TransferOutcome) {
        let _ = self.tx.send(TransferEvent::Finished {
            state: outcome.state(),
            reason: outcome.reason(),
        });
    }
}
