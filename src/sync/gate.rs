use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Trigger;

/// Decides when a drain should happen and posts triggers for the worker.
///
/// The gate never touches the queue or the remote itself. While offline it
/// posts nothing. The channel holds a single trigger: when it is full a drain
/// is already pending and further triggers are folded into it.
pub struct ConnectivityGate {
  online: watch::Sender<bool>,
  triggers: mpsc::Sender<Trigger>,
}

impl ConnectivityGate {
  /// Create a gate and the receiving end the sync worker consumes.
  pub fn new(initially_online: bool) -> (Self, mpsc::Receiver<Trigger>) {
    let (tx, rx) = mpsc::channel(1);
    let (online, _) = watch::channel(initially_online);

    (
      Self {
        online,
        triggers: tx,
      },
      rx,
    )
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Feed the host's connectivity signal. Going online posts a trigger.
  pub fn set_online(&self, online: bool) {
    let changed = self.online.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if !changed {
      return;
    }

    if online {
      info!("Connectivity restored");
      self.post(Trigger::BecameOnline);
    } else {
      info!("Connectivity lost, pausing sync triggers");
    }
  }

  /// Called after a mutation was durably queued.
  pub fn notify_submitted(&self) {
    if self.is_online() {
      self.post(Trigger::Submitted);
    }
  }

  /// A raw sender for stopping the worker loop from outside the gate.
  pub(crate) fn sender(&self) -> mpsc::Sender<Trigger> {
    self.triggers.clone()
  }

  fn post(&self, trigger: Trigger) {
    match self.triggers.try_send(trigger) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => debug!(?trigger, "Drain already pending"),
      Err(TrySendError::Closed(_)) => {
        debug!(?trigger, "Sync worker not running, trigger discarded")
      }
    }
  }

  /// Spawn the safety-net timer posting [`Trigger::Interval`] while online.
  pub fn spawn_ticker(&self, period: Duration) -> JoinHandle<()> {
    let online = self.online.subscribe();
    let tx = self.triggers.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let is_online = *online.borrow();
        if is_online && matches!(tx.try_send(Trigger::Interval), Err(TrySendError::Closed(_))) {
          break;
        }
      }
    })
  }
}
