//! Status notifications for deposit and transfer progress.
//!
//! Published after every persisted change on a broadcast channel. Slow or
//! absent subscribers never block the workers.

use tokio::sync::broadcast;
use tracing::trace;

use crate::deposit::DepositRecord;
use crate::job::TransferJob;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Deposit(DepositRecord),
    Transfer(TransferJob),
}

pub fn channel() -> broadcast::Sender<StatusUpdate> {
    broadcast::channel(CHANNEL_CAPACITY).0
}

pub(crate) fn publish(updates: &broadcast::Sender<StatusUpdate>, update: StatusUpdate) {
    if updates.send(update).is_err() {
        trace!("No status subscribers");
    }
}
