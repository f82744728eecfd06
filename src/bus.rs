use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::debug;

use crate::{
    error::SurfacedError,
    health::Health,
    model::{EvaluationId, Grade, Phase, ThrottleStats},
};

/// Point-in-time status of one evaluation, as broadcast to subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub evaluation_id:               EvaluationId,
    pub phase:                       Phase,
    pub progress_percent:            f64,
    pub completed_count:             usize,
    pub total_target:                usize,
    pub in_flight:                   usize,
    pub throttle_stats:              ThrottleStats,
    pub estimated_time_remaining_ms: Option<u64>,
    pub grade:                       Option<Grade>,
    pub error:                       Option<SurfacedError>,
    pub health:                      Health,
    pub throttle_alert:              Option<String>,
    pub updated_at:                  DateTime<Utc>,
}

/// Receiving end of a subscription. Dropping it detaches the listener.
#[derive(Debug)]
pub struct Subscription {
    evaluation_id: EvaluationId,
    token:         u64,
    receiver:      UnboundedReceiver<StatusSnapshot>,
}

impl Subscription {
    pub fn evaluation_id(&self) -> EvaluationId {
        self.evaluation_id
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Next snapshot, or `None` once the evaluation is forgotten or the listener removed.
    pub async fn recv(&mut self) -> Option<StatusSnapshot> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusSnapshot> {
        match self.receiver.try_recv() {
            Ok(snapshot) => Some(snapshot),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    listeners: Vec<(u64, UnboundedSender<StatusSnapshot>)>,
    latest:    Option<StatusSnapshot>,
}

/// Per-evaluation fan-out of status snapshots. Evaluations never share a channel.
#[derive(Debug, Default)]
pub struct StatusBus {
    channels:   HashMap<EvaluationId, Channel>,
    next_token: u64,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener; it immediately receives the latest snapshot, if any.
    pub fn subscribe(&mut self, evaluation_id: EvaluationId) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.next_token += 1;
        let token = self.next_token;

        let channel = self.channels.entry(evaluation_id).or_default();
        if let Some(latest) = &channel.latest {
            let _ = sender.send(latest.clone());
        }
        channel.listeners.push((token, sender));
        debug!(evaluation_id = %evaluation_id, token, "bus.subscribed");

        Subscription {
            evaluation_id,
            token,
            receiver,
        }
    }

    pub fn unsubscribe(&mut self, evaluation_id: EvaluationId, token: u64) -> bool {
        let Some(channel) = self.channels.get_mut(&evaluation_id) else {
            return false;
        };
        let before = channel.listeners.len();
        channel.listeners.retain(|(existing, _)| *existing != token);
        before != channel.listeners.len()
    }

    /// Broadcast `snapshot`. Once a completed snapshot with a grade has gone out, later
    /// snapshots for the same evaluation are refused.
    pub fn publish(&mut self, snapshot: StatusSnapshot) -> bool {
        let channel = self.channels.entry(snapshot.evaluation_id).or_default();
        if let Some(latest) = &channel.latest
            && latest.phase == Phase::Completed
            && latest.grade.is_some()
        {
            debug!(evaluation_id = %snapshot.evaluation_id, "bus.publish_after_completion_ignored");
            return false;
        }

        channel
            .listeners
            .retain(|(_, sender)| sender.send(snapshot.clone()).is_ok());
        channel.latest = Some(snapshot);
        true
    }

    pub fn latest(&self, evaluation_id: EvaluationId) -> Option<&StatusSnapshot> {
        self.channels
            .get(&evaluation_id)
            .and_then(|channel| channel.latest.as_ref())
    }

    pub fn listener_count(&self, evaluation_id: EvaluationId) -> usize {
        self.channels
            .get(&evaluation_id)
            .map(|channel| channel.listeners.len())
            .unwrap_or(0)
    }

    /// Drop the channel; open subscriptions see the end of their stream.
    pub fn close(&mut self, evaluation_id: EvaluationId) {
        self.channels.remove(&evaluation_id);
    }
}
