//! Streaming pull: a long-lived session joined to a worker task by two
//! bounded queues.
//!
//! Inbound requests (acks, deadline changes, close) flow from the client
//! handle to the worker; outbound events (message batches, confirmations,
//! the final close) flow back. The worker only schedules a batch after it
//! has reserved a slot in the outbound queue, so a client that stops reading
//! stops receiving leases.
//!
//! Confirmations never block the worker: while the outbound queue is full
//! they wait in a local backlog, where consecutive confirmations of the same
//! kind are merged, and inbound requests keep being drained.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ack::{self, AckConfirmation};
use crate::ack_id::AckId;
use crate::clock::duration_ns;
use crate::context::SubscriptionContext;
use crate::message::ReceivedMessage;
use crate::scheduler::BatchLimits;
use crate::session::{close_session, CloseReason, FlowControl, SessionId, SessionShared};
use crate::subscription::validate_ack_deadline;
use crate::{Error, Result};

/// First message on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPullRequest {
    pub subscription: String,
    pub client_id: String,
    pub stream_ack_deadline_seconds: u32,
    /// Falls back to the broker's session defaults when absent.
    pub flow_control: Option<FlowControl>,
}

impl StreamingPullRequest {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            client_id: String::new(),
            stream_ack_deadline_seconds: 10,
            flow_control: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_stream_ack_deadline(mut self, seconds: u32) -> Self {
        self.stream_ack_deadline_seconds = seconds;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    pub(crate) fn stream_ack_deadline(&self) -> Result<Duration> {
        let deadline = Duration::from_secs(u64::from(self.stream_ack_deadline_seconds));
        validate_ack_deadline(deadline)?;
        Ok(deadline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    Acknowledge(Vec<AckId>),
    ModifyAckDeadline { ack_ids: Vec<AckId>, seconds: i64 },
    /// Deadline for leases granted from now on.
    SetStreamAckDeadline(u32),
    Close,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Messages(Vec<ReceivedMessage>),
    AckConfirmation(AckConfirmation),
    ModifyAckDeadlineConfirmation(AckConfirmation),
    /// A request was rejected; the stream stays open.
    InvalidRequest(String),
    /// Always the last event on a stream.
    Closed(CloseReason),
}

/// Subscription settings reported when a stream opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionProperties {
    pub exactly_once_enabled: bool,
    pub ordering_enabled: bool,
}

/// Client end of a streaming pull.
pub struct StreamingPull {
    session: Arc<SessionShared>,
    properties: SubscriptionProperties,
    requests: mpsc::Sender<StreamRequest>,
    events: mpsc::Receiver<StreamEvent>,
    worker: JoinHandle<()>,
}

impl StreamingPull {
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<SessionShared> {
        &self.session
    }

    pub fn properties(&self) -> SubscriptionProperties {
        self.properties
    }

    pub async fn send(&self, request: StreamRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::SessionClosed(self.session.id()))
    }

    pub async fn acknowledge(&self, ack_ids: Vec<AckId>) -> Result<()> {
        self.send(StreamRequest::Acknowledge(ack_ids)).await
    }

    pub async fn modify_ack_deadline(&self, ack_ids: Vec<AckId>, seconds: i64) -> Result<()> {
        self.send(StreamRequest::ModifyAckDeadline { ack_ids, seconds })
            .await
    }

    /// Next event, or `None` once the worker has exited and the queue drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Next batch of messages, skipping confirmations. `None` if the stream
    /// closed first.
    pub async fn next_messages(&mut self) -> Option<Vec<ReceivedMessage>> {
        loop {
            match self.events.recv().await? {
                StreamEvent::Messages(batch) => return Some(batch),
                StreamEvent::Closed(_) => return None,
                _ => {}
            }
        }
    }

    /// Closes the stream and waits for the worker to release its leases.
    /// Pending events are drained and discarded.
    pub async fn close(mut self) -> Option<CloseReason> {
        let close = self.requests.send(StreamRequest::Close);
        tokio::pin!(close);
        let mut sent = false;
        let mut reason = None;
        loop {
            tokio::select! {
                _ = &mut close, if !sent => sent = true,
                event = self.events.recv() => match event {
                    Some(StreamEvent::Closed(r)) => reason = Some(r),
                    Some(_) => {}
                    None => break,
                },
            }
        }
        let _ = self.worker.await;
        reason
    }

    /// Drops both queues without a close request, as a broken connection would.
    pub async fn disconnect(self) {
        let StreamingPull {
            requests,
            events,
            worker,
            ..
        } = self;
        drop(requests);
        drop(events);
        let _ = worker.await;
    }
}

pub(crate) fn open(
    ctx: Arc<SubscriptionContext>,
    request: StreamingPullRequest,
) -> Result<StreamingPull> {
    ctx.ensure_live()?;
    let deadline = request.stream_ack_deadline()?;
    let settings = &ctx.config().session;
    let limits = request.flow_control.unwrap_or_else(|| {
        FlowControl::new(
            settings.default_max_outstanding_messages,
            settings.default_max_outstanding_bytes,
        )
    });
    limits.validate()?;

    let (request_tx, request_rx) = mpsc::channel(settings.inbound_queue_capacity);
    let (event_tx, event_rx) = mpsc::channel(settings.outbound_queue_capacity);

    let sub = ctx.subscription();
    let properties = SubscriptionProperties {
        exactly_once_enabled: sub.exactly_once_enabled,
        ordering_enabled: sub.ordering_enabled,
    };
    let session = ctx
        .sessions()
        .open(request.client_id, sub.name, limits, deadline, ctx.now());
    info!(
        "session {} ({}) opened on {}",
        session.id(),
        session.client_id(),
        session.subscription()
    );

    let worker = tokio::spawn(run_session(
        ctx,
        Arc::clone(&session),
        request_rx,
        event_tx,
    ));
    Ok(StreamingPull {
        session,
        properties,
        requests: request_tx,
        events: event_rx,
        worker,
    })
}

async fn run_session(
    ctx: Arc<SubscriptionContext>,
    session: Arc<SessionShared>,
    mut inbound: mpsc::Receiver<StreamRequest>,
    outbound: mpsc::Sender<StreamEvent>,
) {
    let settings = ctx.config().session.clone();
    let idle_timeout_ns = duration_ns(settings.idle_timeout());
    let mut tick = tokio::time::interval(settings.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let backlog_limit = settings.inbound_queue_capacity.max(1);
    let mut backlog = VecDeque::new();

    let reason = loop {
        if !session.is_alive() {
            break session.close_reason().unwrap_or(CloseReason::BrokerShutdown);
        }
        if ctx.is_deleted() {
            break CloseReason::SubscriptionDeleted;
        }

        let notified = ctx.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Err(reason) = flush_backlog(&mut backlog, &outbound) {
            break reason;
        }
        // Confirmations go out ahead of new leases.
        if backlog.is_empty() {
            if let Err(reason) = deliver(&ctx, &session, &outbound) {
                break reason;
            }
        }
        if ctx.now().saturating_sub(session.last_activity_ns()) >= idle_timeout_ns {
            break CloseReason::IdleTimeout;
        }

        tokio::select! {
            request = inbound.recv(), if backlog.len() < backlog_limit => match request {
                Some(StreamRequest::Close) => break CloseReason::ClientClosed,
                Some(request) => {
                    session.touch(ctx.now());
                    match handle(&ctx, &session, request) {
                        Ok(Some(event)) => push_backlog(&mut backlog, event),
                        Ok(None) => {}
                        Err(reason) => break reason,
                    }
                }
                None => break CloseReason::TransportError,
            },
            permit = outbound.reserve(), if !backlog.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(event) = backlog.pop_front() {
                        permit.send(event);
                    }
                }
                Err(_) => break CloseReason::TransportError,
            },
            _ = &mut notified => {}
            _ = tick.tick() => {}
        }
    };

    close_session(&ctx, &session, reason);
    let _ = outbound.try_send(StreamEvent::Closed(reason));
}

fn push_backlog(backlog: &mut VecDeque<StreamEvent>, event: StreamEvent) {
    let event = match (backlog.back_mut(), event) {
        (Some(StreamEvent::AckConfirmation(pending)), StreamEvent::AckConfirmation(next)) => {
            pending.merge(next);
            return;
        }
        (
            Some(StreamEvent::ModifyAckDeadlineConfirmation(pending)),
            StreamEvent::ModifyAckDeadlineConfirmation(next),
        ) => {
            pending.merge(next);
            return;
        }
        (_, event) => event,
    };
    backlog.push_back(event);
}

/// Moves queued confirmations into the outbound queue while it has room.
fn flush_backlog(
    backlog: &mut VecDeque<StreamEvent>,
    outbound: &mpsc::Sender<StreamEvent>,
) -> std::result::Result<(), CloseReason> {
    while !backlog.is_empty() {
        match outbound.try_reserve() {
            Ok(permit) => {
                if let Some(event) = backlog.pop_front() {
                    permit.send(event);
                }
            }
            Err(TrySendError::Full(())) => return Ok(()),
            Err(TrySendError::Closed(())) => return Err(CloseReason::TransportError),
        }
    }
    Ok(())
}

/// Feeds batches while the session has credit and the outbound queue has room.
fn deliver(
    ctx: &SubscriptionContext,
    session: &Arc<SessionShared>,
    outbound: &mpsc::Sender<StreamEvent>,
) -> std::result::Result<(), CloseReason> {
    let max_batch = ctx.config().max_pull_messages;
    while session.has_credit() {
        let permit = match outbound.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                debug!("session {}: outbound queue full", session.id());
                return Ok(());
            }
            Err(TrySendError::Closed(())) => return Err(CloseReason::TransportError),
        };
        let batch: Vec<_> = ctx
            .next_batch(Some(session), BatchLimits::new(max_batch, u64::MAX))
            .collect();
        if batch.is_empty() {
            return Ok(());
        }
        permit.send(StreamEvent::Messages(batch));
    }
    Ok(())
}

fn handle(
    ctx: &SubscriptionContext,
    session: &SessionShared,
    request: StreamRequest,
) -> std::result::Result<Option<StreamEvent>, CloseReason> {
    let event = match request {
        StreamRequest::Acknowledge(ack_ids) => {
            ack::acknowledge_batch(ctx, &ack_ids).map(StreamEvent::AckConfirmation)
        }
        StreamRequest::ModifyAckDeadline { ack_ids, seconds } => {
            ack::modify_ack_deadline_batch(ctx, &ack_ids, seconds)
                .map(StreamEvent::ModifyAckDeadlineConfirmation)
        }
        StreamRequest::SetStreamAckDeadline(seconds) => {
            let deadline = Duration::from_secs(u64::from(seconds));
            return match validate_ack_deadline(deadline) {
                Ok(()) => {
                    session.set_stream_ack_deadline(deadline);
                    Ok(None)
                }
                Err(e) => Ok(Some(StreamEvent::InvalidRequest(e.to_string()))),
            };
        }
        StreamRequest::Close => return Err(CloseReason::ClientClosed),
    };
    match event {
        Ok(event) => Ok(Some(event)),
        Err(e) if e.closes_session() => Err(CloseReason::SubscriptionDeleted),
        Err(e) => Ok(Some(StreamEvent::InvalidRequest(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acked(ids: &[&str]) -> StreamEvent {
        StreamEvent::AckConfirmation(AckConfirmation {
            succeeded: ids.iter().map(|id| AckId::from(*id)).collect(),
            ..AckConfirmation::default()
        })
    }

    #[test]
    fn backlog_merges_adjacent_confirmations_of_one_kind() {
        let mut backlog = VecDeque::new();
        push_backlog(&mut backlog, acked(&["a"]));
        push_backlog(&mut backlog, acked(&["b", "c"]));
        assert_eq!(backlog.len(), 1);

        push_backlog(
            &mut backlog,
            StreamEvent::ModifyAckDeadlineConfirmation(AckConfirmation::default()),
        );
        push_backlog(&mut backlog, StreamEvent::InvalidRequest("bad".into()));
        push_backlog(&mut backlog, acked(&["d"]));
        assert_eq!(backlog.len(), 4);

        match backlog.pop_front() {
            Some(StreamEvent::AckConfirmation(confirmation)) => assert_eq!(
                confirmation.succeeded,
                vec![AckId::from("a"), AckId::from("b"), AckId::from("c")]
            ),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_stops_when_the_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut backlog = VecDeque::from([
            StreamEvent::InvalidRequest("1".into()),
            StreamEvent::InvalidRequest("2".into()),
            StreamEvent::InvalidRequest("3".into()),
        ]);
        flush_backlog(&mut backlog, &tx).unwrap();
        assert_eq!(backlog.len(), 1);

        rx.recv().await.unwrap();
        flush_backlog(&mut backlog, &tx).unwrap();
        assert!(backlog.is_empty());

        drop(rx);
        backlog.push_back(StreamEvent::InvalidRequest("4".into()));
        assert_eq!(
            flush_backlog(&mut backlog, &tx),
            Err(CloseReason::TransportError)
        );
    }
}
