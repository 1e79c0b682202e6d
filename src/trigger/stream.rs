// SPDX-License-Identifier: MIT
//! JetStream pull-consumer trigger. Each configured stream gets its own
//! connection and a durable consumer with explicit acks, so an unacked or
//! naked message is redelivered up to `max_deliver` times. The consume loop
//! fetches in batches and dispatches one message at a time; ordering within a
//! batch is preserved, ordering across redeliveries is not.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::{self, AckKind};
use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamSettings;
use crate::model::{TriggerEvent, TriggerKind};

use super::{Dispatcher, TriggerError};

/// Pause after a failed fetch so a dead server is not polled in a hot loop.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Delay between reconnect attempts; the client retries indefinitely.
const RECONNECT_WAIT: Duration = Duration::from_secs(2);

pub struct StreamTrigger {
    name: String,
    settings: StreamSettings,
    dispatcher: Arc<Dispatcher>,
    client: Option<async_nats::Client>,
    worker: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl StreamTrigger {
    pub fn new(name: &str, settings: StreamSettings, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            name: name.to_string(),
            settings,
            dispatcher,
            client: None,
            worker: None,
            cancel: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connects, ensures the durable consumer exists, and spawns the consume
    /// loop. The connection outlives server restarts; only an unreachable
    /// stream or a rejected consumer config fails startup.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<(), TriggerError> {
        let trigger = self.name.clone();
        let client = ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|_| RECONNECT_WAIT)
            .event_callback(move |event| {
                let trigger = trigger.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            warn!(trigger = %trigger, "transport disconnected, reconnecting")
                        }
                        Event::Connected => debug!(trigger = %trigger, "transport connected"),
                        other => debug!(trigger = %trigger, "transport event: {other}"),
                    }
                }
            })
            .connect(&self.settings.url)
            .await
            .map_err(|e| self.error(e))?;

        let durable = effective_durable(&self.settings.durable, &self.name);
        let consumer: PullConsumer = jetstream::new(client.clone())
            .create_consumer_on_stream(
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: self.settings.subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(self.settings.ack_wait_secs),
                    max_deliver: self.settings.max_deliver,
                    deliver_policy: DeliverPolicy::New,
                    ..Default::default()
                },
                self.settings.stream.clone(),
            )
            .await
            .map_err(|e| self.error(e))?;

        info!(
            trigger = %self.name,
            stream = %self.settings.stream,
            subject = %self.settings.subject,
            durable = %durable,
            "stream consumer started"
        );

        let cancel = shutdown.child_token();
        self.worker = Some(tokio::spawn(consume_loop(
            self.name.clone(),
            consumer,
            Arc::clone(&self.dispatcher),
            self.settings.batch_size,
            Duration::from_secs(self.settings.fetch_max_wait_secs),
            cancel.clone(),
        )));
        self.cancel = Some(cancel);
        self.client = Some(client);
        Ok(())
    }

    /// Stops the consume loop and flushes the connection. A dispatch already
    /// in flight finishes first; fetched-but-unprocessed messages are left
    /// unacked and redelivered after `ack_wait`.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        if let Some(client) = self.client.take() {
            if let Err(e) = client.flush().await {
                debug!(trigger = %self.name, "flush on shutdown failed: {e}");
            }
        }
        info!(trigger = %self.name, "stream consumer stopped");
    }

    fn error(&self, source: impl std::error::Error + Send + Sync + 'static) -> TriggerError {
        TriggerError::Stream {
            name: self.name.clone(),
            source: Box::new(source),
        }
    }
}

fn effective_durable(configured: &str, trigger: &str) -> String {
    if configured.is_empty() {
        trigger.to_string()
    } else {
        configured.to_string()
    }
}

async fn consume_loop(
    name: String,
    consumer: PullConsumer,
    dispatcher: Arc<Dispatcher>,
    batch_size: usize,
    fetch_max_wait: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let fetched = consumer
            .fetch()
            .max_messages(batch_size)
            .expires(fetch_max_wait)
            .messages()
            .await;

        let mut messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                warn!(trigger = %name, "fetch failed: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => next,
            };
            match next {
                Some(Ok(msg)) => handle_message(&name, &dispatcher, &msg).await,
                Some(Err(e)) => {
                    warn!(trigger = %name, "message batch error: {e}");
                    break;
                }
                None => break,
            }
        }
    }
    debug!(trigger = %name, "consume loop exited");
}

/// Content and acknowledgement surface of one delivered message.
/// `jetstream::Message` is the production impl; constructing one requires a
/// live stream.
#[async_trait]
trait Delivery {
    fn subject(&self) -> &str;
    fn payload(&self) -> &[u8];
    async fn ack(&self) -> Result<(), async_nats::Error>;
    async fn nak(&self) -> Result<(), async_nats::Error>;
}

#[async_trait]
impl Delivery for jetstream::Message {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), async_nats::Error> {
        jetstream::Message::ack(self).await
    }

    async fn nak(&self) -> Result<(), async_nats::Error> {
        self.ack_with(AckKind::Nak(None)).await
    }
}

/// Dispatches one message. Success acks it; a handler error naks it so the
/// stream redelivers. Ack transport failures are logged and otherwise
/// ignored, the ack-wait timeout covers them.
async fn handle_message<M: Delivery>(name: &str, dispatcher: &Dispatcher, msg: &M) {
    let mut event = TriggerEvent::new(TriggerKind::Stream, name);
    event.payload = msg.payload().to_vec();
    event
        .metadata
        .insert("subject".to_string(), msg.subject().to_string());

    match dispatcher.dispatch(event).await {
        Ok(()) => {
            if let Err(e) = msg.ack().await {
                warn!(trigger = name, "ack failed: {e}");
            }
        }
        Err(e) => {
            warn!(trigger = name, "handler failed, leaving message for redelivery: {e:#}");
            if let Err(e) = msg.nak().await {
                warn!(trigger = name, "nak failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::model::TriggerResponse;
    use crate::reporter::ResultReporter;
    use crate::retry::RetryConfig;
    use crate::state::NodeState;
    use crate::store::TaskInstanceStore;
    use crate::{AgentContext, Handler};

    #[test]
    fn durable_name_falls_back_to_trigger_name() {
        assert_eq!(effective_durable("", "events"), "events");
        assert_eq!(effective_durable("shared-cursor", "events"), "shared-cursor");
    }

    #[derive(Default)]
    struct AcceptingHandler {
        seen: Mutex<Vec<TriggerEvent>>,
    }

    #[async_trait]
    impl Handler for AcceptingHandler {
        fn name(&self) -> &str {
            "accepting"
        }

        async fn init(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_trigger(&self, event: TriggerEvent) -> anyhow::Result<TriggerResponse> {
            self.seen.lock().unwrap().push(event);
            Ok(TriggerResponse::default())
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl Handler for RejectingHandler {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn init(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_trigger(&self, _event: TriggerEvent) -> anyhow::Result<TriggerResponse> {
            anyhow::bail!("simulated handler failure")
        }
    }

    /// Stand-in for a delivered message, counting acknowledgements.
    struct AckRecorder {
        payload: Vec<u8>,
        acks: AtomicU32,
        naks: AtomicU32,
    }

    impl AckRecorder {
        fn new(payload: &[u8]) -> Self {
            Self {
                payload: payload.to_vec(),
                acks: AtomicU32::new(0),
                naks: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Delivery for AckRecorder {
        fn subject(&self) -> &str {
            "events.alerts"
        }

        fn payload(&self) -> &[u8] {
            &self.payload
        }

        async fn ack(&self) -> Result<(), async_nats::Error> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nak(&self) -> Result<(), async_nats::Error> {
            self.naks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_dispatcher(handler: Arc<dyn Handler>) -> Dispatcher {
        let state = Arc::new(NodeState::new("1.0.0"));
        let store = Arc::new(TaskInstanceStore::new());
        let reporter =
            ResultReporter::new(Arc::clone(&state)).with_retry(RetryConfig::instant());
        Dispatcher::new(handler, state, store, reporter)
    }

    #[tokio::test]
    async fn successful_dispatch_acks_exactly_once() {
        let handler = Arc::new(AcceptingHandler::default());
        let dispatcher = make_dispatcher(handler.clone());
        let msg = AckRecorder::new(br#"{"alert":"disk"}"#);

        handle_message("events", &dispatcher, &msg).await;

        assert_eq!(msg.acks.load(Ordering::SeqCst), 1);
        assert_eq!(msg.naks.load(Ordering::SeqCst), 0);
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, br#"{"alert":"disk"}"#);
        assert_eq!(seen[0].metadata["subject"], "events.alerts");
    }

    #[tokio::test]
    async fn failed_dispatch_naks_for_redelivery() {
        let dispatcher = make_dispatcher(Arc::new(RejectingHandler));
        let msg = AckRecorder::new(b"poison");

        handle_message("events", &dispatcher, &msg).await;

        assert_eq!(msg.acks.load(Ordering::SeqCst), 0);
        assert_eq!(msg.naks.load(Ordering::SeqCst), 1);
    }
}
