//! Resumable per-run event feed.
//!
//! A feed starts with `hello`, replays every event after the client's cursor
//! in id order, and ends with `done` once a terminal event was delivered or
//! the run is terminal with nothing left to send. Idle feeds emit
//! `keepalive` frames. Dropping the feed is the only cancellation.

use crate::config::StreamConfig;
use crate::core::{Event, EventId, EventKind, RunId};
use crate::storage::{EventNotice, RunStore};
use futures::Stream;
use serde_json::{Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Hello,
    Event {
        id: EventId,
        kind: EventKind,
        data: JsonValue,
    },
    Keepalive,
    Done,
}

impl StreamFrame {
    /// Label clients dispatch on.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Event { kind, .. } => kind.as_str(),
            Self::Keepalive => "keepalive",
            Self::Done => "done",
        }
    }

    /// Event payload with `_event_id`, or `{}` for control frames.
    pub fn data(&self) -> JsonValue {
        match self {
            Self::Event { data, .. } => data.clone(),
            _ => json!({}),
        }
    }

    pub fn id(&self) -> Option<EventId> {
        match self {
            Self::Event { id, .. } => Some(*id),
            _ => None,
        }
    }

    fn from_event(event: &Event) -> Self {
        Self::Event {
            id: event.id,
            kind: event.kind,
            data: event.to_json(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Streaming,
    /// A terminal event went out; only `done` remains.
    Closing,
    Finished,
}

pub struct EventFeed {
    store: Arc<dyn RunStore>,
    run_id: RunId,
    cursor: EventId,
    config: StreamConfig,
    phase: Phase,
    pending: VecDeque<Event>,
    last_keepalive: Instant,
    wait_before_poll: bool,
    notify: Option<watch::Receiver<EventNotice>>,
}

impl EventFeed {
    /// Feed for `run_id` starting after `since` (0 replays everything).
    pub fn new(store: Arc<dyn RunStore>, run_id: RunId, since: EventId, config: StreamConfig) -> Self {
        let notify = store.subscribe_events();
        Self {
            store,
            run_id,
            cursor: since,
            config,
            phase: Phase::Start,
            pending: VecDeque::new(),
            last_keepalive: Instant::now(),
            wait_before_poll: false,
            notify,
        }
    }

    /// Id of the last event delivered, or the starting cursor.
    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// Next frame, or `None` after `done`.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Streaming;
                return Some(StreamFrame::Hello);
            }
            Phase::Finished => return None,
            Phase::Streaming | Phase::Closing => {}
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                self.cursor = event.id;
                if event.kind.is_terminal() {
                    self.pending.clear();
                    self.phase = Phase::Closing;
                }
                return Some(StreamFrame::from_event(&event));
            }

            if self.phase == Phase::Closing {
                return Some(self.finish());
            }

            if self.wait_before_poll {
                self.wait().await;
                self.wait_before_poll = false;
            }

            if self.fetch().await {
                continue;
            }

            match self.store.get_run(self.run_id).await {
                Ok(Some(run)) if run.status.is_terminal() => {
                    // The terminal event may have landed after the fetch above.
                    if self.fetch().await {
                        continue;
                    }
                    return Some(self.finish());
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(run_id = %self.run_id, "run vanished while streaming");
                    return Some(self.finish());
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, error = %err, "run status lookup failed");
                }
            }

            self.wait_before_poll = true;
            if self.last_keepalive.elapsed() > self.config.keepalive {
                self.last_keepalive = Instant::now();
                return Some(StreamFrame::Keepalive);
            }
        }
    }

    /// Adapt into a `Stream` of frames.
    pub fn into_stream(self) -> impl Stream<Item = StreamFrame> + Send {
        futures::stream::unfold(self, |mut feed| async move {
            feed.next_frame().await.map(|frame| (frame, feed))
        })
    }

    fn finish(&mut self) -> StreamFrame {
        self.phase = Phase::Finished;
        StreamFrame::Done
    }

    /// Queue the next batch after the cursor. True if anything arrived.
    async fn fetch(&mut self) -> bool {
        match self
            .store
            .fetch_events_since(self.run_id, self.cursor, self.config.fetch_limit)
            .await
        {
            Ok(events) if !events.is_empty() => {
                self.pending.extend(events);
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "event fetch failed");
                false
            }
        }
    }

    /// Sleep one poll interval, returning early when the store signals a
    /// new event for this run. Notices for other runs are skipped. The
    /// watch keeps only the latest notice, so one for this run can be
    /// overwritten; the interval bounds the delay then.
    async fn wait(&mut self) {
        let deadline = Instant::now() + self.config.poll_interval;
        if let Some(notify) = self.notify.as_mut() {
            loop {
                match timeout_at(deadline, notify.changed()).await {
                    Ok(Ok(())) => {
                        if notify.borrow_and_update().run_id == self.run_id {
                            return;
                        }
                    }
                    Ok(Err(_)) => {
                        self.notify = None;
                        break;
                    }
                    Err(_) => return,
                }
            }
        }
        sleep_until(deadline).await;
    }
}
