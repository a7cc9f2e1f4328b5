//! Gap-free event delivery: store replay followed by the live stream.

use std::collections::VecDeque;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::event::SessionEvent;
use crate::session::SessionId;
use crate::store::{blocking, EventStore};
use crate::Result;

/// Live events of one session, continuing right after a replay.
///
/// Events are yielded in seq order with no gaps and no duplicates. When
/// the live receiver lags, the missing range is re-read from the store.
pub struct Subscription {
    session_id: SessionId,
    store: EventStore,
    live: Option<broadcast::Receiver<SessionEvent>>,
    backlog: VecDeque<SessionEvent>,
    last_seq: i64,
    finished: bool,
}

impl Subscription {
    /// `live` must have been subscribed before the replay ending at
    /// `last_seq` was read.
    pub(crate) fn new(
        session_id: SessionId,
        store: EventStore,
        live: Option<broadcast::Receiver<SessionEvent>>,
        last_seq: i64,
        finished: bool,
    ) -> Self {
        Self {
            session_id,
            store,
            live,
            backlog: VecDeque::new(),
            last_seq,
            finished,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Seq of the last event handed out (replay included).
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    /// Whether the closing event has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event, or `None` once the session is closed and drained.
    pub async fn next(&mut self) -> Result<Option<SessionEvent>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                return Ok(Some(self.deliver(event)));
            }
            if self.finished {
                return Ok(None);
            }
            let Some(live) = self.live.as_mut() else {
                return Ok(None);
            };

            match live.recv().await {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) if event.seq == self.last_seq + 1 => {
                    return Ok(Some(self.deliver(event)));
                }
                Ok(event) => {
                    debug!(
                        session_id = %self.session_id,
                        expected = self.last_seq + 1,
                        got = event.seq,
                        "Gap in live stream, reading from store"
                    );
                    self.refill().await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session_id, skipped, "Subscriber lagged, reading from store");
                    self.refill().await?;
                }
                Err(RecvError::Closed) => {
                    // Pipeline finished; pick up anything recorded since
                    self.live = None;
                    self.refill().await?;
                    if self.backlog.is_empty() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn deliver(&mut self, event: SessionEvent) -> SessionEvent {
        self.last_seq = event.seq;
        if event.is_closed() {
            self.finished = true;
        }
        event
    }

    async fn refill(&mut self) -> Result<()> {
        let store = self.store.clone();
        let id = self.session_id.clone();
        let after = self.last_seq;
        let missing = blocking(move || store.get_events(&id, after)).await?;
        self.backlog.extend(missing);
        Ok(())
    }
}
