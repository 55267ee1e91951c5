//! Sequence bootstrap: fetch the inbox cursor, then open the transport.

use tracing::{debug, warn};

use msgr_api::fetch_sequence_id;
use msgr_core::error::{MsgrError, MsgrResult};

use crate::auth::classify_auth;
use crate::events::{ConnectionState, LifecycleEvent};
use crate::manager::{ConnectionManager, Op};

impl ConnectionManager {
    /// Start a new connection generation by requesting the cursor.
    ///
    /// The request runs on its own task; its result comes back as
    /// `Op::SeqFetched` and is dropped if the generation has moved on.
    pub(crate) fn begin_bootstrap(&mut self) {
        self.generation += 1;
        self.timers.reconnect = None;
        self.set_state(ConnectionState::Bootstrapping);

        let generation = self.generation;
        let poster = self.poster.clone();
        let actor_id = self.session.credentials.actor_id().to_string();
        let ops = self.ops_tx.clone();
        tokio::spawn(async move {
            let result = fetch_sequence_id(poster.as_ref(), &actor_id).await;
            if ops.send(Op::SeqFetched { generation, result }).is_err() {
                debug!("manager gone before bootstrap finished");
            }
        });
    }

    pub(crate) async fn on_seq_fetched(&mut self, generation: u64, result: MsgrResult<i64>) {
        if generation != self.generation || self.session.ending {
            debug!("dropping stale bootstrap result for generation {generation}");
            return;
        }
        match result {
            Ok(seq) => {
                debug!("bootstrap cursor {seq}");
                self.session.last_seq_id = Some(seq);
                self.open_transport().await;
            }
            Err(e) => self.on_bootstrap_error(e).await,
        }
    }

    async fn on_bootstrap_error(&mut self, e: MsgrError) {
        let detail = e.to_string();
        if let Some(reason) = classify_auth(&detail, Some(&e)) {
            self.emit_auth(reason, &detail).await;
            return;
        }

        warn!("bootstrap failed: {detail}");
        self.emit(LifecycleEvent::Error { detail: detail.clone() });
        if (self.config.auto_reconnect || self.session.cycling) && !self.session.ending {
            self.schedule_reconnect();
        } else {
            self.give_up(&detail);
        }
    }
}
