// ── Notification link task ──
//
// One spawned task per link. Connects, reads until the link drops, then
// backs off and reconnects while anyone is still listening. Every wait
// races the session's cancellation token, so closing the link never leaves
// a timer behind.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gwconsole_api::MessageStream;

use super::{ConnectionState, Shared};
use crate::error::CoreError;
use crate::model::Event;

/// How a connected read loop ended.
enum ReadOutcome {
    Cancelled,
    Closed,
    Failed(gwconsole_api::Error),
}

/// Drive session `id` until it is cancelled, goes idle, or fails for good.
pub(super) async fn run(
    shared: Arc<Shared>,
    id: u64,
    cancel: CancellationToken,
    resumed: bool,
) {
    let reconnect = shared.config.reconnect.clone();
    let mut connected_before = resumed;
    // Consecutive failed connects; compared against `max_retries`.
    let mut failures: u32 = 0;
    // Backoff exponent; reset by every successful connect.
    let mut retries: u32 = 0;

    loop {
        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = shared.connector.connect() => result,
        };

        match connected {
            Ok(stream) => {
                failures = 0;
                retries = 0;
                if !shared.publish_state(id, ConnectionState::Connected) {
                    break;
                }
                info!(session = id, reconnected = connected_before, "notification link up");
                shared.announce_connected(connected_before);
                connected_before = true;

                match read_until_closed(&shared, stream, &cancel).await {
                    ReadOutcome::Cancelled => break,
                    ReadOutcome::Closed => info!(session = id, "notification link closed by peer"),
                    ReadOutcome::Failed(e) => {
                        warn!(session = id, error = %e, "notification link dropped");
                    }
                }
            }
            Err(e) if !e.is_transient() => {
                let error = CoreError::from(e);
                error!(session = id, error = %error, "notification link failed permanently");
                shared.fail(id, &error, failures + 1);
                break;
            }
            Err(e) => {
                failures += 1;
                warn!(session = id, error = %e, failures, "notification link connect failed");

                if reconnect.exhausted(failures) {
                    error!(session = id, failures, "reconnection limit reached, giving up");
                    let error = CoreError::RetriesExhausted {
                        attempts: failures,
                        last_error: e.to_string(),
                    };
                    shared.fail(id, &error, failures);
                    break;
                }
            }
        }

        if shared.end_if_idle(id) {
            debug!(session = id, "no listeners left, not reconnecting");
            break;
        }

        let delay = reconnect.delay_for(retries);
        if !shared.publish_state(
            id,
            ConnectionState::Reconnecting {
                attempt: retries + 1,
            },
        ) {
            break;
        }
        info!(
            session = id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = retries + 1,
            "waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        retries = retries.saturating_add(1);
    }

    debug!(session = id, "notification link task exiting");
}

/// Read and dispatch messages until the link drops or the session is
/// cancelled. Messages are dispatched one at a time, in arrival order.
async fn read_until_closed(
    shared: &Shared,
    mut stream: MessageStream,
    cancel: &CancellationToken,
) -> ReadOutcome {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return ReadOutcome::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(msg)) => shared.dispatch(&Event::from(msg)),
            Some(Err(e)) => return ReadOutcome::Failed(e),
            None => return ReadOutcome::Closed,
        }
    }
}
