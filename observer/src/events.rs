//! Keeps a subscription to consensus chain events open, and forwards each event to the attestation engine.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::watch;
use tracing::*;

use crate::{bridge::EventSource, engine::AttestationGatherer};

/// Delay before re-subscribing after `attempt` consecutive failures. Doubles from one second, capped at two minutes.
pub fn resubscribe_backoff(attempt: u32) -> Duration {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(120);
    INITIAL
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(MAX, |d| d.min(MAX))
}

/// Forward events until shutdown. A lost or failed subscription is re-opened with exponential backoff.
pub async fn subscribe_events(
    source: Arc<dyn EventSource>,
    engine: Arc<AttestationGatherer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0;
    loop {
        let subscribed = tokio::select! {
            subscribed = source.subscribe() => subscribed,
            _ = shutdown.changed() => break,
        };
        match subscribed {
            Ok(mut events) => {
                debug!("subscribed to consensus events");
                attempt = 0;
                loop {
                    tokio::select! {
                        event = events.next() => match event {
                            Some(Ok(event)) => {
                                trace!(?event, "consensus event");
                                engine.handle_event(event);
                            }
                            Some(Err(e)) => warn!("failed to read consensus event: {e}"),
                            None => {
                                info!("consensus event subscription closed");
                                break;
                            }
                        },
                        _ = shutdown.changed() => return,
                    }
                }
            }
            Err(e) => {
                warn!(attempt, "failed to subscribe to consensus events: {e}");
            }
        }

        let delay = resubscribe_backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("event subscription stopped");
}
