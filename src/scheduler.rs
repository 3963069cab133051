use anyhow::Error;
use async_channel::Receiver;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::RenderEngine;
use crate::queue::{Claim, Outcome, QueueEvent, QueueHandle};
use crate::worker::Processor;

const SHUTDOWN_MESSAGE: &str = "Render queue shut down";

/// Drains the queue one job at a time until `cancel_token` fires.
///
/// Every wake-up from `recv_events` runs one claim step. A claimed job is
/// rendered inline; while it runs the only thing that can interrupt it is a
/// user cancel (the job's own token) or shutdown.
pub async fn serve<E: RenderEngine>(
    cancel_token: CancellationToken,
    queue: QueueHandle,
    recv_events: Receiver<QueueEvent>,
    processor: Processor<E>,
) -> Result<(), Error> {
    loop {
        let mut retry_at: Option<Instant> = None;

        match queue.claim_next() {
            Claim::Claimed { job, token } => {
                let job_id = job.id;
                let outcome = tokio::select! {
                    outcome = processor.process(&job) => Some(outcome),
                    _ = token.cancelled() => {
                        info!(job_id = %job_id, "Dropped cancelled render");
                        None
                    },
                    _ = cancel_token.cancelled() => {
                        queue.finish(job_id, Outcome::Failed(SHUTDOWN_MESSAGE.to_string()));
                        debug!("Scheduler Cancelled");
                        break;
                    },
                };

                if let Some(outcome) = outcome {
                    match &outcome {
                        Outcome::Completed => info!(job_id = %job_id, "Completed job"),
                        Outcome::Failed(msg) => warn!(job_id = %job_id, error = %msg, "Failed job"),
                    }
                    queue.finish(job_id, outcome);
                }
                continue;
            }
            Claim::CoolingDown(until) => retry_at = Some(until),
            Claim::Busy | Claim::Idle => {}
        }

        // Nothing to claim right now, sleep until the queue changes.
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Scheduler Cancelled");
                break;
            },
            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                trace!("Cancel cooldown elapsed");
            },
            event = recv_events.recv() => {
                match event {
                    Err(_) => {
                        debug!("Queue event channel closed, exiting");
                        break;
                    },
                    Ok(event) => trace!(event = ?event, "Queue changed"),
                }
            }
        }
    }

    info!("Scheduler stopped.");

    Ok(())
}
