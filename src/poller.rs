use crate::controller_client::ControllerClient;
use log::{debug, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::UnboundedSender,
    task::AbortHandle,
    time::{MissedTickBehavior, interval},
};

/// One successful poll of the controller during a running operation.
#[derive(Clone, Debug, PartialEq)]
pub struct PollObservation {
    /// Raw kernel log excerpt.
    pub dmesg: String,
    /// Line-break count of the excerpt, used as the progress marker.
    pub marker: u32,
    pub still_in_progress: bool,
    pub ro_exists: bool,
    pub old_overlay_active: bool,
}

/// What the poll task reports back to the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Observed(PollObservation),
    /// The consecutive-failure cap was reached and the task stopped.
    Exhausted { failures: u32 },
}

/// Cadenced progress poller for a running maintenance operation.
///
/// `start` replaces any previous poll task so the cadence is never doubled.
/// Transport failures are swallowed: the controller is expected to drop
/// requests while it is busy applying an update.
pub struct ProgressPoller<C> {
    client: Arc<C>,
    interval: Duration,
    max_failures: Option<u32>,
    tx: UnboundedSender<PollOutcome>,
    task: Option<AbortHandle>,
}

impl<C> ProgressPoller<C>
where
    C: ControllerClient + Send + Sync + 'static,
{
    pub fn new(
        client: Arc<C>,
        interval: Duration,
        max_failures: Option<u32>,
        tx: UnboundedSender<PollOutcome>,
    ) -> Self {
        ProgressPoller {
            client,
            interval,
            max_failures,
            tx,
            task: None,
        }
    }

    /// Start polling. An already-running poll task is stopped first.
    pub fn start(&mut self) {
        self.stop();

        let client = self.client.clone();
        let cadence = self.interval;
        let max_failures = self.max_failures;
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a fresh interval fires immediately; wait a
            // full cadence before the first poll.
            ticker.tick().await;

            let mut failures = 0u32;
            loop {
                ticker.tick().await;

                match client.poll().await {
                    Ok(response) => {
                        failures = 0;
                        let observation = PollObservation {
                            marker: saturating_marker(response.dmesg.matches('\n').count()),
                            dmesg: response.dmesg,
                            still_in_progress: response.system_update_in_progress,
                            ro_exists: response.ro_exists,
                            old_overlay_active: response.old_overlay_active,
                        };
                        let done = !observation.still_in_progress;
                        if tx.send(PollOutcome::Observed(observation)).is_err() {
                            break;
                        }
                        if done {
                            debug!("controller no longer reports an operation in progress");
                            break;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        debug!("poll attempt failed ({failures} consecutive): {e:#}");
                        if let Some(cap) = max_failures
                            && failures >= cap
                        {
                            warn!("giving up polling after {failures} consecutive failures");
                            let _ = tx.send(PollOutcome::Exhausted { failures });
                            break;
                        }
                    }
                }
            }
        });

        self.task = Some(task.abort_handle());
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl<C> Drop for ProgressPoller<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A wrapped count would read as progress going backwards, so saturate.
fn saturating_marker(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
