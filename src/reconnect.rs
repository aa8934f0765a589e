use crate::controller_client::ControllerClient;
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc::UnboundedSender, task::AbortHandle, time::sleep};

/// What the reconnect task reports back to the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconnectOutcome {
    /// The controller answered a handshake probe after a reboot.
    Reconnected { attempts: u32 },
    /// The attempt cap was reached without an answer.
    GaveUp { attempts: u32 },
}

/// Probes the controller after a reboot-inducing action until it answers.
///
/// Each probe is a full `init` handshake, so the first successful probe also
/// yields fresh device state. By default the supervisor retries forever;
/// the device has no other way back.
pub struct ReconnectSupervisor<C> {
    client: Arc<C>,
    delay: Duration,
    attempt_cap: Option<u32>,
    tx: UnboundedSender<ReconnectOutcome>,
    task: Option<AbortHandle>,
}

impl<C> ReconnectSupervisor<C>
where
    C: ControllerClient + Send + Sync + 'static,
{
    pub fn new(
        client: Arc<C>,
        delay: Duration,
        attempt_cap: Option<u32>,
        tx: UnboundedSender<ReconnectOutcome>,
    ) -> Self {
        ReconnectSupervisor {
            client,
            delay,
            attempt_cap,
            tx,
            task: None,
        }
    }

    /// Start probing. An already-armed supervisor is disarmed first.
    pub fn arm(&mut self) {
        self.disarm();

        let client = self.client.clone();
        let delay = self.delay;
        let attempt_cap = self.attempt_cap;
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                sleep(delay).await;
                attempts += 1;

                match client.init().await {
                    Ok(_) => {
                        info!("controller answered after {attempts} reconnect attempts");
                        let _ = tx.send(ReconnectOutcome::Reconnected { attempts });
                        break;
                    }
                    Err(e) => {
                        debug!("reconnect attempt {attempts} failed: {e:#}");
                        if let Some(cap) = attempt_cap
                            && attempts >= cap
                        {
                            warn!("giving up reconnecting after {attempts} attempts");
                            let _ = tx.send(ReconnectOutcome::GaveUp { attempts });
                            break;
                        }
                    }
                }
            }
        });

        self.task = Some(task.abort_handle());
    }

    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl<C> Drop for ReconnectSupervisor<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
