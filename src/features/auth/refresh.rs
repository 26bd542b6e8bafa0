use crate::error::AppResult;
use crate::features::auth::flow::{AuthFlowController, RefreshOutcome, now_millis};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Background token renewal for an authenticated OAuth2 session.
///
/// Stops on its own once the session can no longer be renewed, and is aborted on drop.
pub struct RefreshTask {
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// `on_event` hears `Ok` after each renewal and the error that ended the session.
    pub fn spawn<F>(controller: Arc<AuthFlowController>, period: Duration, on_event: F) -> Self
    where
        F: Fn(AppResult<()>) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match controller.check_refresh(now_millis()).await {
                    Ok(RefreshOutcome::Inactive) => {
                        log::debug!("token refresh stopped: session not renewable");
                        break;
                    }
                    Ok(RefreshOutcome::NotDue) => {}
                    Ok(RefreshOutcome::Refreshed) => {
                        log::info!("access token refreshed");
                        on_event(Ok(()));
                    }
                    Err(err) => {
                        on_event(Err(err));
                        break;
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
