//! Hand-off to the external sign-in surface.

use std::fmt;
use std::sync::Arc;

use netmon_core::{Caller, Disposition};

use crate::scheduler::Scheduler;
use crate::{Command, MonitorError};

/// Opaque token carried by a visible sign-in notification.
///
/// Only a launch request carrying the current token opens the sign-in surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchToken(pub u32);

/// Request for the orchestrator to open the sign-in surface.
#[derive(Debug)]
pub struct SignInRequest {
    /// Network to sign in to.
    pub net_id: u32,
    /// Portal page reported by the last probe, if any.
    pub portal_url: Option<String>,
    /// Channel for the user's single disposition.
    pub responder: SignInResponder,
}

/// Write-once channel back to the monitor.
///
/// At most one disposition is ever delivered; a rejected response leaves the
/// responder usable.
pub struct SignInResponder {
    net_id: u32,
    queue: Option<Arc<dyn Scheduler>>,
}

impl SignInResponder {
    pub(crate) fn new(net_id: u32, queue: Arc<dyn Scheduler>) -> Self {
        Self {
            net_id,
            queue: Some(queue),
        }
    }

    /// Network this responder reports for.
    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    /// Returns `true` once a disposition was delivered.
    pub fn is_spent(&self) -> bool {
        self.queue.is_none()
    }

    /// Delivers the user's disposition.
    ///
    /// # Errors
    /// Returns [`MonitorError::AlreadyResponded`] after a delivered response.
    /// Returns [`MonitorError::PermissionDenied`] when an unprivileged caller
    /// reports [`Disposition::WantedAsIs`].
    pub fn respond(&mut self, caller: Caller, disposition: Disposition) -> Result<(), MonitorError> {
        if self.queue.is_none() {
            return Err(MonitorError::AlreadyResponded);
        }
        if disposition == Disposition::WantedAsIs && caller != Caller::Privileged {
            tracing::warn!(net_id = self.net_id, "rejected unprivileged wanted-as-is response");
            return Err(MonitorError::PermissionDenied(
                "wanted-as-is requires a privileged caller".to_string(),
            ));
        }

        tracing::info!(net_id = self.net_id, ?disposition, "sign-in app responded");
        if let Some(queue) = self.queue.take() {
            queue.post(Command::SignInFinished(disposition));
        }
        Ok(())
    }
}

impl fmt::Debug for SignInResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInResponder")
            .field("net_id", &self.net_id)
            .field("spent", &self.is_spent())
            .finish_non_exhaustive()
    }
}
