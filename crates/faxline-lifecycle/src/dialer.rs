//! Outbound call initiation.
//!
//! The dialer records the call reference first, so a completion callback
//! that races the originate reply can always be matched. Gateway I/O runs
//! outside the manager's per-transmission lock.

use std::sync::Arc;

use faxline_core::models::{TransmissionId, TransmissionStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    completion::CompletionEvent,
    error::{LifecycleError, Result},
    gateway::{originate_args, GatewayConnector, GatewayPool},
    manager::{CompletionOutcome, LifecycleManager},
    storage::LifecycleStorage,
};

/// What happened to a dial request.
#[derive(Debug, Clone, PartialEq)]
pub enum DialOutcome {
    /// The gateway accepted the call; completion arrives later.
    Dialing {
        /// Gateway call reference of this attempt.
        call_ref: String,
    },
    /// The gateway could not be reached or refused the call. This was
    /// applied as a failed completion, so the usual retry path applies.
    Rejected(CompletionOutcome),
}

/// Places outbound fax calls through a gateway pool.
pub struct CallDialer<S, C: GatewayConnector> {
    manager: Arc<LifecycleManager<S>>,
    pool: Arc<GatewayPool<C>>,
    use_ecm: bool,
}

impl<S: LifecycleStorage, C: GatewayConnector> CallDialer<S, C> {
    /// Creates a dialer.
    pub const fn new(
        manager: Arc<LifecycleManager<S>>,
        pool: Arc<GatewayPool<C>>,
        use_ecm: bool,
    ) -> Self {
        Self { manager, pool, use_ecm }
    }

    /// Dials a queued transmission.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the transmission is not queued or a concurrent
    /// dial claimed it first, `InvalidInput` if its fields cannot be put on
    /// the wire, or any store failure. Gateway problems,
    /// including an exhausted pool, are not errors here: they become a
    /// failed completion.
    pub async fn dial(&self, id: TransmissionId) -> Result<DialOutcome> {
        let tx = self.manager.get(id).await?;
        if tx.status != TransmissionStatus::Queued {
            return Err(LifecycleError::invalid_transition(tx.status, TransmissionStatus::Dialing));
        }

        let call_ref = Uuid::new_v4().to_string();
        let args = originate_args(&call_ref, &tx, self.use_ecm)?;
        self.manager.mark_dialing(id, &call_ref).await?;

        let reply = match self.pool.acquire().await {
            Ok(mut connection) => connection.originate(&args).await,
            Err(err) => Err(err),
        };

        match reply {
            Ok(reply) => {
                info!(transmission_id = %id, %call_ref, reply = %reply.trim(), "call originated");
                Ok(DialOutcome::Dialing { call_ref })
            },
            Err(err) => {
                warn!(transmission_id = %id, %call_ref, error = %err, "originate rejected");
                let event = CompletionEvent::failure(err.to_string()).with_call_ref(call_ref);
                let outcome = self.manager.apply_completion(id, event).await?;
                Ok(DialOutcome::Rejected(outcome))
            },
        }
    }
}
