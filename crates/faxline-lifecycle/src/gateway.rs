//! Telephony gateway connections.
//!
//! Call initiation borrows a connection from a bounded [`GatewayPool`] for
//! the duration of one command. Connections go back to the pool when the
//! guard drops; broken ones are discarded and replaced on the next acquire.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use faxline_core::models::Transmission;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::LifecycleError;

/// Errors talking to the telephony gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Could not open or authenticate a connection.
    #[error("gateway connection failed: {0}")]
    Connect(String),

    /// The gateway rejected or failed a command.
    #[error("gateway command failed: {0}")]
    Command(String),

    /// No connection became available in time.
    #[error("no gateway connection available after {0:?}")]
    AcquireTimeout(Duration),

    /// The pool has been shut down.
    #[error("gateway pool closed")]
    PoolClosed,
}

/// One open session with the gateway.
#[async_trait]
pub trait GatewayConnection: Send {
    /// Issues an originate command and returns the gateway's reply.
    async fn originate(&mut self, args: &str) -> Result<String, GatewayError>;

    /// False once the session is known to be unusable.
    fn is_healthy(&self) -> bool;
}

/// Opens gateway sessions.
#[async_trait]
pub trait GatewayConnector: Send + Sync + 'static {
    /// Connection type produced.
    type Connection: GatewayConnection + 'static;

    /// Opens and authenticates a new session.
    async fn connect(&self) -> Result<Self::Connection, GatewayError>;
}

/// Bounded pool of gateway connections.
pub struct GatewayPool<C: GatewayConnector> {
    connector: C,
    idle: Mutex<Vec<C::Connection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl<C: GatewayConnector> GatewayPool<C> {
    /// Creates a pool allowing at most `max_size` concurrent connections.
    pub fn new(connector: C, max_size: usize, acquire_timeout: Duration) -> Self {
        Self {
            connector,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_size.max(1))),
            acquire_timeout,
        }
    }

    /// Borrows a connection, opening one if none is idle.
    ///
    /// # Errors
    ///
    /// `AcquireTimeout` if the pool stays exhausted, `PoolClosed` after
    /// [`Self::close`], or `Connect` if a new session cannot be opened.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>, GatewayError> {
        let permit =
            tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
                .await
                .map_err(|_| GatewayError::AcquireTimeout(self.acquire_timeout))?
                .map_err(|_| GatewayError::PoolClosed)?;

        let reused = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let connection = match reused {
            Some(connection) => connection,
            None => {
                debug!("opening gateway connection");
                self.connector.connect().await?
            },
        };

        Ok(PooledConnection { connection: Some(connection), pool: self, _permit: permit })
    }

    /// Connections waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Rejects further acquires and drops idle connections.
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn release(&self, connection: C::Connection) {
        if connection.is_healthy() && !self.permits.is_closed() {
            self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(connection);
        } else {
            warn!("discarding unhealthy gateway connection");
        }
    }
}

/// A borrowed connection. Returned to the pool on drop.
pub struct PooledConnection<'a, C: GatewayConnector> {
    connection: Option<C::Connection>,
    pool: &'a GatewayPool<C>,
    _permit: OwnedSemaphorePermit,
}

impl<C: GatewayConnector> PooledConnection<'_, C> {
    /// Issues an originate command on the borrowed session.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error; the session is then checked for health
    /// when it goes back to the pool.
    pub async fn originate(&mut self, args: &str) -> Result<String, GatewayError> {
        match self.connection.as_mut() {
            Some(connection) => connection.originate(args).await,
            None => Err(GatewayError::PoolClosed),
        }
    }
}

impl<C: GatewayConnector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Checks that an outbound transmission can be written into an originate
/// command.
///
/// Numbers are digits with an optional leading `+`. The document reference
/// must not contain whitespace, control characters, braces or parentheses.
///
/// # Errors
///
/// `InvalidInput` naming the first offending field.
pub fn check_dial_fields(
    sender: &str,
    recipient: &str,
    reference: &str,
) -> Result<(), LifecycleError> {
    for (field, number) in [("sender", sender), ("recipient", recipient)] {
        let digits = number.strip_prefix('+').unwrap_or(number);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LifecycleError::invalid_input(
                field,
                format!("{number:?} is not a dialable number"),
            ));
        }
    }

    let unsafe_char = |c: char| c.is_whitespace() || c.is_control() || "{}()".contains(c);
    if reference.is_empty() || reference.chars().any(unsafe_char) {
        return Err(LifecycleError::invalid_input(
            "artifact",
            format!("{reference:?} cannot be passed to the gateway"),
        ));
    }
    Ok(())
}

/// Arguments of the gateway's originate command for a fax send.
///
/// # Errors
///
/// `InvalidInput` if a field fails [`check_dial_fields`].
pub fn originate_args(
    call_ref: &str,
    tx: &Transmission,
    use_ecm: bool,
) -> Result<String, LifecycleError> {
    check_dial_fields(&tx.sender, &tx.recipient, &tx.artifact.reference)?;

    Ok(format!(
        "{{origination_uuid={call_ref},ignore_early_media=true,absolute_codec_string='PCMU,PCMA',\
         fax_enable_t38=true,fax_verbose=true,fax_use_ecm={use_ecm},fax_enable_t38_request=false,\
         fax_ident={sender}}}sofia/gateway/{sender}/{recipient} &txfax({artifact})",
        sender = tx.sender,
        recipient = tx.recipient,
        artifact = tx.artifact.reference,
    ))
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Utc;
    use faxline_core::models::{ArtifactRef, Direction};

    use super::{testing::*, *};

    fn pool(gateway: &Arc<ScriptedGateway>, size: usize) -> GatewayPool<ScriptedConnector> {
        GatewayPool::new(ScriptedConnector(gateway.clone()), size, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let gateway = Arc::new(ScriptedGateway::default());
        let pool = pool(&gateway, 2);

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.originate("a").await.unwrap();
        }
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.originate("b").await.unwrap();
        }

        assert_eq!(gateway.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let gateway = Arc::new(ScriptedGateway::default());
        let pool = pool(&gateway, 1);

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, GatewayError::AcquireTimeout(_)));
    }

    #[tokio::test]
    async fn broken_connections_are_discarded() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.fail_originate.store(true, Ordering::SeqCst);
        let pool = pool(&gateway, 1);

        {
            let mut conn = pool.acquire().await.unwrap();
            assert!(conn.originate("x").await.is_err());
        }

        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let gateway = Arc::new(ScriptedGateway::default());
        let pool = pool(&gateway, 1);
        pool.close();

        assert!(matches!(pool.acquire().await.err().unwrap(), GatewayError::PoolClosed));
    }

    #[test]
    fn originate_args_match_gateway_syntax() {
        let tx = Transmission::new(
            Direction::Outbound,
            "12125551234",
            "13105551234",
            ArtifactRef::new("/var/spool/fax/a.tiff", 1, "00"),
            3,
            Utc::now(),
        );

        let args = originate_args("call-9", &tx, false).unwrap();

        assert_eq!(
            args,
            "{origination_uuid=call-9,ignore_early_media=true,absolute_codec_string='PCMU,PCMA',\
             fax_enable_t38=true,fax_verbose=true,fax_use_ecm=false,fax_enable_t38_request=false,\
             fax_ident=12125551234}sofia/gateway/12125551234/13105551234 &txfax(/var/spool/fax/a.tiff)"
        );
    }

    #[test]
    fn originate_args_refuse_command_injection() {
        let mut tx = Transmission::new(
            Direction::Outbound,
            "12125551234",
            "13105551234",
            ArtifactRef::new("a.tiff", 1, "00"),
            3,
            Utc::now(),
        );
        tx.recipient = "13105551234\n\napi system touch /tmp/x".to_string();
        assert!(matches!(
            originate_args("call-1", &tx, true),
            Err(LifecycleError::InvalidInput { field: "recipient", .. })
        ));

        tx.recipient = "+13105551234".to_string();
        tx.artifact.reference = "a.tiff)\n\napi system".to_string();
        assert!(matches!(
            originate_args("call-1", &tx, true),
            Err(LifecycleError::InvalidInput { field: "artifact", .. })
        ));
    }
}
