//! The per-connection processing loop.
//!
//! ```text
//! Connecting -> Connected -> Receiving <-> Dispatching -> Disconnecting -> Disconnected
//! ```
//!
//! Cancellation is two-staged. When the caller's shutdown token or the
//! inactivity timer fires, the watchdog first sends a close frame, and only
//! once that completed fires the connection's disconnect token, which
//! aborts the pending receive and every send still in flight.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::ServerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ProtocolError, Result, RpcError};
use crate::handler::{dispatch_message, Dispatcher};
use crate::protocol::{MessageReader, KEEP_ALIVE_FRAME};
use crate::time::InactivityTimer;
use crate::transport::{receive_message, Received, TransportState};

/// Run `connection` until the peer closes it, a fatal error occurs or
/// `shutdown` fires.
pub(super) async fn process_connection<D>(
    dispatcher: &D,
    config: &ServerConfig,
    connection: &Connection,
    shutdown: &CancellationToken,
) -> Result<()>
where
    D: Dispatcher + ?Sized,
{
    if shutdown.is_cancelled() {
        return Err(RpcError::Cancelled);
    }
    if connection.state() != ConnectionState::Connecting || connection.is_disconnected() {
        return Err(RpcError::InvalidState("connection was already processed"));
    }

    let timer = config
        .inactivity_timeout
        .map(|timeout| InactivityTimer::start(config.clock.clone(), timeout));
    let watchdog = Watchdog::spawn(
        connection.clone(),
        shutdown.clone(),
        timer.as_ref().map(InactivityTimer::expired),
    );

    connection.set_state(ConnectionState::Connected);
    if let Err(e) = dispatcher.on_connected(connection).await {
        connection.cancel();
        drop(watchdog);
        drop(timer);
        connection.set_state(ConnectionState::Disconnected);
        let result = Err(e);
        log_exit(connection, &result);
        return result;
    }

    let result = receive_loop(dispatcher, config, connection, timer.as_ref()).await;

    connection.set_state(ConnectionState::Disconnecting);
    connection.cancel();
    dispatcher.on_disconnected(connection).await;
    drop(watchdog);
    let expired = timer.as_ref().is_some_and(InactivityTimer::is_expired);
    drop(timer);
    connection.set_state(ConnectionState::Disconnected);

    let result = match result {
        Ok(()) if shutdown.is_cancelled() || expired => Err(RpcError::Cancelled),
        result => result,
    };
    if expired {
        debug!(connection = connection.id(), "inactivity deadline passed");
    }
    log_exit(connection, &result);
    result
}

async fn receive_loop<D>(
    dispatcher: &D,
    config: &ServerConfig,
    connection: &Connection,
    timer: Option<&InactivityTimer>,
) -> Result<()>
where
    D: Dispatcher + ?Sized,
{
    let transport = connection.transport().as_ref();
    let cancel = connection.disconnected();
    let mut reader = MessageReader::new(config.receive_buffer.clone());
    if let Some(max) = config.max_parameter_size {
        reader = reader.with_max_parameter_size(max);
    }

    connection.send_raw(&KEEP_ALIVE_FRAME).await?;
    trace!(connection = connection.id(), "handshake sent");

    while transport.state() == TransportState::Open {
        connection.set_state(ConnectionState::Receiving);
        if receive_message(transport, &mut reader, &cancel).await? == Received::Close {
            debug!(connection = connection.id(), "peer closed the connection");
            if let Err(e) = transport.close_output().await {
                debug!(connection = connection.id(), error = %e, "close acknowledgement failed");
            }
            return Ok(());
        }

        connection.set_state(ConnectionState::Dispatching);
        let result = dispatch_message(dispatcher, connection, &mut reader, || match timer {
            Some(timer) => {
                timer.reset();
                Ok(())
            }
            None => Err(ProtocolError::UnexpectedKeepAlive.into()),
        })
        .await;
        reader.reset();
        result?;
    }
    Ok(())
}

/// Background task closing the connection on shutdown or inactivity.
///
/// Aborted on drop.
struct Watchdog {
    task: JoinHandle<()>,
}

impl Watchdog {
    fn spawn(
        connection: Connection,
        shutdown: CancellationToken,
        expired: Option<CancellationToken>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let disconnected = connection.disconnected();
            let inactive = async {
                match &expired {
                    Some(expired) => expired.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = disconnected.cancelled() => return,
                _ = shutdown.cancelled() => {
                    debug!(connection = connection.id(), "shutdown requested, closing connection");
                }
                _ = inactive => {
                    debug!(connection = connection.id(), "no keep-alive received, closing connection");
                }
            }

            if let Err(e) = connection.transport().close_output().await {
                debug!(connection = connection.id(), error = %e, "close frame failed");
            }
            connection.cancel();
        });
        Self { task }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn log_exit(connection: &Connection, result: &Result<()>) {
    match result {
        Ok(()) => debug!(connection = connection.id(), "connection closed"),
        Err(e) if e.is_cancelled() => debug!(connection = connection.id(), "connection cancelled"),
        Err(e) if e.is_protocol() => {
            warn!(connection = connection.id(), error = %e, "protocol violation, connection terminated")
        }
        Err(e) => error!(connection = connection.id(), error = %e, "connection failed"),
    }
}
