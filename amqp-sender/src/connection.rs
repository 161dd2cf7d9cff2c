//! The broker connection owned by a sender

use std::sync::Arc;

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use crate::channel::PublishChannel;
use crate::error::{Error, Result};
use crate::notify::{ClosedCause, NotificationHub};
use crate::transport::{ConnectionEvents, Connector, Transport};

/// An open connection and its lifecycle signals.
///
/// The broker can close the connection at any time; the cause is
/// reported on the connection-closed subscription exactly once, and
/// afterwards [`TransportConnection::is_open`] is false. Nothing is
/// reconnected.
pub struct TransportConnection<T: Transport> {
    /// The wire connection
    transport: T,
    /// Signals for this connection
    events: ConnectionEvents,
}

impl<T: Transport> TransportConnection<T> {
    /// Open a connection with `connector`, reporting its signals to
    /// `hub`.
    ///
    /// # Errors
    /// [`Error::Connect`] if the connection couldn't be established
    pub async fn connect<C>(connector: &C, hub: Arc<NotificationHub>) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let events = ConnectionEvents::new(hub);
        let transport = connector
            .connect(events.clone())
            .await
            .map_err(|source| Error::Connect { source })?;
        debug!("Connection open");
        Ok(Self { transport, events })
    }

    /// True until the connection is closed by either side
    pub fn is_open(&self) -> bool {
        self.events.is_open()
    }

    /// Open a channel on this connection. The channel is closed when
    /// the connection closes.
    ///
    /// # Errors
    /// [`Error::Channel`] if the connection is closed or the broker
    /// refused the channel
    pub async fn open_channel(&self) -> Result<PublishChannel<T::Channel>> {
        if !self.is_open() {
            return Err(Error::Channel {
                source: "the connection is closed".into(),
            });
        }
        let events = self.events.channel_events();
        let channel = self
            .transport
            .open_channel(events.clone())
            .await
            .map_err(|source| Error::Channel { source })?;
        Ok(PublishChannel::new(channel, events))
    }

    /// Close the connection. Closing an already closed connection
    /// does nothing.
    ///
    /// # Errors
    /// [`Error::Close`] if the transport failed to close cleanly. The
    /// connection counts as closed anyway
    pub async fn close(&self) -> Result<()> {
        if !self.events.liveness().begin_close() {
            trace!("Connection already closed");
            return Ok(());
        }
        let result = self
            .transport
            .close()
            .await
            .map_err(|source| Error::Close {
                what: "connection",
                source,
            });
        self.events.closed(ClosedCause::Graceful);
        result
    }
}
