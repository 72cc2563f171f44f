//! Outbound mode: accept connections initiated by the server
//!
//! In outbound mode the switch dials us with a connection dedicated to one
//! call. We answer with `connect`; the reply is the channel-data frame
//! carrying the call's variables as headers.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::time::timeout;

use crate::command::simple_command;
use crate::connection::{
    split_transport, Connection, ConnectionOptions, FrameReader, FrameWriter,
};
use crate::constants::{CONTENT_TYPE_COMMAND_REPLY, HEADER_CONTENT_TYPE};
use crate::error::{EslError, EslResult};
use crate::event::Event;
use crate::frame::read_frame;

/// Accepts outbound connections from the switch.
#[derive(Debug)]
pub struct OutboundListener {
    listener: TcpListener,
    options: ConnectionOptions,
}

impl OutboundListener {
    /// Bind `addr` with default options.
    pub async fn bind(addr: impl ToSocketAddrs) -> EslResult<Self> {
        Self::bind_with_options(addr, ConnectionOptions::default()).await
    }

    /// Bind `addr` with explicit options, applied to every accepted
    /// connection.
    pub async fn bind_with_options(
        addr: impl ToSocketAddrs,
        options: ConnectionOptions,
    ) -> EslResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, options })
    }

    /// The bound local address. Useful after binding port 0.
    pub fn local_addr(&self) -> EslResult<SocketAddr> {
        Ok(self
            .listener
            .local_addr()?)
    }

    /// Accept one connection and run the `connect` handshake.
    ///
    /// Returns the established connection and the channel-data event
    /// describing the call that triggered it.
    pub async fn accept(&self) -> EslResult<(Connection, Event)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await?;
        stream.set_nodelay(true)?;
        self.options
            .logger
            .debug(&format!("accepted outbound connection from {peer}"));
        accept_transport(
            stream,
            self.options
                .clone(),
        )
        .await
    }
}

/// Run the outbound `connect` handshake over an arbitrary transport, then
/// start the connection.
pub async fn accept_transport(
    transport: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
    options: ConnectionOptions,
) -> EslResult<(Connection, Event)> {
    let (mut reader, mut writer) = split_transport(transport);
    let channel_data = timeout(
        options.handshake_timeout,
        handshake(&mut reader, &mut writer),
    )
    .await
    .map_err(|_| EslError::Timeout {
        timeout: options.handshake_timeout,
    })??;
    Ok((
        Connection::from_parts(reader, writer, options),
        channel_data,
    ))
}

async fn handshake(reader: &mut FrameReader, writer: &mut FrameWriter) -> EslResult<Event> {
    let wire = simple_command("connect")?;
    writer
        .write_all(wire.as_bytes())
        .await?;
    writer
        .flush()
        .await?;

    let channel_data = read_frame(reader).await?;
    let content_type = channel_data.header(HEADER_CONTENT_TYPE);
    if content_type != CONTENT_TYPE_COMMAND_REPLY {
        return Err(EslError::protocol(format!(
            "expected channel data, got {content_type:?}"
        )));
    }
    Ok(channel_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_connect_handshake_returns_channel_data() {
        let (client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = [0u8; 9];
            server
                .read_exact(&mut buf)
                .await
                .unwrap();
            assert_eq!(&buf, b"connect\n\n");
            server
                .write_all(
                    b"Content-Type: command/reply\n\
                      Unique-ID: 1c812070-39ba-4e1c-8a25-89ac6e8d4637\n\
                      Caller-Caller-ID-Number: 1006\n\n",
                )
                .await
                .unwrap();
            server
        });

        let (connection, channel_data) =
            accept_transport(client, ConnectionOptions::default())
                .await
                .unwrap();
        assert!(connection.is_connected());
        assert_eq!(
            channel_data.header("Unique-ID"),
            "1c812070-39ba-4e1c-8a25-89ac6e8d4637"
        );
        assert_eq!(channel_data.header("Caller-Caller-ID-Number"), "1006");
    }

    #[tokio::test]
    async fn test_unexpected_handshake_reply() {
        let (client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = [0u8; 9];
            server
                .read_exact(&mut buf)
                .await
                .unwrap();
            server
                .write_all(b"Content-Type: text/disconnect-notice\n\n")
                .await
                .unwrap();
            server
        });

        let err = accept_transport(client, ConnectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Protocol { .. }));
    }
}
