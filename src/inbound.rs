//! Inbound mode: dial the server and authenticate
//!
//! The server greets with an `auth/request` frame; the client answers with
//! `auth <password>` and expects a `+OK` reply. The handshake runs before the
//! background read loop starts, so its frames never race listener dispatch.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::command::simple_command;
use crate::connection::{
    split_transport, Connection, ConnectionOptions, FrameReader, FrameWriter,
};
use crate::constants::{CONTENT_TYPE_AUTH_REQUEST, HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT};
use crate::error::{EslError, EslResult};
use crate::frame::read_frame;

/// Dial `addr` and authenticate, with default options.
pub async fn connect(addr: impl ToSocketAddrs, password: &str) -> EslResult<Connection> {
    connect_with_options(addr, password, ConnectionOptions::default()).await
}

/// Dial `addr` and authenticate, with explicit options.
pub async fn connect_with_options(
    addr: impl ToSocketAddrs,
    password: &str,
    options: ConnectionOptions,
) -> EslResult<Connection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    authenticate(stream, password, options).await
}

/// Run the inbound auth handshake over an arbitrary transport, then start
/// the connection. This is what `connect` uses once the TCP stream is up.
pub async fn authenticate(
    transport: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
    password: &str,
    options: ConnectionOptions,
) -> EslResult<Connection> {
    let (mut reader, mut writer) = split_transport(transport);
    timeout(
        options.handshake_timeout,
        handshake(&mut reader, &mut writer, password),
    )
    .await
    .map_err(|_| EslError::Timeout {
        timeout: options.handshake_timeout,
    })??;
    options
        .logger
        .debug("authenticated");
    Ok(Connection::from_parts(reader, writer, options))
}

async fn handshake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    password: &str,
) -> EslResult<()> {
    let greeting = read_frame(reader).await?;
    let content_type = greeting.header(HEADER_CONTENT_TYPE);
    if content_type != CONTENT_TYPE_AUTH_REQUEST {
        return Err(EslError::protocol(format!(
            "expected auth request, got {content_type:?}"
        )));
    }

    let wire = simple_command(&format!("auth {password}"))?;
    writer
        .write_all(wire.as_bytes())
        .await?;
    writer
        .flush()
        .await?;

    let reply = read_frame(reader).await?;
    let reply_text = reply.header(HEADER_REPLY_TEXT);
    if !reply_text.starts_with("+OK") {
        return Err(EslError::AuthFailed { reply: reply_text });
    }
    Ok(())
}
