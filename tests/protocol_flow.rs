//! End-to-end protocol flows over an in-memory duplex transport, with the
//! test body playing the server side of the wire.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use event_socket::{
    Connection, ConnectionOptions, ConnectionStatus, DisconnectReason, EslError, EventFilter,
};

/// A registration event captured from a live switch, as sent on the wire.
const MESSAGE_QUERY_FRAME: &str = "Content-Length: 483\r\nContent-Type: text/event-plain\r\n\r\nMessage-Account: sip%3A1006%4010.0.1.250\r\nEvent-Name: MESSAGE_QUERY\r\nCore-UUID: 2130a7d1-c1f7-44cd-8fae-8ed5946f3cec\r\nFreeSWITCH-Hostname: localhost.localdomain\r\nFreeSWITCH-IPv4: 10.0.1.250\r\nFreeSWITCH-IPv6: 127.0.0.1\r\nEvent-Date-Local: 2007-12-16%2022%3A29%3A59\r\nEvent-Date-GMT: Mon,%2017%20Dec%202007%2004%3A29%3A59%20GMT\r\nEvent-Date-timestamp: 1197865799573052\r\nEvent-Calling-File: sofia_reg.c\r\nEvent-Calling-Function: sofia_reg_handle_register\r\nEvent-Calling-Line-Number: 603\r\n\r\n";

fn attach_pair() -> (Connection, DuplexStream) {
    let (client, server) = tokio::io::duplex(16 * 1024);
    (
        Connection::attach(client, ConnectionOptions::default()),
        server,
    )
}

/// Read one blank-line-terminated command frame off the server side.
async fn read_command(server: &mut DuplexStream) -> String {
    let mut received = Vec::new();
    let mut byte = [0u8; 1];
    while !received.ends_with(b"\n\n") {
        server
            .read_exact(&mut byte)
            .await
            .unwrap();
        received.push(byte[0]);
    }
    String::from_utf8(received).unwrap()
}

fn plain_event_frame(payload: &str) -> String {
    format!(
        "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
        payload.len(),
        payload
    )
}

#[tokio::test]
async fn test_plain_event_reaches_wildcard_listener() {
    let (connection, mut server) = attach_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.register_event_listener(EventFilter::All, move |event| {
        let _ = tx.send(event);
    });

    server
        .write_all(MESSAGE_QUERY_FRAME.as_bytes())
        .await
        .unwrap();

    let event = rx
        .recv()
        .await
        .unwrap();
    assert_eq!(event.name(), "MESSAGE_QUERY");
    assert_eq!(event.header_count(), 12);
    assert_eq!(event.header("Message-Account"), "sip:1006@10.0.1.250");
    assert_eq!(
        event.header_raw("Message-Account"),
        Some("sip%3A1006%4010.0.1.250")
    );
    assert_eq!(
        event.header("Event-Date-GMT"),
        "Mon, 17 Dec 2007 04:29:59 GMT"
    );
}

#[tokio::test]
async fn test_named_listener_and_unregister() {
    let (connection, mut server) = attach_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = connection.register_event_listener("MESSAGE_QUERY", move |event| {
        let _ = tx.send(event);
    });

    server
        .write_all(MESSAGE_QUERY_FRAME.as_bytes())
        .await
        .unwrap();
    assert_eq!(
        rx.recv()
            .await
            .unwrap()
            .name(),
        "MESSAGE_QUERY"
    );

    connection.unregister_event_listener(id);
    server
        .write_all(MESSAGE_QUERY_FRAME.as_bytes())
        .await
        .unwrap();
    // Give the reader a chance to dispatch before checking silence.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx
        .try_recv()
        .is_err());
}

#[tokio::test]
async fn test_replies_pair_fifo_with_interleaved_event() {
    let (connection, mut server) = attach_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.register_event_listener(EventFilter::All, move |event| {
        let _ = tx.send(event);
    });

    let first = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_recv("api status").await })
    };
    assert_eq!(read_command(&mut server).await, "api status\n\n");

    let second = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_recv("api version").await })
    };
    assert_eq!(read_command(&mut server).await, "api version\n\n");

    // An event between the two replies must not disturb the pairing.
    server
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK first\n\n")
        .await
        .unwrap();
    server
        .write_all(MESSAGE_QUERY_FRAME.as_bytes())
        .await
        .unwrap();
    server
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK second\n\n")
        .await
        .unwrap();

    assert_eq!(
        first
            .await
            .unwrap()
            .unwrap()
            .header("Reply-Text"),
        "+OK first"
    );
    assert_eq!(
        second
            .await
            .unwrap()
            .unwrap()
            .header("Reply-Text"),
        "+OK second"
    );
    assert_eq!(
        rx.recv()
            .await
            .unwrap()
            .name(),
        "MESSAGE_QUERY"
    );
}

#[tokio::test]
async fn test_late_reply_for_timed_out_command_is_discarded() {
    let (connection, mut server) = attach_pair();

    let err = connection
        .send_recv_timeout("api status", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, EslError::Timeout { .. }));
    assert_eq!(read_command(&mut server).await, "api status\n\n");

    // The reply for the timed-out command arrives late; it must be consumed
    // and discarded, not delivered to the next command.
    server
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK late\n\n")
        .await
        .unwrap();

    let next = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_recv("api version").await })
    };
    assert_eq!(read_command(&mut server).await, "api version\n\n");
    server
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK fresh\n\n")
        .await
        .unwrap();

    assert_eq!(
        next.await
            .unwrap()
            .unwrap()
            .header("Reply-Text"),
        "+OK fresh"
    );
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_background_job_completion() {
    let (connection, mut server) = attach_pair();

    let job_task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .background_job("originate user/1000 &park")
                .await
        })
    };

    let wire = read_command(&mut server).await;
    let mut lines = wire
        .trim_end()
        .lines();
    assert_eq!(
        lines
            .next()
            .unwrap(),
        "bgapi originate user/1000 &park"
    );
    let job_id = lines
        .next()
        .unwrap()
        .strip_prefix("Job-UUID: ")
        .unwrap()
        .to_string();

    let ack = format!(
        "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {job_id}\n\n"
    );
    server
        .write_all(ack.as_bytes())
        .await
        .unwrap();

    let job = job_task
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.job_id(), job_id);
    assert!(job
        .acknowledgement()
        .header("Reply-Text")
        .starts_with("+OK"));

    let payload = format!(
        "Event-Name: BACKGROUND_JOB\nJob-UUID: {job_id}\nContent-Length: 8\n\n+OK done"
    );
    server
        .write_all(
            plain_event_frame(&payload)
                .as_bytes(),
        )
        .await
        .unwrap();

    let completion = job
        .wait(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(completion.header("Job-UUID"), job_id);
    assert_eq!(completion.body(), Some(&b"+OK done"[..]));
}

#[tokio::test]
async fn test_unclaimed_job_completion_goes_to_listeners() {
    let (connection, mut server) = attach_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.register_event_listener("BACKGROUND_JOB", move |event| {
        let _ = tx.send(event);
    });

    let payload = "Event-Name: BACKGROUND_JOB\nJob-UUID: not-ours\n\n";
    server
        .write_all(
            plain_event_frame(payload)
                .as_bytes(),
        )
        .await
        .unwrap();

    let event = rx
        .recv()
        .await
        .unwrap();
    assert_eq!(event.header("Job-UUID"), "not-ours");
}

#[tokio::test]
async fn test_json_event_payload_stays_opaque() {
    let (connection, mut server) = attach_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.register_event_listener(EventFilter::All, move |event| {
        let _ = tx.send(event);
    });

    let payload = r#"{"Event-Name":"HEARTBEAT","Up-Time":"0 years"}"#;
    let frame = format!(
        "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
        payload.len(),
        payload
    );
    server
        .write_all(frame.as_bytes())
        .await
        .unwrap();

    let event = rx
        .recv()
        .await
        .unwrap();
    assert_eq!(event.header_count(), 0);
    assert_eq!(event.name(), "");
    assert_eq!(
        event
            .json_body()
            .unwrap()["Event-Name"],
        "HEARTBEAT"
    );
}

#[tokio::test]
async fn test_malformed_header_line_does_not_kill_connection() {
    let (connection, mut server) = attach_pair();

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_recv("api status").await })
    };
    let _ = read_command(&mut server).await;

    server
        .write_all(
            b"Content-Type: command/reply\ngarbage line without colon\nReply-Text: +OK\n\n",
        )
        .await
        .unwrap();

    assert_eq!(
        pending
            .await
            .unwrap()
            .unwrap()
            .header("Reply-Text"),
        "+OK"
    );
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_bad_content_length_closes_connection() {
    let (connection, mut server) = attach_pair();
    server
        .write_all(b"Content-Type: text/event-plain\nContent-Length: nope\n\n")
        .await
        .unwrap();
    assert!(matches!(
        connection
            .closed()
            .await,
        DisconnectReason::FramingError(_)
    ));
}

#[tokio::test]
async fn test_disconnect_notice_tears_down() {
    let (connection, mut server) = attach_pair();

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_recv("api status").await })
    };
    let _ = read_command(&mut server).await;

    server
        .write_all(b"Content-Type: text/disconnect-notice\n\n")
        .await
        .unwrap();

    assert!(matches!(
        pending
            .await
            .unwrap()
            .unwrap_err(),
        EslError::ConnectionClosed
    ));
    assert_eq!(
        connection
            .closed()
            .await,
        DisconnectReason::ServerNotice
    );
    assert!(!connection.is_connected());
    assert!(matches!(
        connection
            .send("api status")
            .await
            .unwrap_err(),
        EslError::ConnectionClosed
    ));
}

#[tokio::test]
async fn test_peer_close_at_frame_boundary() {
    let (connection, server) = attach_pair();
    drop(server);
    assert_eq!(
        connection
            .closed()
            .await,
        DisconnectReason::ConnectionClosed
    );
}

#[tokio::test]
async fn test_no_listener_dispatch_after_close() {
    let (connection, mut server) = attach_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.register_event_listener(EventFilter::All, move |event| {
        let _ = tx.send(event);
    });

    connection
        .close()
        .await;

    // The peer keeps sending after local close; nothing may reach the
    // listeners.
    let _ = server
        .write_all(
            plain_event_frame("Event-Name: HEARTBEAT\n\n")
                .as_bytes(),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx
        .try_recv()
        .is_err());
    assert!(!connection.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_listener_does_not_stall_frame_ingestion() {
    let (connection, mut server) = attach_pair();

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    connection.register_event_listener(EventFilter::All, move |_| {
        let _ = entered_tx.send(());
        let _ = release_rx
            .lock()
            .unwrap()
            .recv();
    });

    server
        .write_all(MESSAGE_QUERY_FRAME.as_bytes())
        .await
        .unwrap();
    // The callback is now parked mid-dispatch.
    entered_rx
        .recv()
        .await
        .unwrap();

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_recv("api status").await })
    };
    assert_eq!(read_command(&mut server).await, "api status\n\n");
    server
        .write_all(b"Content-Type: command/reply\nReply-Text: +OK while blocked\n\n")
        .await
        .unwrap();

    assert_eq!(
        pending
            .await
            .unwrap()
            .unwrap()
            .header("Reply-Text"),
        "+OK while blocked"
    );
    release_tx
        .send(())
        .unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (connection, _server) = attach_pair();
    connection
        .close()
        .await;
    connection
        .close()
        .await;
    assert_eq!(
        connection.status(),
        ConnectionStatus::Disconnected(DisconnectReason::ClientRequested)
    );
    assert!(matches!(
        connection
            .send_recv("api status")
            .await
            .unwrap_err(),
        EslError::ConnectionClosed
    ));
}
