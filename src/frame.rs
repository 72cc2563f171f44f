//! Frame reading: header-block parsing and length-delimited body extraction

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::constants::{HEADER_CONTENT_LENGTH, MAX_BODY_SIZE};
use crate::error::{FrameError, FrameErrorKind};
use crate::event::{Event, EventHeaders};

/// Read one protocol frame from a byte source positioned at a frame start.
///
/// Reads `Name: value` header lines until a blank line, then — if a
/// `Content-Length` header is present — exactly that many body bytes.
/// The body is never self-terminating: a fixed-size read is driven by the
/// declared length, and truncation is detected by short read only.
///
/// Every failure path returns a [`FrameError`] carrying the best-effort
/// partial event: headers parsed so far, and for short reads a body buffer
/// allocated at the declared length with the received prefix filled in.
pub async fn read_frame<R>(reader: &mut R) -> Result<Event, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = EventHeaders::new();
    let mut bad_line: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let n = match reader
            .read_line(&mut line)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                return Err(FrameError::new(
                    Event {
                        headers,
                        body: None,
                    },
                    FrameErrorKind::Io(e),
                ))
            }
        };
        if n == 0 {
            return Err(FrameError::new(
                Event {
                    headers,
                    body: None,
                },
                FrameErrorKind::UnexpectedEof(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside header block",
                )),
            ));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        match trimmed.split_once(':') {
            Some((name, value)) => {
                headers.insert(name.trim(), value.trim());
            }
            None => {
                // Keep scanning to the blank line; the block is still
                // delimiter-terminated, so alignment holds. Reported once
                // the frame is fully consumed.
                bad_line.get_or_insert_with(|| trimmed.to_string());
            }
        }
    }

    let declared_raw = headers
        .get_raw(HEADER_CONTENT_LENGTH)
        .map(|s| s.to_string());

    let body = match declared_raw {
        None => None,
        Some(raw) => {
            let declared: usize = match raw
                .trim()
                .parse()
            {
                Ok(n) => n,
                Err(_) => {
                    return Err(FrameError::new(
                        Event {
                            headers,
                            body: None,
                        },
                        FrameErrorKind::InvalidContentLength(raw),
                    ))
                }
            };
            if declared > MAX_BODY_SIZE {
                return Err(FrameError::new(
                    Event {
                        headers,
                        body: None,
                    },
                    FrameErrorKind::OversizedBody {
                        declared,
                        limit: MAX_BODY_SIZE,
                    },
                ));
            }

            // Allocate at the declared length up front; a truncated stream
            // still yields a buffer of exactly this size.
            let mut buf = vec![0u8; declared];
            let mut filled = 0;
            while filled < declared {
                match reader
                    .read(&mut buf[filled..])
                    .await
                {
                    Ok(0) => {
                        return Err(FrameError::new(
                            Event {
                                headers,
                                body: Some(buf),
                            },
                            FrameErrorKind::UnexpectedEof(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                format!("body truncated at {filled} of {declared} bytes"),
                            )),
                        ))
                    }
                    Ok(n) => filled += n,
                    Err(e) => {
                        return Err(FrameError::new(
                            Event {
                                headers,
                                body: Some(buf),
                            },
                            FrameErrorKind::Io(e),
                        ))
                    }
                }
            }
            Some(buf)
        }
    };

    let event = Event { headers, body };
    match bad_line {
        Some(bad) => Err(FrameError::new(event, FrameErrorKind::MalformedHeader(bad))),
        None => Ok(event),
    }
}

/// Parse a `text/event-plain` payload into an event.
///
/// The payload of a plain-format event is itself a header block plus an
/// optional inner body, framed the same way as the outer frame.
pub async fn parse_event_body(mut payload: &[u8]) -> Result<Event, FrameError> {
    read_frame(&mut payload).await
}

/// Build an event from a `text/event-json` payload.
///
/// The JSON is kept opaque: the event carries an empty header collection and
/// the payload verbatim as its body. Callers that need the embedded fields
/// use [`Event::json_body`].
pub fn json_event(payload: &[u8]) -> Event {
    Event {
        headers: EventHeaders::new(),
        body: Some(payload.to_vec()),
    }
}
