//! Protocol constants and configuration values

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_PORT: u16 = 8021;

/// Maximum declared body size (8MB) - validates Content-Length header
/// No legitimate ESL message should exceed this (largest is sofia status ~1-2MB)
pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Protocol message terminators
pub const COMMAND_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header: message classification.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
/// Event payload header: event name.
pub const HEADER_EVENT_NAME: &str = "Event-Name";
/// Event payload header: background job correlation id.
pub const HEADER_JOB_UUID: &str = "Job-UUID";

/// Event name carried by background job completion events.
pub const EVENT_BACKGROUND_JOB: &str = "BACKGROUND_JOB";

/// Default timeout for a command reply (5 seconds)
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// Default timeout for the connect/auth handshake (2 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2000;
