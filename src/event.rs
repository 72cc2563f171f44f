//! Event representation: headers and opaque body

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use percent_encoding::percent_decode_str;

use crate::constants::HEADER_EVENT_NAME;

/// Ordered, case-insensitive, multi-valued header collection.
///
/// The protocol may repeat a header, and header names match regardless of
/// case. Values are stored exactly as they arrived on the wire;
/// percent-decoding is deferred to the read accessors.
#[derive(Debug, Clone, Default)]
pub struct EventHeaders {
    // Insertion-ordered entries; `index` maps the lowercased name to a slot.
    entries: Vec<HeaderEntry>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    /// Name with the casing it first arrived with.
    name: String,
    /// Raw wire values, in arrival order.
    values: Vec<String>,
}

impl EventHeaders {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `name`, preserving any existing values.
    pub fn insert(&mut self, name: impl Into<String>, raw_value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&slot) => {
                self.entries[slot]
                    .values
                    .push(raw_value.into());
            }
            None => {
                self.index
                    .insert(key, self.entries.len());
                self.entries
                    .push(HeaderEntry {
                        name,
                        values: vec![raw_value.into()],
                    });
            }
        }
    }

    /// Case-insensitive membership test.
    pub fn contains(&self, name: &str) -> bool {
        self.index
            .contains_key(&name.to_ascii_lowercase())
    }

    /// First raw wire value for `name`, matched case-insensitively.
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        let slot = *self
            .index
            .get(&name.to_ascii_lowercase())?;
        self.entries[slot]
            .values
            .first()
            .map(|s| s.as_str())
    }

    /// All raw wire values for `name`, in arrival order.
    pub fn get_all_raw(&self, name: &str) -> &[String] {
        match self
            .index
            .get(&name.to_ascii_lowercase())
        {
            Some(&slot) => &self.entries[slot].values,
            None => &[],
        }
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries
            .len()
    }

    /// Whether no headers are present.
    pub fn is_empty(&self) -> bool {
        self.entries
            .is_empty()
    }

    /// Iterate `(name, raw values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.values.as_slice()))
    }
}

/// Percent-decode a raw wire value, falling back to the raw form when the
/// escape sequences are invalid.
fn decode_value(raw: &str) -> Cow<'_, str> {
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded,
        Err(_) => Cow::Borrowed(raw),
    }
}

/// One parsed protocol frame: a header collection plus an opaque body.
///
/// Headers and body are immutable once parsed. Header values are stored in
/// raw wire form and percent-decoded lazily by [`Event::header`].
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub(crate) headers: EventHeaders,
    pub(crate) body: Option<Vec<u8>>,
}

impl Event {
    /// Create an empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive header membership test. Absence is silent, not an error.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .contains(name)
    }

    /// First value for a case-insensitively matched header, percent-decoded.
    ///
    /// Returns an empty string when the header is absent.
    pub fn header(&self, name: &str) -> String {
        self.headers
            .get_raw(name)
            .map(|raw| decode_value(raw).into_owned())
            .unwrap_or_default()
    }

    /// First raw wire value for a header, without percent-decoding.
    pub fn header_raw(&self, name: &str) -> Option<&str> {
        self.headers
            .get_raw(name)
    }

    /// All values for a header, percent-decoded, in arrival order.
    pub fn header_all(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all_raw(name)
            .iter()
            .map(|raw| decode_value(raw).into_owned())
            .collect()
    }

    /// Number of distinct header names.
    pub fn header_count(&self) -> usize {
        self.headers
            .len()
    }

    /// The header collection.
    pub fn headers(&self) -> &EventHeaders {
        &self.headers
    }

    /// Shorthand for the `Event-Name` header. Empty for unnamed frames
    /// (command replies, JSON-format events).
    pub fn name(&self) -> String {
        self.header(HEADER_EVENT_NAME)
    }

    /// The opaque body, if one was declared.
    pub fn body(&self) -> Option<&[u8]> {
        self.body
            .as_deref()
    }

    /// Body as UTF-8 text, lossily converted.
    pub fn body_str(&self) -> Option<Cow<'_, str>> {
        self.body
            .as_deref()
            .map(String::from_utf8_lossy)
    }

    /// Parse the body as JSON.
    ///
    /// JSON-format events arrive with an empty header collection and the
    /// whole payload as the body; callers that need the embedded fields
    /// parse them with this.
    pub fn json_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(
            self.body
                .as_deref()
                .unwrap_or_default(),
        )
    }
}

/// Diagnostic rendering: event name, one `Name: value` line per header value
/// in insertion order, a blank separator, then the raw body. Not a wire
/// format; no round-trip guarantee.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name())?;
        for (name, values) in self
            .headers
            .iter()
        {
            for value in values {
                writeln!(f, "{}: {}", name, value)?;
            }
        }
        writeln!(f)?;
        if let Some(body) = self.body_str() {
            f.write_str(&body)?;
        }
        Ok(())
    }
}
