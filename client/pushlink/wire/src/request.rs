//! Control-request encoding.
//!
//! Every control operation is serialized as ASCII `key=value` pairs joined by
//! `&`, with keys emitted in lexicographic order so that encoded requests are
//! byte-stable and usable as test fixtures. The request-ID key (`LS_reqId`)
//! and operation key (`LS_op`) are present on every request.

use std::collections::BTreeMap;
use std::fmt::Write;

/// Subscription delivery modes accepted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Field-merging updates per item
    Merge,
    /// Every update delivered distinctly
    Distinct,
    /// Key-based add/update/delete command streams
    Command,
    /// Unfiltered raw updates
    Raw,
}

impl SubscriptionMode {
    /// Wire token for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Merge => "MERGE",
            SubscriptionMode::Distinct => "DISTINCT",
            SubscriptionMode::Command => "COMMAND",
            SubscriptionMode::Raw => "RAW",
        }
    }
}

/// A numbered control request bound for the server.
///
/// The request ID is assigned exactly once when the request is created and is
/// reused verbatim on every retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    req_id: u64,
    op: &'static str,
    params: BTreeMap<&'static str, String>,
}

impl ControlRequest {
    fn new(req_id: u64, op: &'static str) -> Self {
        Self {
            req_id,
            op,
            params: BTreeMap::new(),
        }
    }

    fn param(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.params.insert(key, value.into());
        self
    }

    /// Session-create request carrying credentials and the adapter set.
    pub fn create_session(
        req_id: u64,
        adapter_set: &str,
        user: Option<&str>,
        password: Option<&str>,
        keepalive_millis: u64,
    ) -> Self {
        let mut req = Self::new(req_id, "create")
            .param("LS_adapter_set", adapter_set)
            .param("LS_keepalive_millis", keepalive_millis.to_string());
        if let Some(user) = user {
            req = req.param("LS_user", user);
        }
        if let Some(password) = password {
            req = req.param("LS_password", password);
        }
        req
    }

    /// Bind request reattaching the data connection to an existing session.
    ///
    /// `recovery_from` carries the last acknowledged progress marker when the
    /// bind is a recovery attempt rather than a plain rebind.
    pub fn bind_session(
        req_id: u64,
        session_id: &str,
        recovery_from: Option<u64>,
        keepalive_millis: u64,
    ) -> Self {
        let mut req = Self::new(req_id, "bind")
            .param("LS_session", session_id)
            .param("LS_keepalive_millis", keepalive_millis.to_string());
        if let Some(progress) = recovery_from {
            req = req.param("LS_recovery_from", progress.to_string());
        }
        req
    }

    /// Subscribe request for an item group and field schema.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        req_id: u64,
        sub_id: u64,
        session_id: &str,
        items: &[String],
        fields: &[String],
        mode: SubscriptionMode,
        snapshot: bool,
    ) -> Self {
        Self::new(req_id, "add")
            .param("LS_subId", sub_id.to_string())
            .param("LS_session", session_id)
            .param("LS_group", items.join(" "))
            .param("LS_schema", fields.join(" "))
            .param("LS_mode", mode.as_str())
            .param("LS_snapshot", if snapshot { "true" } else { "false" })
    }

    /// Unsubscribe request for a previously subscribed id.
    pub fn unsubscribe(req_id: u64, sub_id: u64, session_id: &str) -> Self {
        Self::new(req_id, "delete")
            .param("LS_subId", sub_id.to_string())
            .param("LS_session", session_id)
    }

    /// Point-to-point message submission.
    pub fn message(
        req_id: u64,
        session_id: &str,
        text: &str,
        sequence: &str,
        msg_prog: u64,
        needs_ack: bool,
    ) -> Self {
        let mut req = Self::new(req_id, "msg")
            .param("LS_session", session_id)
            .param("LS_message", text)
            .param("LS_sequence", sequence)
            .param("LS_msg_prog", msg_prog.to_string());
        if needs_ack {
            req = req.param("LS_ack", "true");
        }
        req
    }

    /// Client-initiated keep-alive sent on the reverse-heartbeat timer.
    pub fn heartbeat(req_id: u64, session_id: &str) -> Self {
        Self::new(req_id, "heartbeat").param("LS_session", session_id)
    }

    /// Bandwidth constraint request.
    pub fn constrain(req_id: u64, session_id: &str, max_bandwidth: f64) -> Self {
        Self::new(req_id, "constrain")
            .param("LS_session", session_id)
            .param("LS_requested_max_bandwidth", format!("{}", max_bandwidth))
    }

    /// The request ID assigned at creation.
    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    /// The operation token.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Serialize to wire text: lexicographically ordered `key=value` pairs
    /// joined by `&`, values percent-escaped.
    pub fn encode(&self) -> String {
        let mut pairs: BTreeMap<&str, String> = BTreeMap::new();
        pairs.insert("LS_reqId", self.req_id.to_string());
        pairs.insert("LS_op", self.op.to_string());
        for (key, value) in &self.params {
            pairs.insert(*key, value.clone());
        }

        let mut out = String::new();
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(&escape(value));
        }
        out
    }
}

/// Percent-escape a parameter value.
///
/// The delimiters (`&`, `=`), the escape character itself, CR/LF, and any
/// non-printable or non-ASCII byte are encoded as `%XX`.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'&' | b'=' | b'%' | b'\r' | b'\n' | b'|' | b',' => {
                let _ = write!(out, "%{:02X}", byte);
            }
            0x20..=0x7E => out.push(byte as char),
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_key_ordered_and_stable() {
        let req = ControlRequest::subscribe(
            7,
            2,
            "S1234",
            &["itemA".to_string(), "itemB".to_string()],
            &["bid".to_string(), "ask".to_string()],
            SubscriptionMode::Merge,
            true,
        );

        let encoded = req.encode();
        assert_eq!(
            encoded,
            "LS_group=itemA itemB&LS_mode=MERGE&LS_op=add&LS_reqId=7\
             &LS_schema=bid ask&LS_session=S1234&LS_snapshot=true&LS_subId=2"
        );
        // Encoding twice yields identical bytes.
        assert_eq!(encoded, req.encode());
    }

    #[test]
    fn test_escape_covers_delimiters() {
        assert_eq!(escape("a&b=c%d"), "a%26b%3Dc%25d");
        assert_eq!(escape("line\r\nbreak"), "line%0D%0Abreak");
        assert_eq!(escape("pipe|comma,"), "pipe%7Ccomma%2C");
        assert_eq!(escape("caf\u{e9}"), "caf%C3%A9");
    }

    #[test]
    fn test_message_request_carries_ack_flag() {
        let with_ack = ControlRequest::message(9, "S1", "hello", "seq", 3, true);
        assert!(with_ack.encode().contains("LS_ack=true"));

        let without_ack = ControlRequest::message(10, "S1", "hello", "seq", 4, false);
        assert!(!without_ack.encode().contains("LS_ack"));
    }

    #[test]
    fn test_bind_recovery_marker() {
        let plain = ControlRequest::bind_session(3, "S1", None, 5000);
        assert!(!plain.encode().contains("LS_recovery_from"));

        let recovery = ControlRequest::bind_session(4, "S1", Some(42), 5000);
        assert!(recovery.encode().contains("LS_recovery_from=42"));
        assert_eq!(recovery.op(), "bind");
    }
}
