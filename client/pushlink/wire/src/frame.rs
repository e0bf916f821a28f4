//! Typed streaming frames and per-kind token parsing.
//!
//! Each frame is one CRLF-terminated line of comma-separated tokens; the
//! leading token names the kind. Parsing is strict: an unknown tag, a missing
//! token, or a malformed number is a [`ProtocolError`], never a silent skip.

use crate::error::ProtocolError;

/// One value slot in a differential update.
///
/// An omitted token means "unchanged since the previous update for this
/// item", which is distinct from an explicit null marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Field not present in this update
    Unchanged,
    /// Explicit null
    Null,
    /// Concrete value (percent-decoded)
    Value(String),
}

/// A decoded streaming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Session established: `CONOK,<session id>,<request limit>,<keepalive>,<control link>`
    SessionOk {
        /// Server-assigned opaque session identifier
        session_id: String,
        /// Maximum outstanding control requests the server accepts
        request_limit: u64,
        /// Keep-alive interval promised by the server, in milliseconds
        keepalive_millis: u64,
        /// Address to direct further binds to, `*` meaning "unchanged"
        control_link: Option<String>,
    },
    /// Session refused: `CONERR,<code>,<message>`
    SessionError {
        /// Server error code
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// Server identification: `SERVNAME,<name>`
    ServerName(String),
    /// Client address as seen by the server: `CLIENTIP,<ip>`
    ClientIp(String),
    /// Progress marker: `PROG,<count>`
    Progress(u64),
    /// Rebind invitation: `LOOP,<expected delay millis>`
    Loop {
        /// Delay the server suggests before rebinding
        expected_delay_millis: u64,
    },
    /// Session end: `END,<code>,<message>`
    End {
        /// Cause code; see [`end_is_recoverable`]
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// Subscription activated: `SUBOK,<subId>,<items>,<fields>`
    SubscribeOk {
        /// Subscription id echoed back
        sub_id: u64,
        /// Number of items in the group
        items: u64,
        /// Number of fields in the schema
        fields: u64,
    },
    /// Command-mode subscription activated: `SUBCMD,<subId>,<items>,<fields>,<key>,<cmd>`
    SubscribeCommand {
        /// Subscription id echoed back
        sub_id: u64,
        /// Number of items in the group
        items: u64,
        /// Number of fields in the schema
        fields: u64,
        /// 1-based position of the key field
        key_idx: u64,
        /// 1-based position of the command field
        command_idx: u64,
    },
    /// Subscription removed: `UNSUB,<subId>`
    UnsubscribeOk {
        /// Subscription id echoed back
        sub_id: u64,
    },
    /// Differential item update: `U,<subId>,<item>,<v1>|<v2>|...`
    Update {
        /// Subscription the update belongs to
        sub_id: u64,
        /// 1-based item position within the group
        item: u64,
        /// One slot per schema field, in schema order
        values: Vec<FieldValue>,
    },
    /// Lost-update report: `OV,<subId>,<item>,<lost>`
    Overflow {
        /// Subscription the report belongs to
        sub_id: u64,
        /// 1-based item position
        item: u64,
        /// Number of updates the server dropped
        lost: u64,
    },
    /// Snapshot complete for an item: `EOS,<subId>,<item>`
    EndOfSnapshot {
        /// Subscription id
        sub_id: u64,
        /// 1-based item position
        item: u64,
    },
    /// Snapshot invalidated for an item: `CS,<subId>,<item>`
    ClearSnapshot {
        /// Subscription id
        sub_id: u64,
        /// 1-based item position
        item: u64,
    },
    /// Subscription reconfiguration: `CONF,<subId>,<max frequency>`
    Configuration {
        /// Subscription id
        sub_id: u64,
        /// Effective maximum update frequency (`unlimited` or a number)
        max_frequency: String,
    },
    /// Message processed: `MSGDONE,<sequence>,<prog>`
    MessageDone {
        /// Sequence the message was submitted on
        sequence: String,
        /// Progressive number within the sequence
        prog: u64,
    },
    /// Message refused: `MSGFAIL,<sequence>,<prog>,<code>,<message>`
    MessageFail {
        /// Sequence the message was submitted on
        sequence: String,
        /// Progressive number within the sequence
        prog: u64,
        /// Server error code
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// Control request acknowledged: `REQOK,<reqId>`
    RequestOk {
        /// Request id echoed back
        req_id: u64,
    },
    /// Control request denied: `REQERR,<reqId>,<code>,<message>`
    RequestError {
        /// Request id echoed back
        req_id: u64,
        /// Server error code
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// Keep-alive marker: `PROBE`
    Probe,
    /// Padding frame, skipped silently
    Noop,
}

impl Frame {
    /// Parse one line (without its CRLF terminator) into a typed frame.
    pub fn parse(line: &str) -> Result<Frame, ProtocolError> {
        let tag = line.split(',').next().unwrap_or("");
        match tag {
            "CONOK" => {
                let t = tokens(line, "CONOK", 5)?;
                Ok(Frame::SessionOk {
                    session_id: t[1].to_string(),
                    request_limit: number("CONOK", t[2])?,
                    keepalive_millis: number("CONOK", t[3])?,
                    control_link: match t[4] {
                        "*" => None,
                        link => Some(link.to_string()),
                    },
                })
            }
            "CONERR" => {
                let t = tokens_trailing(line, "CONERR", 3)?;
                Ok(Frame::SessionError {
                    code: number("CONERR", t[1])?,
                    message: unescape(t[2])?,
                })
            }
            "SERVNAME" => {
                let t = tokens_trailing(line, "SERVNAME", 2)?;
                Ok(Frame::ServerName(unescape(t[1])?))
            }
            "CLIENTIP" => {
                let t = tokens(line, "CLIENTIP", 2)?;
                Ok(Frame::ClientIp(t[1].to_string()))
            }
            "PROG" => {
                let t = tokens(line, "PROG", 2)?;
                Ok(Frame::Progress(number("PROG", t[1])?))
            }
            "LOOP" => {
                let t = tokens(line, "LOOP", 2)?;
                Ok(Frame::Loop {
                    expected_delay_millis: number("LOOP", t[1])?,
                })
            }
            "END" => {
                let t = tokens_trailing(line, "END", 3)?;
                Ok(Frame::End {
                    code: number("END", t[1])?,
                    message: unescape(t[2])?,
                })
            }
            "SUBOK" => {
                let t = tokens(line, "SUBOK", 4)?;
                Ok(Frame::SubscribeOk {
                    sub_id: number("SUBOK", t[1])?,
                    items: number("SUBOK", t[2])?,
                    fields: number("SUBOK", t[3])?,
                })
            }
            "SUBCMD" => {
                let t = tokens(line, "SUBCMD", 6)?;
                Ok(Frame::SubscribeCommand {
                    sub_id: number("SUBCMD", t[1])?,
                    items: number("SUBCMD", t[2])?,
                    fields: number("SUBCMD", t[3])?,
                    key_idx: number("SUBCMD", t[4])?,
                    command_idx: number("SUBCMD", t[5])?,
                })
            }
            "UNSUB" => {
                let t = tokens(line, "UNSUB", 2)?;
                Ok(Frame::UnsubscribeOk {
                    sub_id: number("UNSUB", t[1])?,
                })
            }
            "U" => {
                let t = tokens_trailing(line, "U", 4)?;
                let values = t[3]
                    .split('|')
                    .map(field_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Frame::Update {
                    sub_id: number("U", t[1])?,
                    item: number("U", t[2])?,
                    values,
                })
            }
            "OV" => {
                let t = tokens(line, "OV", 4)?;
                Ok(Frame::Overflow {
                    sub_id: number("OV", t[1])?,
                    item: number("OV", t[2])?,
                    lost: number("OV", t[3])?,
                })
            }
            "EOS" => {
                let t = tokens(line, "EOS", 3)?;
                Ok(Frame::EndOfSnapshot {
                    sub_id: number("EOS", t[1])?,
                    item: number("EOS", t[2])?,
                })
            }
            "CS" => {
                let t = tokens(line, "CS", 3)?;
                Ok(Frame::ClearSnapshot {
                    sub_id: number("CS", t[1])?,
                    item: number("CS", t[2])?,
                })
            }
            "CONF" => {
                let t = tokens(line, "CONF", 3)?;
                Ok(Frame::Configuration {
                    sub_id: number("CONF", t[1])?,
                    max_frequency: t[2].to_string(),
                })
            }
            "MSGDONE" => {
                let t = tokens(line, "MSGDONE", 3)?;
                Ok(Frame::MessageDone {
                    sequence: unescape(t[1])?,
                    prog: number("MSGDONE", t[2])?,
                })
            }
            "MSGFAIL" => {
                let t = tokens_trailing(line, "MSGFAIL", 5)?;
                Ok(Frame::MessageFail {
                    sequence: unescape(t[1])?,
                    prog: number("MSGFAIL", t[2])?,
                    code: number("MSGFAIL", t[3])?,
                    message: unescape(t[4])?,
                })
            }
            "REQOK" => {
                let t = tokens(line, "REQOK", 2)?;
                Ok(Frame::RequestOk {
                    req_id: number("REQOK", t[1])?,
                })
            }
            "REQERR" => {
                let t = tokens_trailing(line, "REQERR", 4)?;
                Ok(Frame::RequestError {
                    req_id: number("REQERR", t[1])?,
                    code: number("REQERR", t[2])?,
                    message: unescape(t[3])?,
                })
            }
            "PROBE" => Ok(Frame::Probe),
            "NOOP" => Ok(Frame::Noop),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }

    /// Whether this frame advances the session progress count.
    ///
    /// Data-carrying frames are the ones the server replays after a recovery
    /// bind; bookkeeping frames are not counted and never replayed.
    pub fn carries_data(&self) -> bool {
        matches!(
            self,
            Frame::Update { .. }
                | Frame::Overflow { .. }
                | Frame::EndOfSnapshot { .. }
                | Frame::ClearSnapshot { .. }
                | Frame::MessageDone { .. }
                | Frame::MessageFail { .. }
        )
    }
}

/// Whether an `END` cause code permits session recovery.
pub fn end_is_recoverable(code: i32) -> bool {
    (code < 40 && code != 39) || code == 41 || code == 48
}

fn tokens<'a>(line: &'a str, tag: &'static str, expected: usize) -> Result<Vec<&'a str>, ProtocolError> {
    let t: Vec<&str> = line.split(',').collect();
    if t.len() != expected {
        return Err(ProtocolError::Arity {
            tag,
            expected,
            got: t.len(),
        });
    }
    Ok(t)
}

/// Split into exactly `expected` tokens, the last one absorbing any further
/// commas (used for kinds whose final token is free text).
fn tokens_trailing<'a>(
    line: &'a str,
    tag: &'static str,
    expected: usize,
) -> Result<Vec<&'a str>, ProtocolError> {
    let t: Vec<&str> = line.splitn(expected, ',').collect();
    if t.len() != expected {
        return Err(ProtocolError::Arity {
            tag,
            expected,
            got: t.len(),
        });
    }
    Ok(t)
}

fn number<T: std::str::FromStr>(tag: &'static str, raw: &str) -> Result<T, ProtocolError> {
    raw.parse().map_err(|_| ProtocolError::Numeric {
        tag,
        value: raw.to_string(),
    })
}

fn field_value(token: &str) -> Result<FieldValue, ProtocolError> {
    match token {
        "" => Ok(FieldValue::Unchanged),
        "#" => Ok(FieldValue::Null),
        "$" => Ok(FieldValue::Value(String::new())),
        raw => Ok(FieldValue::Value(unescape(raw)?)),
    }
}

/// Reverse the percent-escaping applied by the encoder.
pub fn unescape(raw: &str) -> Result<String, ProtocolError> {
    if !raw.contains('%') {
        return Ok(raw.to_string());
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| ProtocolError::Escape(raw.to_string()))?;
            let hex = std::str::from_utf8(hex).map_err(|_| ProtocolError::Escape(raw.to_string()))?;
            let byte =
                u8::from_str_radix(hex, 16).map_err(|_| ProtocolError::Escape(raw.to_string()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ProtocolError::Escape(raw.to_string()))
}
