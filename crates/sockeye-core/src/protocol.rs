//! Wire codec for the text-framed message protocol.
//!
//! Frames are single text strings. The leading byte(s) select the message
//! type: `0` OPEN (followed by the header JSON), `1` CLOSE, `2` PING,
//! `3` PONG, `40` EMPTY, `42` EMIT / ACK-REQ, `43` ACK-RESP. EMIT and
//! ACK-REQ carry `["method",args]` where `args` is the raw JSON text of the
//! single argument; ACK-REQ and ACK-RESP carry a decimal ack id between the
//! type prefix and the opening bracket. At the layer above the codec the
//! taxonomy maps to type codes 0..6 (EMIT and ACK-REQ share code 5).
//!
//! The codec is pure and stateless; encode and decode are inverses on
//! well-formed messages, modulo the representation of empty args.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Frame sent for keepalive probes.
pub const PING_MESSAGE: &str = "2";
/// Frame sent in reply to a keepalive probe.
pub const PONG_MESSAGE: &str = "3";

/// Handshake record describing a session, exchanged once inside the OPEN
/// frame. Intervals are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub sid: String,
    pub upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
}

/// Wire message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open,
    Close,
    Ping,
    Pong,
    Empty,
    Emit,
    AckRequest,
    AckResponse,
}

/// A decoded wire frame.
///
/// `args` holds the raw JSON text of the payload (the single argument for
/// EMIT/ACK-REQ, the result for ACK-RESP, the header for OPEN). `source`
/// keeps the original frame text; OPEN consumers extract the header JSON
/// from `source[1..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub method: String,
    pub ack_id: Option<u64>,
    pub args: String,
    pub source: String,
}

impl Message {
    pub fn open(header_json: String) -> Self {
        Self {
            message_type: MessageType::Open,
            method: String::new(),
            ack_id: None,
            args: header_json,
            source: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            message_type: MessageType::Empty,
            method: String::new(),
            ack_id: None,
            args: String::new(),
            source: String::new(),
        }
    }

    pub fn emit(method: &str, args: String) -> Self {
        Self {
            message_type: MessageType::Emit,
            method: method.to_owned(),
            ack_id: None,
            args,
            source: String::new(),
        }
    }

    pub fn ack_request(method: &str, ack_id: u64, args: String) -> Self {
        Self {
            message_type: MessageType::AckRequest,
            method: method.to_owned(),
            ack_id: Some(ack_id),
            args,
            source: String::new(),
        }
    }

    pub fn ack_response(ack_id: u64, args: String) -> Self {
        Self {
            message_type: MessageType::AckResponse,
            method: String::new(),
            ack_id: Some(ack_id),
            args,
            source: String::new(),
        }
    }
}

/// Encode a message into its wire text.
pub fn encode(msg: &Message) -> Result<String, Error> {
    match msg.message_type {
        MessageType::Open => Ok(format!("0{}", msg.args)),
        MessageType::Close => Ok(format!("1{}", msg.args)),
        MessageType::Ping => Ok(PING_MESSAGE.to_owned()),
        MessageType::Pong => Ok(PONG_MESSAGE.to_owned()),
        MessageType::Empty => Ok("40".to_owned()),
        MessageType::Emit => {
            let method = serde_json::to_string(&msg.method)?;
            Ok(format!("42[{},{}]", method, msg.args))
        }
        MessageType::AckRequest => {
            let id = msg.ack_id.ok_or(Error::WrongPacket)?;
            let method = serde_json::to_string(&msg.method)?;
            Ok(format!("42{}[{},{}]", id, method, msg.args))
        }
        MessageType::AckResponse => {
            let id = msg.ack_id.ok_or(Error::WrongPacket)?;
            Ok(format!("43{}[{}]", id, msg.args))
        }
    }
}

/// Decode a wire text into a message. Fails with [`Error::WrongPacket`] on
/// malformed input.
pub fn decode(data: &str) -> Result<Message, Error> {
    let mut bytes = data.bytes();
    let first = bytes.next().ok_or(Error::WrongPacket)?;

    let simple = |message_type| {
        Ok(Message {
            message_type,
            method: String::new(),
            ack_id: None,
            args: data[1..].to_owned(),
            source: data.to_owned(),
        })
    };

    match first {
        b'0' => simple(MessageType::Open),
        b'1' => simple(MessageType::Close),
        b'2' => simple(MessageType::Ping),
        b'3' => simple(MessageType::Pong),
        b'4' => match bytes.next() {
            Some(b'0') => Ok(Message {
                message_type: MessageType::Empty,
                method: String::new(),
                ack_id: None,
                args: String::new(),
                source: data.to_owned(),
            }),
            Some(b'2') => decode_event(data),
            Some(b'3') => decode_ack_response(data),
            _ => Err(Error::WrongPacket),
        },
        _ => Err(Error::WrongPacket),
    }
}

/// Decode the `42...` family: `42["m",args]` is an EMIT, `42<id>["m",args]`
/// an ACK-REQ.
fn decode_event(data: &str) -> Result<Message, Error> {
    let rest = &data[2..];
    let open = rest.find('[').ok_or(Error::WrongPacket)?;

    let ack_id = if open == 0 {
        None
    } else {
        Some(rest[..open].parse::<u64>().map_err(|_| Error::WrongPacket)?)
    };

    let (method, args) = split_method(&rest[open..])?;
    Ok(Message {
        message_type: if ack_id.is_some() {
            MessageType::AckRequest
        } else {
            MessageType::Emit
        },
        method,
        ack_id,
        args,
        source: data.to_owned(),
    })
}

/// Decode `43<id>[args]`.
fn decode_ack_response(data: &str) -> Result<Message, Error> {
    let rest = &data[2..];
    let open = rest.find('[').ok_or(Error::WrongPacket)?;
    if open == 0 {
        return Err(Error::WrongPacket);
    }
    let ack_id = rest[..open].parse::<u64>().map_err(|_| Error::WrongPacket)?;

    let body = &rest[open..];
    if !body.ends_with(']') {
        return Err(Error::WrongPacket);
    }
    Ok(Message {
        message_type: MessageType::AckResponse,
        method: String::new(),
        ack_id: Some(ack_id),
        args: body[1..body.len() - 1].to_owned(),
        source: data.to_owned(),
    })
}

/// Split a `["method",args]` body into the method name and the raw args
/// text. The method is the leading JSON string element; args is everything
/// after the separating comma, without the trailing bracket. A body with no
/// second element yields empty args.
fn split_method(body: &str) -> Result<(String, String), Error> {
    if !body.starts_with('[') || !body.ends_with(']') {
        return Err(Error::WrongPacket);
    }
    let inner = &body[1..body.len() - 1];
    if !inner.starts_with('"') {
        return Err(Error::WrongPacket);
    }

    // Scan for the closing quote, honoring backslash escapes.
    let mut escaped = false;
    let mut end = None;
    for (i, b) in inner.bytes().enumerate().skip(1) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            end = Some(i);
            break;
        }
    }
    let end = end.ok_or(Error::WrongPacket)?;

    let method: String = serde_json::from_str(&inner[..=end]).map_err(|_| Error::WrongPacket)?;

    let rest = &inner[end + 1..];
    let args = match rest.strip_prefix(',') {
        Some(args) => args.to_owned(),
        None if rest.is_empty() => String::new(),
        None => return Err(Error::WrongPacket),
    };
    Ok((method, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let wire = encode(msg).unwrap();
        decode(&wire).unwrap()
    }

    #[test]
    fn encodes_control_frames() {
        assert_eq!(encode(&Message::empty()).unwrap(), "40");
        let ping = decode("2").unwrap();
        assert_eq!(ping.message_type, MessageType::Ping);
        let pong = decode("3").unwrap();
        assert_eq!(pong.message_type, MessageType::Pong);
    }

    #[test]
    fn open_frame_keeps_source() {
        let wire = r#"0{"sid":"abc","upgrades":[],"pingInterval":30000,"pingTimeout":60000}"#;
        let msg = decode(wire).unwrap();
        assert_eq!(msg.message_type, MessageType::Open);
        assert_eq!(msg.source, wire);

        let header: Header = serde_json::from_str(&msg.source[1..]).unwrap();
        assert_eq!(header.sid, "abc");
        assert_eq!(header.ping_interval, 30000);
    }

    #[test]
    fn emit_roundtrip() {
        let msg = Message::emit("MyMethod", "\"Hello\"".to_owned());
        let wire = encode(&msg).unwrap();
        assert_eq!(wire, r#"42["MyMethod","Hello"]"#);

        let back = roundtrip(&msg);
        assert_eq!(back.message_type, MessageType::Emit);
        assert_eq!(back.method, "MyMethod");
        assert_eq!(back.args, "\"Hello\"");
        assert_eq!(back.ack_id, None);
    }

    #[test]
    fn emit_with_structured_args() {
        let msg = Message::emit("update", r#"{"id":3,"tags":["a","b"]}"#.to_owned());
        let back = roundtrip(&msg);
        assert_eq!(back.args, r#"{"id":3,"tags":["a","b"]}"#);
    }

    #[test]
    fn emit_method_with_escapes() {
        let msg = Message::emit(r#"we"ird"#, "1".to_owned());
        let back = roundtrip(&msg);
        assert_eq!(back.method, r#"we"ird"#);
        assert_eq!(back.args, "1");
    }

    #[test]
    fn ack_request_roundtrip() {
        let msg = Message::ack_request("ping", 7, "null".to_owned());
        let wire = encode(&msg).unwrap();
        assert_eq!(wire, r#"427["ping",null]"#);

        let back = roundtrip(&msg);
        assert_eq!(back.message_type, MessageType::AckRequest);
        assert_eq!(back.ack_id, Some(7));
        assert_eq!(back.method, "ping");
        assert_eq!(back.args, "null");
    }

    #[test]
    fn ack_response_roundtrip() {
        let msg = Message::ack_response(7, "42".to_owned());
        let wire = encode(&msg).unwrap();
        assert_eq!(wire, "437[42]");

        let back = roundtrip(&msg);
        assert_eq!(back.message_type, MessageType::AckResponse);
        assert_eq!(back.ack_id, Some(7));
        assert_eq!(back.args, "42");
    }

    #[test]
    fn ack_response_empty_args() {
        let back = decode("435[]").unwrap();
        assert_eq!(back.message_type, MessageType::AckResponse);
        assert_eq!(back.ack_id, Some(5));
        assert_eq!(back.args, "");
    }

    #[test]
    fn decode_then_encode_is_identity() {
        for wire in [
            "2",
            "3",
            "40",
            r#"42["m",1]"#,
            r#"4212["m",{"a":[1,2]}]"#,
            "433[true]",
            r#"0{"sid":"x","upgrades":[],"pingInterval":1,"pingTimeout":2}"#,
        ] {
            let msg = decode(wire).unwrap();
            assert_eq!(encode(&msg).unwrap(), wire, "frame {wire:?}");
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        for wire in [
            "",
            "9",
            "4",
            "41",
            "42",
            "42[",
            "42[1,2]",
            "42x[\"m\",1]",
            "43[1]",
            "43x[1]",
            "42[\"unterminated,1]",
        ] {
            assert!(
                matches!(decode(wire), Err(Error::WrongPacket)),
                "frame {wire:?} should be rejected"
            );
        }
    }

    #[test]
    fn header_json_field_names() {
        let header = Header {
            sid: "s".into(),
            upgrades: vec![],
            ping_interval: 25000,
            ping_timeout: 50000,
        };
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(
            json,
            r#"{"sid":"s","upgrades":[],"pingInterval":25000,"pingTimeout":50000}"#
        );
    }
}
