//! JSON line wire format: `{"sender": 1, "clock": 3, "type": "SEND"}`.

use serde::{Deserialize, Serialize};

use crate::abstractions::{MachineId, Message};
use crate::error::CodecError;

const SEND_TYPE: &str = "SEND";

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    sender: MachineId,
    #[serde(default)]
    clock: u64,
    #[serde(rename = "type", default = "send_type")]
    kind: String,
}

fn send_type() -> String {
    SEND_TYPE.to_string()
}

pub fn encode(message: &Message) -> Result<String, CodecError> {
    let wire = WireMessage {
        sender: message.sender,
        clock: message.clock,
        kind: send_type(),
    };
    Ok(serde_json::to_string(&wire)?)
}

pub fn decode(line: &str) -> Result<Message, CodecError> {
    let wire: WireMessage = serde_json::from_str(line.trim())?;
    // The receiver's clock must still be able to move past it.
    if wire.clock == u64::MAX {
        return Err(CodecError::ClockExhausted(wire.clock));
    }
    Ok(Message {
        sender: wire.sender,
        clock: wire.clock,
    })
}
