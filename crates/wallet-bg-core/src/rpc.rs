//! JSON-RPC 2.0 envelope helpers shared by the transports.

use alloy::primitives::B256;
use serde_json::{json, Value};

use crate::ports::PortError;

pub fn request_body(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Splits a response envelope into its id and its result or error.
pub fn parse_response(envelope: &Value) -> (Option<u64>, Result<Value, PortError>) {
    let id = envelope.get("id").and_then(Value::as_u64);
    if let Some(error) = envelope.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown rpc error");
        return (
            id,
            Err(PortError::Transport(format!("rpc error {code}: {message}"))),
        );
    }
    match envelope.get("result") {
        Some(result) => (id, Ok(result.clone())),
        None => (
            id,
            Err(PortError::Validation(
                "rpc response has neither result nor error".to_owned(),
            )),
        ),
    }
}

pub fn parse_hex_u64(value: &Value) -> Result<u64, PortError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let raw = value
        .as_str()
        .ok_or_else(|| PortError::Validation(format!("expected hex quantity, got {value}")))?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|e| PortError::Validation(format!("invalid hex quantity {raw}: {e}")))
}

pub fn parse_b256(value: &Value) -> Result<B256, PortError> {
    let raw = value
        .as_str()
        .ok_or_else(|| PortError::Validation(format!("expected 32-byte hash, got {value}")))?;
    raw.parse::<B256>()
        .map_err(|e| PortError::Validation(format!("invalid 32-byte hash {raw}: {e}")))
}
