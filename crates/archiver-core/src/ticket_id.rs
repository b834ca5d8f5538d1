//! Webhook body ticket-id extraction.
//!
//! Pure decision logic kept separate from the `axum` wiring, the way
//! [`crate::middleware`] separates HMAC verification from its layer. Only a
//! positive integer is a valid ticket id — booleans, floats, zero, and
//! negative numbers are all schema violations (§4.12 step 1, §8 scenario:
//! "boolean ticket id").

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketIdError {
    Missing,
    NotAnInteger,
    NotPositive,
}

/// Looks up a ticket id at `ticket.id` first, falling back to `ticket_id`
/// at the top level, then validates its shape.
pub fn extract_ticket_id(body: &Value) -> Result<i64, TicketIdError> {
    let raw = body
        .get("ticket")
        .and_then(|t| t.get("id"))
        .or_else(|| body.get("ticket_id"))
        .ok_or(TicketIdError::Missing)?;
    parse_ticket_id_value(raw)
}

fn parse_ticket_id_value(value: &Value) -> Result<i64, TicketIdError> {
    match value {
        Value::Number(n) => {
            let i = n.as_i64().ok_or(TicketIdError::NotAnInteger)?;
            if i <= 0 {
                return Err(TicketIdError::NotPositive);
            }
            Ok(i)
        }
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            let i: i64 = s.parse().map_err(|_| TicketIdError::NotAnInteger)?;
            if i <= 0 {
                return Err(TicketIdError::NotPositive);
            }
            Ok(i)
        }
        // Bool, float, array, object, null, or a non-digit string.
        _ => Err(TicketIdError::NotAnInteger),
    }
}
