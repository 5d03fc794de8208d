//! Validation of `device_vibrate` tool arguments.
//!
//! Arguments arrive as an untyped JSON bag. [`VibrateCommand::validate`]
//! coerces them into a well-typed command or reports every failing field at
//! once. No device I/O happens here — a command only reaches the session
//! after validation *and* handle resolution both succeed.

use serde_json::Value;

use crate::error::Error;

/// A validated vibrate command, constructed per request and never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VibrateCommand {
    /// Device index from `/devices`.
    pub device_id: u32,
    /// Motor (actuation channel) index, defaults to 0.
    pub motor: u32,
    /// Vibration strength in the closed range [0.0, 1.0].
    pub strength: f64,
}

impl VibrateCommand {
    /// Validate and coerce raw tool arguments.
    ///
    /// Collects one message per failing field rather than stopping at the
    /// first, so callers see the full shape of their mistake.
    pub fn validate(args: &Value) -> Result<Self, Error> {
        let mut problems = Vec::new();

        let device_id = match args.get("id") {
            None => {
                problems.push("id is required".to_string());
                None
            }
            Some(v) => match coerce_index(v) {
                Some(id) => Some(id),
                None => {
                    problems.push(format!("id must be a non-negative integer, got {v}"));
                    None
                }
            },
        };

        let strength = match args.get("strength") {
            None => {
                problems.push("strength is required".to_string());
                None
            }
            Some(v) => match coerce_float(v) {
                Some(s) if (0.0..=1.0).contains(&s) => Some(s),
                Some(s) => {
                    problems.push(format!("strength must be within [0.0, 1.0], got {s}"));
                    None
                }
                None => {
                    problems.push(format!("strength must be a number, got {v}"));
                    None
                }
            },
        };

        let motor = match args.get("motor") {
            None | Some(Value::Null) => Some(0),
            Some(v) => match coerce_index(v) {
                Some(m) => Some(m),
                None => {
                    problems.push(format!("motor must be a non-negative integer, got {v}"));
                    None
                }
            },
        };

        if !problems.is_empty() {
            return Err(Error::Validation(problems));
        }

        // All three are Some once problems is empty.
        Ok(Self {
            device_id: device_id.unwrap_or_default(),
            motor: motor.unwrap_or_default(),
            strength: strength.unwrap_or_default(),
        })
    }
}

/// Coerce a JSON value into a non-negative integer index.
///
/// Accepts integer numbers and numeric strings; rejects fractional numbers,
/// negatives, and anything non-numeric.
fn coerce_index(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Coerce a JSON value into a float. Accepts numbers and numeric strings.
fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
