use std::time::Instant;

use rosc::OscType;

use crate::registry::Value;

/// One inbound control message, as seen by the handler table.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub addr: String,
    pub args: Vec<OscType>,
    pub received_at: Instant,
}

impl OscMessage {
    pub fn new(msg: rosc::OscMessage, received_at: Instant) -> Self {
        Self {
            addr: msg.addr,
            args: msg.args,
            received_at,
        }
    }

    /// The registry value carried by the first argument, if it has a supported type.
    /// Extra arguments are ignored.
    pub fn first_value(&self) -> Option<Value> {
        self.args.first().and_then(osc_to_value)
    }
}

/// Map an OSC argument onto a registry value.
///
/// Doubles narrow to `Float`, longs narrow to `Int` when they fit. Blobs, timetags, colours,
/// MIDI, arrays, nil and infinitum have no registry counterpart.
pub fn osc_to_value(arg: &OscType) -> Option<Value> {
    match arg {
        OscType::Float(f) => Some(Value::Float(*f)),
        OscType::Double(d) => Some(Value::Float(*d as f32)),
        OscType::Int(i) => Some(Value::Int(*i)),
        OscType::Long(l) => i32::try_from(*l).ok().map(Value::Int),
        OscType::String(s) => Some(Value::String(s.clone())),
        OscType::Char(c) => Some(Value::String(c.to_string())),
        OscType::Bool(b) => Some(Value::Bool(*b)),
        _ => None,
    }
}

pub fn value_to_osc(v: &Value) -> OscType {
    match v {
        Value::Float(f) => OscType::Float(*f),
        Value::Int(i) => OscType::Int(*i),
        Value::String(s) => OscType::String(s.clone()),
        Value::Bool(b) => OscType::Bool(*b),
    }
}

/// Why an address could not be mapped onto a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    Empty,
    NoTagSegment,
}

/// Split a (prefix-stripped) address into `(category, tag)`.
///
/// `/synth/filter/cutoff` -> `("synth", "filter/cutoff")`.
pub fn split_address(addr: &str) -> Result<(&str, &str), AddressError> {
    let trimmed = addr.trim_matches('/');
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    match trimmed.split_once('/') {
        Some((cat, tag)) if !cat.is_empty() && !tag.trim_matches('/').is_empty() => {
            Ok((cat, tag.trim_matches('/')))
        }
        _ => Err(AddressError::NoTagSegment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_category_from_nested_tag() {
        assert_eq!(
            split_address("/synth/filter/cutoff"),
            Ok(("synth", "filter/cutoff"))
        );
        assert_eq!(split_address("/synth/level"), Ok(("synth", "level")));
    }

    #[test]
    fn rejects_addresses_without_tag() {
        assert_eq!(split_address("/"), Err(AddressError::Empty));
        assert_eq!(split_address(""), Err(AddressError::Empty));
        assert_eq!(split_address("/synth"), Err(AddressError::NoTagSegment));
        assert_eq!(split_address("/synth//"), Err(AddressError::NoTagSegment));
    }

    #[test]
    fn first_argument_only() {
        let msg = OscMessage {
            addr: "/synth/level".into(),
            args: vec![OscType::Float(0.5), OscType::String("ignored".into())],
            received_at: Instant::now(),
        };
        assert_eq!(msg.first_value(), Some(Value::Float(0.5)));
    }

    #[test]
    fn unsupported_argument_types() {
        assert_eq!(osc_to_value(&OscType::Nil), None);
        assert_eq!(osc_to_value(&OscType::Blob(vec![1, 2])), None);
        assert_eq!(osc_to_value(&OscType::Long(i64::MAX)), None);
        assert_eq!(osc_to_value(&OscType::Double(0.25)), Some(Value::Float(0.25)));
    }
}
