//! Channel values on the wire.
//!
//! Boolean: one byte, 0 or 1. Analog reads: f32 little endian plus a flags
//! byte (bit 0: clamped). Analog writes: f32 little endian. Bus kinds:
//! raw bytes.

use crate::interface::{AnalogValue, ChannelKind, Unit, Value};

const FLAG_CLAMPED: u8 = 1 << 0;

/// Encode the result of a read.
pub fn encode_read(value: &Value) -> Vec<u8> {
    match value {
        Value::Bool(b) => vec![*b as u8],
        Value::Analog(a) => {
            let mut bytes = a.value.to_le_bytes().to_vec();
            bytes.push(if a.clamped { FLAG_CLAMPED } else { 0 });
            bytes
        }
        Value::Bytes(bytes) => bytes.clone(),
    }
}

/// Encode a value to be written.
pub fn encode_write(value: &Value) -> Vec<u8> {
    match value {
        Value::Analog(a) => a.value.to_le_bytes().to_vec(),
        other => encode_read(other),
    }
}

/// Decode write data for a channel of `kind`. `None` if the data does not
/// fit the kind.
pub fn decode_write(kind: ChannelKind, data: &[u8]) -> Option<Value> {
    match kind {
        ChannelKind::DigitalInput
        | ChannelKind::DigitalOutput
        | ChannelKind::Relay => match data {
            [0] => Some(Value::Bool(false)),
            [1] => Some(Value::Bool(true)),
            _ => None,
        },
        ChannelKind::AnalogInput | ChannelKind::AnalogOutput => {
            let bytes: [u8; 4] = data.try_into().ok()?;
            let value = f32::from_le_bytes(bytes);
            value
                .is_finite()
                .then(|| Value::Analog(AnalogValue::new(value, Unit::Raw)))
        }
        ChannelKind::Can | ChannelKind::I2c | ChannelKind::Uart => {
            Some(Value::Bytes(data.to_vec()))
        }
    }
}

/// Decode read data from a channel of `kind`. The unit is not on the wire
/// and comes back as [`Unit::Raw`].
pub fn decode_read(kind: ChannelKind, data: &[u8]) -> Option<Value> {
    match kind {
        ChannelKind::AnalogInput | ChannelKind::AnalogOutput => {
            let [a, b, c, d, flags] = data else {
                return None;
            };
            Some(Value::Analog(AnalogValue {
                value: f32::from_le_bytes([*a, *b, *c, *d]),
                unit: Unit::Raw,
                clamped: flags & FLAG_CLAMPED != 0,
            }))
        }
        other => decode_write(other, data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ChannelKind::DigitalOutput, &[1], Some(Value::Bool(true)); "bool true")]
    #[test_case(ChannelKind::Relay, &[0], Some(Value::Bool(false)); "relay off")]
    #[test_case(ChannelKind::DigitalOutput, &[2], None; "bool out of range")]
    #[test_case(ChannelKind::DigitalOutput, &[], None; "bool missing")]
    #[test_case(ChannelKind::AnalogOutput, &[0, 0, 0x20, 0x40], Some(Value::Analog(AnalogValue::new(2.5, Unit::Raw))); "analog")]
    #[test_case(ChannelKind::AnalogOutput, &[0, 0, 0xc0, 0x7f], None; "analog nan")]
    #[test_case(ChannelKind::AnalogOutput, &[0, 0, 0x20], None; "analog short")]
    #[test_case(ChannelKind::Uart, b"ab", Some(Value::Bytes(b"ab".to_vec())); "uart bytes")]
    fn write_decoding(kind: ChannelKind, data: &[u8], expected: Option<Value>) {
        assert_eq!(decode_write(kind, data), expected);
    }

    #[test]
    fn analog_read_carries_clamp_flag() {
        let reading = Value::Analog(AnalogValue {
            value: 20.0,
            unit: Unit::MilliAmpere,
            clamped: true,
        });
        let bytes = encode_read(&reading);
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[4], FLAG_CLAMPED);
        let Some(Value::Analog(decoded)) = decode_read(ChannelKind::AnalogInput, &bytes) else {
            panic!("analog value expected");
        };
        assert_eq!(decoded.value, 20.0);
        assert!(decoded.clamped);
        assert_eq!(encode_write(&reading).len(), 4);
    }
}
