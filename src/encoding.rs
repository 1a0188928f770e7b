//! Binary value encoding via bincode.
//!
//! Values don't need to preserve ordering, so they use bincode rather than
//! a hand-rolled format. All persistent keys in this crate have fixed byte
//! layouts and are encoded manually where they are defined.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Serialize a value using bincode.
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("serialization should not fail")
}

/// Deserialize a value from a byte slice using bincode.
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_option_bytes() {
        let live: Option<Vec<u8>> = Some(vec![0x01, 0x02]);
        assert_eq!(
            deserialize::<Option<Vec<u8>>>(&serialize(&live)).unwrap(),
            live
        );

        let tombstone: Option<Vec<u8>> = None;
        assert_eq!(
            deserialize::<Option<Vec<u8>>>(&serialize(&tombstone)).unwrap(),
            tombstone
        );
    }

    #[test]
    fn invalid_data_errors() {
        let result: Result<String> = deserialize(&[0xff, 0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }
}
