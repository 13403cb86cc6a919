use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::runtime::error::Error;

/// Reserved header that ends a worker loop. Never delivered to `update`.
pub const STOP_HEADER: &str = "ferrite.stop";

/// A tagged message between an owner and its worker. `data` holds the
/// bincode encoding of whatever value the sender attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub header: String,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new<T: Serialize + ?Sized>(header: impl Into<String>, data: &T) -> Result<Self, Error> {
        let data = bincode::serialize(data).map_err(|e| Error::Serialize(e.to_string()))?;
        Ok(Self {
            header: header.into(),
            data,
        })
    }

    pub fn stop() -> Self {
        Self {
            header: STOP_HEADER.to_string(),
            data: Vec::new(),
        }
    }

    pub fn is_stop(&self) -> bool {
        self.header == STOP_HEADER
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.data).map_err(|e| Error::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_yields_attached_value() {
        let packet = Packet::new("misc_data", &(0.5f64, 2.0f64, 10usize)).unwrap();
        assert_eq!(packet.header, "misc_data");
        assert_eq!(packet.decode::<(f64, f64, usize)>().unwrap(), (0.5, 2.0, 10));
        assert!(!packet.is_stop());
        assert!(Packet::stop().is_stop());
    }

    #[test]
    fn decode_with_wrong_type_fails() {
        let packet = Packet::new("x", &1u8).unwrap();
        assert!(matches!(packet.decode::<String>(), Err(Error::Deserialize(_))));
    }
}
