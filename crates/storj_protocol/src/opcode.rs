//! Opcode topic encoding for the publish/subscribe contract market (§6): a 3-byte
//! topic, hex-encoded as a 6-character string. Byte 0 is a category; bytes 1-2 are a
//! category-specific descriptor.

/// Category byte for a data-contract publication.
pub const CATEGORY_DATA_CONTRACT: u8 = 0x0F;
/// Category byte for tunneler availability announcements (§4.8).
pub const CATEGORY_TUNNELER: u8 = 0x0E;

/// Descriptor flag: tunneler is available for relay.
pub const TUNNELER_AVAIL: u8 = 0x01;
/// Descriptor flag: tunneler has withdrawn availability.
pub const TUNNELER_UNAVAIL: u8 = 0x00;

/// A 3-byte opcode topic, hex-encoded on the wire as 6 characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeTopic(pub [u8; 3]);

impl OpcodeTopic {
    pub fn category(self) -> u8 {
        self.0[0]
    }

    pub fn descriptor(self) -> [u8; 2] {
        [self.0[1], self.0[2]]
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 3] = bytes.try_into().map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// A data-contract topic for a shard of `data_size` bytes. Shard-size buckets are
    /// this node's own capability-advertisement scheme, not specified on the wire
    /// beyond "one byte, a shard-size class": 0 up to 1 MiB, 1 up to 8 MiB (the default
    /// muxer shard size), 2 up to 64 MiB, 3 anything larger.
    pub fn data_contract(data_size: u64) -> Self {
        let bucket = shard_size_bucket(data_size);
        Self([CATEGORY_DATA_CONTRACT, bucket, 0x00])
    }

    pub fn tunneler_availability(available: bool) -> Self {
        let flag = if available { TUNNELER_AVAIL } else { TUNNELER_UNAVAIL };
        Self([CATEGORY_TUNNELER, flag, 0x00])
    }

    pub fn is_tunneler_topic(self) -> bool {
        self.category() == CATEGORY_TUNNELER
    }
}

fn shard_size_bucket(data_size: u64) -> u8 {
    const MIB: u64 = 1024 * 1024;
    match data_size {
        n if n <= MIB => 0,
        n if n <= 8 * MIB => 1,
        n if n <= 64 * MIB => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trips_through_hex() {
        let topic = OpcodeTopic::data_contract(4 * 1024 * 1024);
        let hex = topic.to_hex();
        assert_eq!(hex.len(), 6);
        let parsed = OpcodeTopic::from_hex(&hex).unwrap();
        assert_eq!(parsed.category(), CATEGORY_DATA_CONTRACT);
        assert_eq!(parsed.descriptor(), [1, 0]);
    }

    #[test]
    fn tunneler_topics_carry_the_availability_flag() {
        assert_eq!(OpcodeTopic::tunneler_availability(true).descriptor(), [TUNNELER_AVAIL, 0]);
        assert_eq!(OpcodeTopic::tunneler_availability(false).descriptor(), [TUNNELER_UNAVAIL, 0]);
        assert!(OpcodeTopic::tunneler_availability(true).is_tunneler_topic());
    }
}
