// Encoding of stored records. Entries are keyed by index in the store, so
// the encoded value carries the full entry and is checked against its key.

use crate::cluster::MembershipRecord;
use crate::error::{BallotError, BallotResult, SerializationContext};
use crate::storage::HardState;
use crate::types::{LogEntry, LogIndex};

pub fn serialize_entry(entry: &LogEntry) -> BallotResult<Vec<u8>> {
    bincode::serialize(entry).serialization_context("serialize entry")
}

pub fn deserialize_entry(key: LogIndex, data: &[u8]) -> BallotResult<LogEntry> {
    let entry: LogEntry = bincode::deserialize(data).serialization_context("deserialize entry")?;
    if entry.index != key {
        return Err(BallotError::internal(format!(
            "stored entry under key {} claims index {}",
            key, entry.index
        )));
    }
    Ok(entry)
}

pub fn serialize_hard_state(state: &HardState) -> BallotResult<Vec<u8>> {
    bincode::serialize(state).serialization_context("serialize hard state")
}

pub fn deserialize_hard_state(data: &[u8]) -> BallotResult<HardState> {
    bincode::deserialize(data).serialization_context("deserialize hard state")
}

pub fn serialize_membership(record: &MembershipRecord) -> BallotResult<Vec<u8>> {
    bincode::serialize(record).serialization_context("serialize membership")
}

pub fn deserialize_membership(data: &[u8]) -> BallotResult<MembershipRecord> {
    bincode::deserialize(data).serialization_context("deserialize membership")
}
