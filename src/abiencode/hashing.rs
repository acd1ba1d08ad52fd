use super::{ser::to_fnargs_writer, to_writer, types::Hash, Error, Writer};

use serde::Serialize;
use sha3::{Digest, Keccak256};

#[derive(Default)]
pub struct Keccak256Writer {
    hasher: Keccak256,
}

impl Writer for Keccak256Writer {
    fn write(&mut self, slot: &[u8]) {
        self.hasher.update(slot);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

/// keccak256 of `abi.encode(value)`.
pub fn to_hash<T>(value: &T) -> Result<Hash, Error>
where
    T: Serialize,
{
    let mut writer = Keccak256Writer::default();
    to_writer(value, &mut writer)?;
    Ok(writer.finalize())
}

/// keccak256 of `abi.encode(a, b, ...)` where the fields of `value` are the
/// arguments, i.e. without the offset of an outer dynamic tuple.
pub fn to_fnargs_hash<T>(value: &T) -> Result<Hash, Error>
where
    T: Serialize,
{
    let mut writer = Keccak256Writer::default();
    to_fnargs_writer(value, &mut writer)?;
    Ok(writer.finalize())
}

/// Collects the encoded slots.
#[cfg(test)]
#[derive(Default, Debug)]
pub struct VecWriter(pub Vec<u8>);

#[cfg(test)]
impl Writer for VecWriter {
    fn write(&mut self, slot: &[u8]) {
        self.0.extend_from_slice(slot);
    }
}

/// `abi.encode(value)` as bytes.
#[cfg(test)]
pub fn to_bytes<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize,
{
    let mut writer = VecWriter::default();
    to_writer(value, &mut writer)?;
    Ok(writer.0)
}
