//! Serialize any `&[u8]` as solidity `bytes` (dynamic length bytes).
//!
//! Without this, a `Vec<u8>` would be serialized as `uint8[]`.
//!
//! ```ignore
//! #[derive(Serialize)]
//! struct WithAppData {
//!     #[serde(with = "as_bytes")]
//!     app_data: Vec<u8>,
//! }
//! ```

use super::ser::DynamicMarker;
use serde::{ser::SerializeTuple, Serialize, Serializer};

/// Lets us call `serialize_bytes` for the data, which `serialize_element`
/// cannot do directly.
struct Bytes<'a>(&'a [u8]);

impl<'a> Serialize for Bytes<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.0)
    }
}

pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut s = serializer.serialize_tuple(3)?;
    s.serialize_element(&DynamicMarker)?; // dynamic, but without an extra offset
    s.serialize_element(&v.len())?; // length in bytes, without padding
    s.serialize_element(&Bytes(v))?; // data padded to full slots
    s.end()
}
