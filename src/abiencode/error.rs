//! Error type and Return values used by the Serialization.

use core::fmt::Display;

use serde::ser;

/// Represents all possible errors that can happen during Serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The value contains a type that has no Solidity counterpart, e.g.
    /// floats, maps or enum variants. Enums have to implement `Serialize`
    /// by hand (see `AssetOutcome`) to pick an explicit representation.
    TypeNotRepresentable(&'static str),
    /// Representable in Solidity, but not implemented by the Serializer.
    TypeNotYetSupported(&'static str),
    /// Raised by a `Serialize` implementation via [ser::Error::custom].
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::Custom(msg.to_string())
    }
}

impl ser::StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TypeNotRepresentable(type_name) => {
                f.write_str("type is not representable in abi encoding: ")?;
                f.write_str(type_name)
            }
            Error::TypeNotYetSupported(type_name) => {
                f.write_str("type is not yet implemented: ")?;
                f.write_str(type_name)
            }
            Error::Custom(msg) => f.write_str(msg),
        }
    }
}

/// Alias for `Result` using the [Error] returned by the Serializer.
pub type Result<T> = core::result::Result<T, Error>;
