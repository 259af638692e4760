//! Convenience constructors and accessors for [`TypedData`].

use crate::rpc::typed_data::Data;
use crate::rpc::{ParameterBinding, TypedData};

impl TypedData {
    /// A UTF-8 string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data: Some(Data::String(value.into())),
        }
    }

    /// A JSON document carried as text.
    #[must_use]
    pub fn json(value: impl Into<String>) -> Self {
        Self {
            data: Some(Data::Json(value.into())),
        }
    }

    /// An opaque byte payload.
    #[must_use]
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(Data::Bytes(value.into())),
        }
    }

    /// Returns the text of a string or JSON value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            Some(Data::String(s) | Data::Json(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw bytes of a bytes or stream value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            Some(Data::Bytes(b) | Data::Stream(b)) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for TypedData {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for TypedData {
    fn from(value: String) -> Self {
        Self::string(value)
    }
}

impl ParameterBinding {
    /// A named binding.
    #[must_use]
    pub fn new(name: impl Into<String>, data: TypedData) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
        }
    }
}
