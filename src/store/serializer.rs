//! Key and value serializers

use std::any::TypeId;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Converts values of `T` to and from bytes.
///
/// Two serializers are considered compatible when they are of the same
/// concrete type, which is how cache registrations are compared.
pub trait Serializer<T>: Send + Sync + 'static {
    fn write(&self, value: &T) -> Result<Vec<u8>>;

    fn read(&self, bytes: &[u8]) -> Result<T>;

    /// Identity of the concrete serializer type
    fn serializer_id(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    /// Human readable serializer type, for mismatch reports
    fn serializer_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// UTF-8 strings
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn write(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn read(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Raw bytes, stored as is
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn write(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn read(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Any serde type, encoded as JSON
pub struct JsonSerializer<T>(PhantomData<fn() -> T>);

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        JsonSerializer(PhantomData)
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JsonSerializer<{}>", std::any::type_name::<T>())
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn write(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn read(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::<BTreeMap<String, u32>>::new();
        let mut value = BTreeMap::new();
        value.insert("hits".to_string(), 3);
        let bytes = serializer.write(&value).unwrap();
        assert_eq!(bytes, br#"{"hits":3}"#.to_vec());
        assert_eq!(serializer.read(&bytes).unwrap(), value);
        assert!(serializer.read(b"not json").is_err());
    }

    #[test]
    fn test_string_serializer_rejects_invalid_utf8() {
        assert!(StringSerializer.read(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_serializer_identity() {
        let a: &dyn Serializer<String> = &StringSerializer;
        let b: &dyn Serializer<String> = &JsonSerializer::<String>::new();
        assert_ne!(a.serializer_id(), b.serializer_id());
        assert_eq!(a.serializer_id(), StringSerializer.serializer_id());
        assert!(b.serializer_name().contains("JsonSerializer"));
    }
}
