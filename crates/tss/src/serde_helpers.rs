//! Serde helpers for the signer-cluster wire format.

/// Base64 byte strings. `null` decodes to empty bytes.
///
/// Use with `#[serde(with = "crate::serde_helpers::base64_bytes")]` for `Vec<u8>` fields.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(&s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Unsigned integers carried as decimal strings.
pub mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional big integers as bare JSON numbers, also accepted as decimal strings.
///
/// Relies on serde_json's `arbitrary_precision` so numbers beyond `u64` keep their
/// digits. Values beyond `u64` are written as strings.
pub mod bigint_opt {
    use num_bigint::BigInt;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<BigInt>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            None => serializer.serialize_none(),
            Some(n) => match u64::try_from(n) {
                Ok(small) => serializer.serialize_u64(small),
                Err(_) => serializer.collect_str(n),
            },
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<BigInt>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = match Value::deserialize(deserializer)? {
            Value::Null => return Ok(None),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected integer, got {}",
                    other
                )))
            }
        };
        text.parse::<BigInt>()
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wire {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(with = "u64_string")]
        height: u64,
        #[serde(with = "bigint_opt", default)]
        price: Option<BigInt>,
    }

    #[test]
    fn test_wire_roundtrip() {
        let original = Wire {
            data: vec![0xde, 0xad, 0xbe, 0xef],
            height: 42,
            price: Some(BigInt::from(1_000_000_000u64)),
        };
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(
            json,
            r#"{"data":"3q2+7w==","height":"42","price":1000000000}"#
        );

        let decoded: Wire = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_null_bytes_and_string_bigint() {
        let decoded: Wire =
            serde_json::from_str(r#"{"data":null,"height":"7","price":"123456789012345678901234"}"#)
                .unwrap();
        assert!(decoded.data.is_empty());
        assert_eq!(
            decoded.price.unwrap().to_string(),
            "123456789012345678901234"
        );
    }

    #[test]
    fn test_bare_bigint_beyond_u64() {
        let decoded: Wire = serde_json::from_str(
            r#"{"data":"","height":"1","price":1234567890123456789012345}"#,
        )
        .unwrap();
        assert_eq!(
            decoded.price.unwrap().to_string(),
            "1234567890123456789012345"
        );

        let raw = r#"{"data":"","height":"1","price":98765432109876543210}"#;
        let value: serde_json::Value = serde_json::from_str(raw).unwrap();
        let decoded: Wire = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.price.unwrap().to_string(), "98765432109876543210");
    }

    #[test]
    fn test_bad_height_rejected() {
        let result: Result<Wire, _> = serde_json::from_str(r#"{"data":"","height":"x"}"#);
        assert!(result.is_err());
    }
}
