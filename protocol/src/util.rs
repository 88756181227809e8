/// Serializes table bytes as a base64 string, for `#[serde(with = "util::base64_bytes")]`.
pub mod base64_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::decode(text.as_bytes()).map_err(|x| D::Error::custom(format!("Invalid base64 data: {}", x)))
    }
}
