//! Header carriers used to move trace context across broker boundaries
//!
//! A carrier is a read/write view over string key/value pairs. Each
//! backend adapts its native header representation (Kafka record headers,
//! NATS header maps, AMQP field tables) to these traits so the propagator
//! never depends on a concrete broker client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read side of a carrier
pub trait CarrierReader {
    /// All keys present in the carrier
    fn keys(&self) -> Vec<&str>;

    /// Value stored under `key`, if any
    fn get(&self, key: &str) -> Option<&str>;
}

/// Write side of a carrier.
///
/// Setting a key that already exists replaces the previous value so a
/// message never carries two conflicting `traceparent` headers.
pub trait CarrierWriter {
    fn set(&mut self, key: &str, value: String);
}

/// Uniform header bag carried by every [`Envelope`](crate::messaging::Envelope)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders(HashMap<String, String>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every readable header out of a native carrier
    pub fn from_reader<R: CarrierReader + ?Sized>(reader: &R) -> Self {
        reader
            .keys()
            .into_iter()
            .filter_map(|key| {
                reader
                    .get(key)
                    .map(|value| (key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Copy every header into a native carrier
    pub fn write_to<W: CarrierWriter + ?Sized>(&self, writer: &mut W) {
        for (key, value) in &self.0 {
            writer.set(key, value.clone());
        }
    }
}

impl FromIterator<(String, String)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl CarrierReader for MessageHeaders {
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl CarrierWriter for MessageHeaders {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

impl CarrierReader for HashMap<String, String> {
    fn keys(&self) -> Vec<&str> {
        HashMap::keys(self).map(String::as_str).collect()
    }

    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl CarrierWriter for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Inbound HTTP headers, so a caller-supplied `traceparent` can be inherited
pub struct HttpHeaderReader<'a>(pub &'a axum::http::HeaderMap);

impl CarrierReader for HttpHeaderReader<'_> {
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn test_set_replaces_existing_value() {
        let mut headers = MessageHeaders::new().with("traceparent", "old");
        headers.set("traceparent", "new".to_string());

        assert_eq!(headers.len(), 1);
        assert_eq!(CarrierReader::get(&headers, "traceparent"), Some("new"));
    }

    #[test]
    fn test_from_reader_copies_all_headers() {
        let mut source: HashMap<String, String> = HashMap::new();
        source.insert("a".to_string(), "1".to_string());
        source.insert("b".to_string(), "2".to_string());

        let headers = MessageHeaders::from_reader(&source);
        assert_eq!(headers.len(), 2);
        assert_eq!(CarrierReader::get(&headers, "b"), Some("2"));
    }

    #[test]
    fn test_missing_key_is_none() {
        let headers = MessageHeaders::new();
        assert!(CarrierReader::get(&headers, "traceparent").is_none());
        assert!(CarrierReader::keys(&headers).is_empty());
    }

    #[test]
    fn test_http_reader_is_case_insensitive() {
        let mut map = HeaderMap::new();
        map.insert("Traceparent", HeaderValue::from_static("00-abc"));

        let reader = HttpHeaderReader(&map);
        assert_eq!(reader.get("traceparent"), Some("00-abc"));
        assert_eq!(reader.keys(), vec!["traceparent"]);
    }
}
