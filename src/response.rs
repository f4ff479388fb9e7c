use crate::error::{RestError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response is the decoded body of a provider call.
///
/// Every body starts with the same envelope: `errcode` (0 on success, absent
/// on many successful calls) and `errmsg`. All other fields are kept as-is in
/// `data` and can be reached by path or unmarshaled with [`Response::apply`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Provider result code, 0 on success
    #[serde(default)]
    pub errcode: i64,

    /// Provider result message
    #[serde(default)]
    pub errmsg: String,

    /// Remaining response fields
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Response {
    /// Decode a response body. The body must be a JSON object.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RestError::decode(format!("body is not JSON: {}", e)))?;

        if !value.is_object() {
            return Err(RestError::decode("body is not a JSON object"));
        }

        serde_json::from_value(value)
            .map_err(|e| RestError::decode(format!("malformed envelope: {}", e)))
    }

    /// Check whether the provider reported success
    pub fn is_success(&self) -> bool {
        self.errcode == 0
    }

    /// Turn a non-zero `errcode` into [`RestError::Api`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RestError::from_response(self))
        }
    }

    /// Get the complete response body as a JSON object
    pub fn raw(&self) -> Value {
        let mut map = self.data.clone();
        map.insert("errcode".to_string(), Value::Number(self.errcode.into()));
        map.insert("errmsg".to_string(), Value::String(self.errmsg.clone()));
        Value::Object(map)
    }

    /// Apply unmarshals the whole response body into the provided type
    pub fn apply<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.raw()).map_err(|e| e.into())
    }

    /// Get a value from the response by a slash-separated path.
    /// For example, "button/0/name" reads the name of the first menu button.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('/').filter(|s| !s.is_empty());

        let mut current = self.data.get(parts.next()?)?;

        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    arr.get(index)?
                }
                _ => return None,
            };
        }

        Some(current)
    }

    /// Get a string value from the response by a slash-separated path
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| v.as_str().map(|s| s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_without_errcode_is_success() {
        let response = Response::decode(br#"{"ticket": "abc", "expire_seconds": 60}"#).unwrap();
        assert!(response.is_success());
        assert_eq!(response.get_string("ticket"), Some("abc".to_string()));
        assert!(response.into_result().is_ok());
    }

    #[test]
    fn test_response_error_envelope() {
        let response = Response::decode(br#"{"errcode": 40003, "errmsg": "invalid openid"}"#).unwrap();
        assert!(!response.is_success());
        assert_eq!(response.into_result().unwrap_err().code(), Some(40003));
    }

    #[test]
    fn test_response_rejects_non_object() {
        assert!(matches!(Response::decode(b"[1, 2]"), Err(RestError::Decode { .. })));
        assert!(matches!(Response::decode(b"<html>"), Err(RestError::Decode { .. })));
    }

    #[test]
    fn test_response_get_path() {
        let response = Response::decode(
            br#"{"menu": {"button": [{"name": "today"}, {"name": "news"}]}}"#,
        )
        .unwrap();
        assert_eq!(response.get_string("menu/button/1/name"), Some("news".to_string()));
        assert_eq!(response.get("menu/button/7"), None);
        assert_eq!(response.get(""), None);
    }

    #[test]
    fn test_response_apply() {
        #[derive(Deserialize)]
        struct QrTicket {
            errcode: i64,
            ticket: String,
        }

        let response = Response::decode(br#"{"ticket": "t-1"}"#).unwrap();
        let ticket: QrTicket = response.apply().unwrap();
        assert_eq!(ticket.errcode, 0);
        assert_eq!(ticket.ticket, "t-1");
    }
}
