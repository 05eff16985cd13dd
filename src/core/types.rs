use crate::core::errors::ExchangeError;
use crate::utils::url_encode;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// HTTP verb of a REST call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a REST call carries a `timestamp` and HMAC `signature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestSign {
    Unsigned,
    HmacSha256,
}

/// Query parameters, sent and signed in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Add a value that must be percent-encoded first, such as a JSON batch.
    #[must_use]
    pub fn with_encoded(mut self, key: impl Into<String>, value: &str) -> Self {
        self.push(key, url_encode(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One REST call as handed to a session.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub path: String,
    pub params: QueryParams,
    pub method: Method,
    pub sign: RestSign,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: QueryParams::new(),
            method,
            sign: RestSign::Unsigned,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn params(mut self, params: QueryParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(key, value);
        self
    }

    #[must_use]
    pub const fn signed(mut self) -> Self {
        self.sign = RestSign::HmacSha256;
        self
    }
}

/// Outcome of a REST call.
#[derive(Debug)]
pub enum RestResult {
    Success(Value),
    Fail(ExchangeError),
}

impl RestResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub const fn json(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Fail(_) => None,
        }
    }

    /// Reclassify an application-level rejection as a failure.
    ///
    /// A body with an `error` field, or a `code` other than 200, becomes `Fail`.
    /// A null body is a failure unless `null_allowed` is set, as some endpoints
    /// (listen-key keepalive and close) legitimately answer with nothing.
    pub fn has_error_code(&mut self, null_allowed: bool) -> bool {
        let Self::Success(value) = self else {
            return true;
        };

        let failure = if !null_allowed && value.is_null() {
            Some(ExchangeError::JsonRead("json is null/empty".to_string()))
        } else if let Some(object) = value.as_object() {
            if let Some(error) = object.get("error") {
                Some(ExchangeError::ApiError {
                    code: object.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    message: describe(error),
                })
            } else {
                match object.get("code") {
                    Some(code) => match code.as_i64() {
                        Some(200) => None,
                        Some(code) => Some(ExchangeError::ApiError {
                            code,
                            message: message_of(object),
                        }),
                        None => Some(ExchangeError::ApiError {
                            code: -1,
                            message: describe(code),
                        }),
                    },
                    None => None,
                }
            }
        } else {
            None
        };

        match failure {
            Some(err) => {
                *self = Self::Fail(err);
                true
            }
            None => false,
        }
    }

    pub fn into_result(self) -> Result<Value, ExchangeError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Fail(err) => Err(err),
        }
    }
}

/// Outcome of one WebSocket event.
#[derive(Debug)]
pub enum WsResult {
    Success(Value),
    Fail(ExchangeError),
    /// Delivered once, in answer to an explicit close.
    Disconnect,
}

impl WsResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnect)
    }

    pub const fn json(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Reclassify a stream payload carrying `code` or `error` as a failure.
    ///
    /// `Disconnect` is never an error.
    pub fn has_error_code(&mut self, null_allowed: bool) -> bool {
        let value = match self {
            Self::Disconnect => return false,
            Self::Fail(_) => return true,
            Self::Success(value) => value,
        };

        let failure = if !null_allowed && value.is_null() {
            Some(ExchangeError::JsonRead("json is null/empty".to_string()))
        } else if let Some(object) = value.as_object() {
            if object.contains_key("code") || object.contains_key("error") {
                Some(ExchangeError::ApiError {
                    code: object.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    message: object
                        .get("error")
                        .map_or_else(|| message_of(object), describe),
                })
            } else {
                None
            }
        } else {
            None
        };

        match failure {
            Some(err) => {
                *self = Self::Fail(err);
                true
            }
            None => false,
        }
    }
}

impl From<RestResult> for WsResult {
    fn from(result: RestResult) -> Self {
        match result {
            RestResult::Success(value) => Self::Success(value),
            RestResult::Fail(err) => Self::Fail(err),
        }
    }
}

fn message_of(object: &serde_json::Map<String, Value>) -> String {
    object.get("msg").map(describe).unwrap_or_default()
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(object) if object.contains_key("msg") => message_of(object),
        other => other.to_string(),
    }
}

/// Opaque handle of an open WebSocket session. Zero means "no session".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WsToken(u64);

impl WsToken {
    pub const INVALID: Self = Self(0);

    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for WsToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws#{}", self.0)
    }
}

/// Receives every result of a WebSocket stream, one at a time and in order.
pub type WsCallback = Arc<dyn Fn(WsResult) + Send + Sync + 'static>;
