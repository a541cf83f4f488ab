//! Domain error types for the shard fleet and REST coordinator
//!
//! Structured thiserror types for navigable diagnostics and compile-time
//! exhaustive handling.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! Library code returns Result<T, GatewayError> or Result<T, RestError>.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// A single validation failure reported by the REST API
///
/// `path` is the dotted location of the offending field inside the request
/// body, e.g. `embeds.0.title`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub code: String,
    pub message: String,
}

/// REST errors surfaced to the caller
///
/// 429 responses never appear here: they are retried inside the
/// rate-limit coordinator.
#[derive(Error, Debug)]
pub enum RestError {
    /// Non-429 4xx/5xx response
    #[error("request failed with status {status}: {message}{}", format_field_errors(.errors))]
    Request {
        status: u16,
        code: Option<u64>,
        message: String,
        errors: Vec<FieldError>,
    },

    /// The request exceeded the configured hard timeout
    #[error("request on route '{route}' timed out after {after:?}")]
    Timeout { route: String, after: Duration },

    /// Connection-level failure from the HTTP client
    #[error("HTTP transport failed")]
    Transport(#[source] reqwest::Error),

    /// A successful response body did not match the expected shape
    #[error("failed to decode response body")]
    Decode(#[source] serde_json::Error),

    /// Caller-supplied header name or value was not valid HTTP
    #[error("invalid request header '{name}'")]
    InvalidHeader { name: String },

    /// The request queue worker is gone (coordinator dropped mid-flight)
    #[error("request queue for route '{route}' closed")]
    QueueClosed { route: String },
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<u64>,
    message: Option<String>,
    errors: Option<serde_json::Value>,
}

impl RestError {
    /// Build a `Request` error from a failed response
    ///
    /// Bodies that are not JSON fall back to the raw text as the message.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(parsed) => {
                let mut errors = Vec::new();
                if let Some(tree) = &parsed.errors {
                    collect_field_errors(tree, String::new(), &mut errors);
                }
                RestError::Request {
                    status,
                    code: parsed.code,
                    message: parsed.message.unwrap_or_default(),
                    errors,
                }
            }
            Err(_) => RestError::Request {
                status,
                code: None,
                message: String::from_utf8_lossy(body).into_owned(),
                errors: Vec::new(),
            },
        }
    }

    /// HTTP status for remote failures
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Walk the nested `errors` object, emitting one entry per `_errors` leaf
fn collect_field_errors(node: &serde_json::Value, path: String, out: &mut Vec<FieldError>) {
    let Some(map) = node.as_object() else {
        return;
    };

    if let Some(leaves) = map.get("_errors").and_then(|v| v.as_array()) {
        for leaf in leaves {
            out.push(FieldError {
                path: path.clone(),
                code: leaf["code"].as_str().unwrap_or_default().to_string(),
                message: leaf["message"].as_str().unwrap_or_default().to_string(),
            });
        }
    }

    for (key, child) in map.iter().filter(|(k, _)| k.as_str() != "_errors") {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        collect_field_errors(child, child_path, out);
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("\n  {}: {} ({})", e.path, e.message, e.code))
        .collect()
}

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
///
/// Example log output:
/// ```text
/// GatewayError::ShardFatal { shard_id: 3, code: 4014 }
/// → "shard 3 closed with fatal code 4014"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Close code the shard must not recover from (sharding or intents misconfigured)
    #[error("shard {shard_id} closed with fatal code {code}")]
    ShardFatal { shard_id: u32, code: u16 },

    /// Attempted to send while the shard has no open connection
    #[error("shard {shard_id} has no open connection")]
    NotConnected { shard_id: u32 },

    /// Attempted to resume without a session id
    #[error("shard {shard_id} cannot resume without a session id")]
    NoSession { shard_id: u32 },

    /// Websocket connect failed
    #[error("shard {shard_id} failed to connect")]
    Connect {
        shard_id: u32,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    /// zlib-stream inflate failed
    #[error("shard {shard_id} failed to inflate payload")]
    Decompress {
        shard_id: u32,
        #[source]
        source: flate2::DecompressError,
    },

    /// Gateway payload was not valid JSON or had an unexpected shape
    #[error("failed to decode gateway payload")]
    Decode(#[source] serde_json::Error),

    /// Outbound frame could not be serialized
    #[error("failed to encode gateway frame for opcode {op}")]
    Encode {
        op: u8,
        #[source]
        source: serde_json::Error,
    },

    /// REST call made on behalf of the gateway failed (discovery)
    #[error("gateway REST call failed")]
    Rest(#[from] RestError),

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Event serialization failed
    #[error("event serialization failed for {event_type} on shard {shard_id}")]
    SerializationFailed {
        event_type: String,
        shard_id: u32,
        #[source]
        source: serde_json::Error,
    },

    /// The spawn queue worker stopped before the shard was brought up
    #[error("spawn queue closed before shard {shard_id} started")]
    SpawnQueueClosed { shard_id: u32 },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::ShardFatal { .. } => "shard_fatal",
            Self::NotConnected { .. } => "not_connected",
            Self::NoSession { .. } => "no_session",
            Self::Connect { .. } => "connect",
            Self::Decompress { .. } => "decompress",
            Self::Decode(_) => "decode",
            Self::Encode { .. } => "encode",
            Self::Rest(_) => "rest",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::SerializationFailed { .. } => "serialization",
            Self::SpawnQueueClosed { .. } => "spawn_queue_closed",
            Self::Config(_) => "config",
        }
    }

    /// True for errors caused by the caller rather than the remote service
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::NoSession { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            GatewayError::ShardFatal { shard_id: 0, code: 4014 }.error_type_label(),
            GatewayError::NotConnected { shard_id: 0 }.error_type_label(),
            GatewayError::NoSession { shard_id: 0 }.error_type_label(),
            GatewayError::Connect {
                shard_id: 0,
                source: Box::new(tokio_tungstenite::tungstenite::Error::ConnectionClosed),
            }
            .error_type_label(),
            GatewayError::Decompress {
                shard_id: 0,
                source: flate2::Decompress::new(true)
                    .decompress_vec(
                        b"not zlib",
                        &mut Vec::with_capacity(64),
                        flate2::FlushDecompress::Sync,
                    )
                    .unwrap_err(),
            }
            .error_type_label(),
            GatewayError::Decode(serde_json::from_str::<()>("invalid").unwrap_err())
                .error_type_label(),
            GatewayError::Encode {
                op: 2,
                source: serde_json::from_str::<()>("invalid").unwrap_err(),
            }
            .error_type_label(),
            GatewayError::Rest(RestError::QueueClosed { route: "/x".into() }).error_type_label(),
            GatewayError::NatsPublishFailed {
                subject: "test".to_string(),
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::NatsConnectionFailed(test_error()).error_type_label(),
            GatewayError::SerializationFailed {
                event_type: "test".to_string(),
                shard_id: 0,
                source: serde_json::from_str::<()>("invalid").unwrap_err(),
            }
            .error_type_label(),
            GatewayError::SpawnQueueClosed { shard_id: 0 }.error_type_label(),
            GatewayError::Config("test".to_string()).error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn preconditions_are_distinct_from_remote_errors() {
        assert!(GatewayError::NotConnected { shard_id: 1 }.is_precondition());
        assert!(GatewayError::NoSession { shard_id: 1 }.is_precondition());
        assert!(!GatewayError::ShardFatal { shard_id: 1, code: 4013 }.is_precondition());
    }

    #[test]
    fn error_messages_contain_context() {
        let err = GatewayError::ShardFatal { shard_id: 3, code: 4014 };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"), "message should contain shard_id");
        assert!(msg.contains("4014"), "message should contain close code");

        let err = GatewayError::NatsPublishFailed {
            subject: "events.message_create".to_string(),
            source: test_error(),
        };
        assert!(err.to_string().contains("events.message_create"));
    }

    #[test]
    fn rest_error_flattens_nested_field_errors() {
        let body = serde_json::json!({
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {
                "content": {
                    "_errors": [{ "code": "BASE_TYPE_MAX_LENGTH", "message": "Must be 2000 or fewer in length." }]
                },
                "embeds": {
                    "0": {
                        "title": {
                            "_errors": [{ "code": "BASE_TYPE_REQUIRED", "message": "This field is required" }]
                        }
                    }
                }
            }
        });

        let err = RestError::from_response(400, body.to_string().as_bytes());
        let RestError::Request { status, code, message, errors } = &err else {
            panic!("expected Request error, got {err:?}");
        };
        assert_eq!(*status, 400);
        assert_eq!(*code, Some(50035));
        assert_eq!(message, "Invalid Form Body");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.path == "content" && e.code == "BASE_TYPE_MAX_LENGTH"));
        assert!(errors.iter().any(|e| e.path == "embeds.0.title" && e.code == "BASE_TYPE_REQUIRED"));
        assert!(err.to_string().contains("embeds.0.title"));
    }

    #[test]
    fn rest_error_tolerates_non_json_body() {
        let err = RestError::from_response(502, b"Bad Gateway");
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("Bad Gateway"));
    }
}
