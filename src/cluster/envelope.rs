//! Wire envelopes exchanged between nodes.

use crate::error::{AsyncError, CodecError, Error, ErrorKind, Result};
use crate::types::RequestId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A routed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    /// Route handler key.
    pub type_key: String,
    /// Encoded request body.
    pub payload: Vec<u8>,
    /// Correlation id, unique per sending router.
    pub id: RequestId,
    /// Key the target shard was derived from.
    pub shard_key: String,
    /// Encoded AsyncLocal snapshot of the caller.
    pub snapshot: Vec<u8>,
    /// Deadline the caller applies, in milliseconds.
    pub timeout_ms: u64,
}

impl ClusterRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// An error carried back to the caller by class name and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub class_name: String,
    pub message: String,
}

impl RemoteException {
    /// Describe `error` for the wire.
    pub fn from_error(error: &AsyncError) -> Self {
        Self {
            class_name: error.class_name().to_string(),
            message: error.message().to_string(),
        }
    }

    /// Rebuild the error on the receiving side.
    pub fn into_error(self) -> AsyncError {
        AsyncError::remote(self.class_name, self.message)
    }
}

/// The answer to a [`ClusterRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResponse {
    /// Encoded response body; empty when `exception` is set or on timeout.
    pub payload: Vec<u8>,
    pub exception: Option<RemoteException>,
    pub timed_out: bool,
}

impl ClusterResponse {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// A failed response. The error travels as-is, whatever its kind; only
    /// [`timeout`](Self::timeout) marks the request deadline as missed.
    pub fn failure(error: &AsyncError) -> Self {
        Self {
            payload: Vec::new(),
            exception: Some(RemoteException::from_error(error)),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            payload: Vec::new(),
            exception: Some(RemoteException {
                class_name: ErrorKind::RouteTimeout.class_name().to_string(),
                message: message.into(),
            }),
            timed_out: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exception.is_none() && !self.timed_out
    }

    /// The payload, or the error this response describes.
    pub fn into_result(self) -> std::result::Result<Vec<u8>, AsyncError> {
        if self.timed_out {
            let message = self
                .exception
                .map(|e| e.message)
                .unwrap_or_else(|| "remote handler timed out".to_string());
            return Err(AsyncError::of_kind(ErrorKind::RouteTimeout, message));
        }
        match self.exception {
            Some(exception) => Err(exception.into_error()),
            None => Ok(self.payload),
        }
    }
}

/// A message delivered to every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBroadcast {
    pub type_key: String,
    pub payload: Vec<u8>,
    pub snapshot: Vec<u8>,
}

/// Encode an envelope or a payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Codec(CodecError::Serialization(e.to_string())))
}

/// Decode an envelope or a payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(CodecError::Deserialization(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_survives_wire() {
        let request = ClusterRequest {
            type_key: "user.get".into(),
            payload: encode(&42u64).unwrap(),
            id: 7,
            shard_key: "user-42".into(),
            snapshot: vec![1, 2, 3],
            timeout_ms: 1500,
        };
        let decoded: ClusterRequest = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.timeout(), Duration::from_millis(1500));
        assert_eq!(decode::<u64>(&decoded.payload).unwrap(), 42);
    }

    #[test]
    fn test_failure_response_reconstructs_error() {
        let error = AsyncError::illegal_state("bad state");
        let response = ClusterResponse::failure(&error);
        assert!(!response.is_success());
        let rebuilt = response.into_result().unwrap_err();
        assert_eq!(rebuilt.kind(), ErrorKind::IllegalState);
        assert_eq!(rebuilt.message(), "bad state");
    }

    #[test]
    fn test_failure_keeps_handler_timeout_kind() {
        let response = ClusterResponse::failure(&AsyncError::timeout("lookup took too long"));
        assert!(!response.timed_out);
        let rebuilt = response.into_result().unwrap_err();
        assert_eq!(rebuilt.kind(), ErrorKind::Timeout);
        assert_eq!(rebuilt.message(), "lookup took too long");
    }

    #[test]
    fn test_timeout_response() {
        let response = ClusterResponse::timeout("slow");
        assert!(response.timed_out);
        assert_eq!(response.into_result().unwrap_err().kind(), ErrorKind::RouteTimeout);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let bytes = encode(&ClusterBroadcast {
            type_key: "cache.evict".into(),
            payload: vec![9; 16],
            snapshot: Vec::new(),
        })
        .unwrap();
        assert!(matches!(
            decode::<ClusterBroadcast>(&bytes[..bytes.len() - 4]),
            Err(Error::Codec(CodecError::Deserialization(_)))
        ));
    }
}
