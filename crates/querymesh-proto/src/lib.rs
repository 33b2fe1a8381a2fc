//! # querymesh-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for querymesh.
//!
//! This crate provides the `Store` read API spoken both by backends and by
//! the fan-out proxy, which serves the same four operations it consumes:
//! `Info`, `Series` (server streaming), `LabelNames` and `LabelValues`.
//!
//! Conversions between wire types and the `querymesh-core` label model live
//! in [`conversions`].

pub mod conversions;

// Generated protobuf code
pub mod store {
    pub mod v1 {
        tonic::include_proto!("querymesh.store.v1");
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use store::v1::{
    store_client::StoreClient,
    store_server::{Store, StoreServer},
    chunk, label_matcher, series_response, Aggr, AggrChunk, Chunk, InfoRequest, InfoResponse, Label, LabelMatcher,
    LabelNamesRequest, LabelNamesResponse, LabelSet, LabelValuesRequest, LabelValuesResponse,
    PartialResponseStrategy, QueryHints, Series, SeriesRequest, SeriesResponse, ShardInfo,
    StoreType, TsdbInfo,
};

// Common error type for proto operations
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

impl SeriesResponse {
    /// Wrap a series as a response.
    pub fn from_series(series: Series) -> Self {
        Self {
            result: Some(series_response::Result::Series(series)),
        }
    }

    /// Wrap a warning as a response.
    pub fn from_warning(warning: impl Into<String>) -> Self {
        Self {
            result: Some(series_response::Result::Warning(warning.into())),
        }
    }

    /// Wrap query hints as a response.
    pub fn from_hints(hints: QueryHints) -> Self {
        Self {
            result: Some(series_response::Result::Hints(hints)),
        }
    }

    /// The series payload, if this response carries one.
    pub fn series(&self) -> Option<&Series> {
        match self.result {
            Some(series_response::Result::Series(ref s)) => Some(s),
            _ => None,
        }
    }

    /// The warning text, if this response carries one.
    pub fn warning(&self) -> Option<&str> {
        match self.result {
            Some(series_response::Result::Warning(ref w)) => Some(w.as_str()),
            _ => None,
        }
    }
}

impl Series {
    /// Minimum time of the first chunk. Chunkless series (e.g. responses to
    /// skip-chunks requests) sort before any chunked series with the same
    /// labels.
    pub fn first_chunk_min_time(&self) -> i64 {
        self.chunks.first().map(|c| c.min_time).unwrap_or(i64::MIN)
    }
}
