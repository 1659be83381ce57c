//! Stream error types
//!
//! Every failure the engine reports is a [`StreamError`]. Errors are `Clone`
//! because a single terminal error is handed to every pending write callback,
//! every `end` callback and the `error` event.

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while driving a stream
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("The \"chunk\" argument must be bytes or text in non-object mode")]
    InvalidChunk,

    #[error("May not write null values to stream")]
    NullValues,

    #[error("write after end")]
    WriteAfterEnd,

    #[error("stream.push() after EOF")]
    PushAfterEof,

    #[error("stream.unshift() after end event")]
    UnshiftAfterEndEvent,

    #[error("Cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    #[error("Cannot call {0} after a stream was finished")]
    AlreadyFinished(&'static str),

    #[error("Premature close")]
    PrematureClose,

    #[error("The {0}() method is not implemented")]
    MethodNotImplemented(&'static str),

    #[error("Callback called multiple times")]
    MultipleCallback,

    #[error("Calling transform done when still transforming")]
    TransformAlreadyTransforming,

    #[error("Calling transform done when writable length != 0")]
    TransformWithLengthZero,

    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("Invalid {encoding} data: {reason}")]
    InvalidEncodedData {
        encoding: &'static str,
        reason: String,
    },

    #[error("pipeline requires at least two streams")]
    MissingPipelineStreams,

    #[error("pipeline stage {index} is not {expected}")]
    InvalidPipelineStage { index: usize, expected: &'static str },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Create an application-level error with a message
    pub fn other(message: impl Into<String>) -> Self {
        StreamError::Other(message.into())
    }

    /// Node.js error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::InvalidChunk => "ERR_INVALID_ARG_TYPE",
            StreamError::NullValues => "ERR_STREAM_NULL_VALUES",
            StreamError::WriteAfterEnd => "ERR_STREAM_WRITE_AFTER_END",
            StreamError::PushAfterEof => "ERR_STREAM_PUSH_AFTER_EOF",
            StreamError::UnshiftAfterEndEvent => "ERR_STREAM_UNSHIFT_AFTER_END_EVENT",
            StreamError::Destroyed(_) => "ERR_STREAM_DESTROYED",
            StreamError::AlreadyFinished(_) => "ERR_STREAM_ALREADY_FINISHED",
            StreamError::PrematureClose => "ERR_STREAM_PREMATURE_CLOSE",
            StreamError::MethodNotImplemented(_) => "ERR_METHOD_NOT_IMPLEMENTED",
            StreamError::MultipleCallback => "ERR_MULTIPLE_CALLBACK",
            StreamError::TransformAlreadyTransforming => "ERR_TRANSFORM_ALREADY_TRANSFORMING",
            StreamError::TransformWithLengthZero => "ERR_TRANSFORM_WITH_LENGTH_0",
            StreamError::UnknownEncoding(_) => "ERR_UNKNOWN_ENCODING",
            StreamError::InvalidEncodedData { .. } => "ERR_INVALID_ARG_VALUE",
            StreamError::MissingPipelineStreams => "ERR_MISSING_ARGS",
            StreamError::InvalidPipelineStage { .. } => "ERR_INVALID_ARG_TYPE",
            StreamError::Io(_) => "ERR_IO",
            StreamError::Other(_) => "ERR_STREAM_ERROR",
        }
    }

    /// Whether this error signals a broken hook implementation rather than
    /// a failure of the data flowing through the stream
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            StreamError::MultipleCallback
                | StreamError::TransformAlreadyTransforming
                | StreamError::TransformWithLengthZero
                | StreamError::MethodNotImplemented(_)
        )
    }

    pub fn is_premature_close(&self) -> bool {
        matches!(self, StreamError::PrematureClose)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
