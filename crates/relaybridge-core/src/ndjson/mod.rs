//! NDJSON protocol spoken with the worker subprocess.
//!
//! - **framer**: reassembles newline-delimited JSON records from raw stdout chunks
//! - **envelope**: request records written to the worker's stdin
//! - **response**: tolerant interpretation of worker response records

mod envelope;
mod framer;
mod response;

pub use envelope::{
    DEFAULT_METHOD, DEFAULT_TEMPLATE, JSONRPC_VERSION, RequestEnvelope, RequestMetadata,
    RequestParams, chat_body,
};
pub use framer::{Frame, LineFramer};
pub use response::{
    ERROR_PREFIX, ExtractionRule, MESSAGE_RULES, PLACEHOLDER_MESSAGE, ResponseKind, RuleKind,
    WorkerResponse, extract_message, extract_reply_to,
};
