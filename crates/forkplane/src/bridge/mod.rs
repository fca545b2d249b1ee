//! Wire bridge between the master and its forks.
//!
//! - **protocol**: Message types (ForkRequest, ForkAction) and work descriptors
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
