//! Wire layer for peer-to-peer calls.
//!
//! This module provides the message types and the line codec shared by both
//! directions of a connection.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request/Response) and the array wire format
//! - **codec**: Newline framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
