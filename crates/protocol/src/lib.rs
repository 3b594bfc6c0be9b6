//! # telbridge Protocol Library
//!
//! This crate provides the wire layer of telbridge: turning the raw byte
//! stream of a TELNET-style remote shell into protocol events, and deciding
//! when a command's output is complete.
//!
//! ## Overview
//!
//! - **Framer**: Incremental TELNET decoder, negotiation refusals, command encoding
//! - **Prompt Detection**: Literal or regex prompts matched at the end of the output
//! - **Response Collection**: Echo stripping and truncation handling per command
//!
//! Nothing in this crate performs I/O.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Command / Response             │  ResponseCollector
//! ├─────────────────────────────────────────┤
//! │       Negotiation + Data Events         │  Framer
//! ├─────────────────────────────────────────┤
//! │          Transport (TCP stream)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{encode_command, refusals, FrameEvent, Framer, PromptPattern, ResponseCollector};
//!
//! let mut framer = Framer::new();
//! let mut collector = ResponseCollector::new("ls", PromptPattern::default());
//!
//! let wire = encode_command(b"ls").unwrap();
//! assert_eq!(wire, b"ls\r\n");
//!
//! // IAC DO ECHO, then the echoed command, its output and the prompt
//! let events = framer.decode(b"\xff\xfd\x01ls\r\ndir1 dir2\r\n/ # ");
//! assert_eq!(refusals(&events), vec![0xff, 0xfc, 0x01]);
//!
//! for event in &events {
//!     if let FrameEvent::Data(data) = event {
//!         collector.push(data);
//!     }
//! }
//! let response = collector.finish();
//! assert_eq!(response.output, b"dir1 dir2");
//! assert!(response.complete);
//! ```
//!
//! ## Modules
//!
//! - [`framer`]: TELNET stream decoding and command encoding
//! - [`prompt`]: Prompt patterns and response collection
//! - [`error`]: Error types

pub mod error;
pub mod framer;
pub mod prompt;

pub use error::{ProtocolError, Result};
pub use framer::{
    encode_command, refusal, refusals, FrameEvent, Framer, Verb, IAC, LINE_TERMINATOR,
};
pub use prompt::{PromptPattern, Response, ResponseCollector, DEFAULT_PROMPT, MAX_RESPONSE_SIZE};
