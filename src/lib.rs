#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pylonbms_lib
//!
//! This crate provides a library for reading Pylontech battery modules
//! (US2000, US3000, ...) over their RS485 console protocol.
//!
//! The layers build on each other:
//!
//! - [`packet`]: frame markers and the 16 bit checksum trailer.
//! - [`protocol`]: request encoding, header parsing and the typed records of every query.
//! - [`stack`]: [`stack::PylontechStack`] discovers the modules of a stack, retries failed
//!   queries and aggregates a status round.
//! - [`transport`]: the [`transport::Transport`] trait the stack talks through.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `pylonbms` command-line tool.
//! - `serialport`: Enables the blocking RS485 transport using the `serialport` crate.
//! - `bin-dependencies`: Enables all features required by the `pylonbms` binary executable.

mod cursor;
/// Contains error types for the library.
mod error;
/// Frame level codec.
pub mod packet;
/// Defines the Pylontech RS485 protocol.
pub mod protocol;
/// Battery stack orchestration.
pub mod stack;
/// Transport abstraction and cancellation.
pub mod transport;

pub use cursor::HexCursor;
pub use error::Error;

/// Blocking serial transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
