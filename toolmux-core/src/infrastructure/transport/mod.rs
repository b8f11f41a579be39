//! Stdio transport for tool-server subprocesses.
//!
//! - [`frame`] - newline-delimited frame reader and serialized frame writer
//! - [`stdio`] - subprocess spawning and termination
//! - [`stderr`] - bounded capture of diagnostic output

pub mod frame;
pub mod stderr;
pub mod stdio;

pub use frame::{BoxedRead, BoxedWrite, FrameReader, FrameWriter};
pub use stderr::{StderrLog, with_stderr};
pub use stdio::{ChildProcess, Transport};
