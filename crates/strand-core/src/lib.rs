#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod cancel;
mod codec;
mod context;
mod deadline;
mod descriptor;
mod frame;
mod framing;
mod limits;
mod metadata;
mod status;
mod transport;

pub use cancel::*;
pub use codec::*;
pub use context::*;
pub use deadline::*;
pub use descriptor::*;
pub use frame::*;
pub use framing::*;
pub use limits::*;
pub use metadata::*;
pub use status::*;
pub use transport::*;

#[cfg(feature = "mem")]
pub use transport::mem::{MemConnection, MemListener, MemStream, MemTransport};
