//! Wire types shared by both legs of the relay.

pub mod codec;
pub mod frame;
pub mod models;

pub use codec::FrameCodec;
pub use frame::{ErrorDetail, Frame};
