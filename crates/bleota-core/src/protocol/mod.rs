//! OTA wire protocol.

pub mod constants;
pub mod encoder;
pub mod frame;
pub mod handshake;

pub use encoder::{Framing, PlanError, TransferPlan};
pub use frame::{FrameError, SequencedFrame, encode_sequenced};
pub use handshake::{Handshake, HandshakeError, Integrity};
