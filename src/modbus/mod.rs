pub mod frame;
pub mod pdu;

pub use frame::{encode_frame, FrameDecoder, RequestFrame};
pub use pdu::{ExceptionCode, FunctionCode, QuantityLimits, Request, Response};
