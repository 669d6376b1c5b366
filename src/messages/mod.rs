pub mod types;
pub mod wire;

pub use types::{
    BatchEntry, DeliveryStatus, Direction, IncomingMessage, OutgoingMessage, ReplyStatus, Request,
    Response,
};
pub use wire::{
    decode_request, decode_response, encode_request, encode_response, read_frame, write_frame,
    FrameError, ProtocolError, MAX_FRAME_SIZE,
};
