//! 网关：入站帧协议、控制面，以及（`gateway` feature）WebSocket 服务器

pub mod control;
pub mod protocol;
#[cfg(feature = "gateway")]
pub mod server;

pub use control::ControlPlane;
pub use protocol::{ControlRequest, ErrorPayload, FrameReply, InboundFrame};
#[cfg(feature = "gateway")]
pub use server::GatewayServer;
