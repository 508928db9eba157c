pub mod framing;
pub mod protocol;
pub mod server;
pub mod timeout;

pub use framing::{Frame, FrameReader, Framing};
pub use server::McpServer;
