//! Chat platform seam and the stdio adapter.

pub mod stdio;
pub mod traits;

pub use stdio::StdioPlatform;
pub use traits::{ChatPlatform, ChatPlatformDyn, InboundStream, ReferencedMessage};
