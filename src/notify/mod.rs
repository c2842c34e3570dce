//! Ways of reaching a human when a prompt needs an answer.

mod queue;
mod terminal;
mod traits;

pub use queue::QueueChannel;
pub use terminal::{REPLY_MARKER, TerminalChannel, parse_reply_line};
pub use traits::{DeliveryReceipt, InboundReply, NotificationChannel};
