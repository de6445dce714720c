pub(crate) mod channel;
pub(crate) mod executor;
pub(crate) mod listener;
pub(crate) mod message;
pub(crate) mod poll;
pub(crate) mod task;

pub use channel::{Channel, Transaction};
pub use listener::{ChannelListener, Listener, NullListener};
pub use message::RequestParam;
pub use poll::PollHandle;
