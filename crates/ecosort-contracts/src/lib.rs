pub mod api;
pub mod chat;
pub mod events;
pub mod history;

pub use events::{ChannelEvent, EventPayload, EventWriter};
