mod command_registry;
mod image_urls;
mod intent_parser;

pub use command_registry::CHAT_HELP_COMMANDS;
pub use image_urls::detect_image_urls;
pub use intent_parser::{parse_intent, Intent};
