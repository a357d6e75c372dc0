pub mod base;
pub mod health;
pub mod manager;
pub mod telegram;
pub mod web;

pub use base::Channel;
pub use manager::ChannelManager;
pub use telegram::TelegramChannel;
pub use web::WebChannel;
