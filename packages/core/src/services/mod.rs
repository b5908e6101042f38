pub mod mock;
pub mod telegram;
pub mod twitter;
