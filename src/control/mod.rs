pub mod channel;
pub mod tokens;
