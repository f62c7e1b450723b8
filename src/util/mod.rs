pub mod buf_ext;
pub mod path;
pub mod time;
