//! Small shared helpers: JSON field paths and id generation.

pub mod id_generator;
pub mod json_path;
