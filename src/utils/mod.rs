mod string;

pub use string::{slugify, truncate_chars, truncate_str, truncate_with_marker};
