pub mod pattern;
pub mod truncation;
