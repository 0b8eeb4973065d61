//! Shared text helpers for embedding subprocess and provider output in
//! errors and logs without blowing up line length.

mod text;

pub use text::{first_line, truncate_with_marker};
