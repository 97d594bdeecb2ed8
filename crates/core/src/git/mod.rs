//! Git CLI driver and URL helpers.

pub mod driver;
pub mod urls;

pub use driver::{dir_size_bytes, GitCmdResult, GitDriver};
