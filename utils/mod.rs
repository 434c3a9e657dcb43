//! Small data structures shared by the memory-management modules.

pub mod bitmap;
pub mod list;

pub use self::bitmap::Bitmap;
pub use self::list::{IntrusiveList, Link, Linked};
