//! Small, dependency-free data structures shared by the rest of the crate.
pub mod intrusive_list;
pub mod prio_bitmap;
