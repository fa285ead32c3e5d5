//! Shared data structures for the navigation uplink
//!
//! - `nav`: decoded receiver messages (GPS time, position, orientation)
//! - `location`: fused `LocationRecord` and its free-form status map

mod location;
mod nav;

pub use location::*;
pub use nav::*;
