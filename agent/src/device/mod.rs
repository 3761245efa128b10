mod capabilities;

pub use capabilities::{detect_capabilities, HostInfo};
