pub mod compile;
pub mod device;
pub mod resources;
pub mod types;
