pub mod gpu;
pub mod logging;
pub mod memory;
pub mod timing;
