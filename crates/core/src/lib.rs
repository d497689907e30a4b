pub mod ids;
pub mod pricing;
pub mod storage;
pub mod task;
pub mod usage;
