pub mod config;
pub mod serve;
pub mod subscription;
pub mod task;
pub mod worker;
