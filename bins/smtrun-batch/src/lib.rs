//! Execution core of the batch runner: shared pools, execution backends,
//! jobs and the driver that fans them out.

pub mod backend;
pub mod context;
pub mod driver;
pub mod job;
pub mod pool;
pub mod topology;
