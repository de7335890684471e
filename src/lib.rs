pub mod admission;
pub mod balancer;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod limits;
pub mod locker;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod registry;
