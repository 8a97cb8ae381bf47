pub mod service;
pub mod upstream;

pub use service::{build_router, Limiters};
pub use upstream::{forward, Upstream};
