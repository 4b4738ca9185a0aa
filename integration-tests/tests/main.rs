mod common;

mod concurrent_registration;
mod graceful_shutdown;
mod relay_topology;
