pub mod authorization;
pub mod bus;
pub mod credentials;
pub mod ipam;
pub mod lifecycle;
pub mod locks;
pub mod network_registry;
pub mod node_registry;
pub mod peers;
pub mod propagation;
pub mod topology;
pub mod user_registry;

pub use authorization::{AuthorizationGate, RequestContext, RoutePolicy, Scope};
pub use lifecycle::NodeLifecycle;
pub use propagation::Propagator;
