/// Builder for constructing run controllers.
pub mod builder;
/// The run controller and its public operations.
pub mod controller;
/// Per-lane FIFO workers.
pub mod lane;
/// Cooperative cancellation token.
pub mod shutdown;

pub use builder::RunControllerBuilder;
pub use controller::RunController;
pub use lane::LaneSnapshot;
pub use shutdown::ShutdownToken;
