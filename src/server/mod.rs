pub mod admission;
pub mod measurement_server;
pub mod session;
