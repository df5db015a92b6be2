mod create;
mod status;
mod throttle;

pub use create::Create;
pub use status::Status;
pub use throttle::Throttle;
