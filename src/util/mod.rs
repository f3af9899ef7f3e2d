pub mod clock;
pub mod window;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use window::RollingWindow;
