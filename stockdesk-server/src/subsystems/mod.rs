pub mod assistant;
pub mod library;
pub mod quotes;
pub mod throttle;
