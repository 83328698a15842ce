pub mod location;
pub mod machine;
pub mod optimistic;
pub mod reconcile;
pub mod ride;
pub mod sync;
pub mod throttle;
