pub mod dispatcher;
pub mod executor;
pub mod lane;
pub mod reconciler;
