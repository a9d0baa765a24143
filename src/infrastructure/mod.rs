pub mod broker;
pub mod bus;
pub mod feed;
pub mod persistence;
