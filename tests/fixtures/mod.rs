//! Test fixtures

mod two_node;

pub use two_node::{TwoNodeFixture, eventually, next_event, wait_for};
