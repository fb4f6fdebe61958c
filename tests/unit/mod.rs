//! Integration test tree for the exchange core.

mod common;

mod bus_tests;
mod facade_tests;
mod rest_tests;
mod time_tests;
mod ws_tests;
