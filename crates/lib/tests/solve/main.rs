mod common;
mod scenario_tests;
