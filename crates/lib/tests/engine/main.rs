//! End-to-end tests of the build engine with shell-script modules.

mod common;

mod build_tests;
mod cache_tests;
mod failure_tests;
