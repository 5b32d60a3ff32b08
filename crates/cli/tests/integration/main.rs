//! Integration tests driving the treebuild binary against shell-script modules.

mod common;

mod build_tests;
mod gc_tests;
mod inspect_tests;
