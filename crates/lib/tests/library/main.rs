mod build_tests;
mod cache_tests;
mod common;
mod export_tests;
mod failure_tests;
