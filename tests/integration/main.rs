//! Integration tests.

mod cli;
mod scenarios;
mod support;
