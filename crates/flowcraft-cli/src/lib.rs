//! The `flowcraft` command-line interface: load a flow document, execute it
//! against a dispatcher, or inspect its dependency graph.

pub mod cli;
pub mod dispatcher;
