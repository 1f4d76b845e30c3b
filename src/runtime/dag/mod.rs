//! Event graph for package loading
//!
//! Every step of loading a package is a node. A node counts its
//! outstanding prerequisites and fires when the count reaches zero and
//! the owner has declared it is done adding prerequisites. Fired nodes are
//! queued; the scheduler routes each to the package that owns it. Removing
//! a fired node releases everything waiting on it.
//!
//! # Architecture
//!
//! - [`NodeRef`](node::NodeRef) - identity of a node: package, table item and phase
//! - [`Phase`](node::Phase) - what a node gates
//! - [`EventGraph`](graph::EventGraph) - node states, arcs and the fired queue
//! - [`GraphError`](graph::GraphError) - broken graph primitives

pub mod graph;
pub mod node;

pub use graph::{EventGraph, GraphError, GraphStats};
pub use node::{NodeRef, Phase};
