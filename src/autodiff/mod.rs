mod graph;
mod op;

pub use graph::{Graph, Var};
