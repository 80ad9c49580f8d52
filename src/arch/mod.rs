pub mod activations;
mod feedforward;
mod forward_pass;

pub use feedforward::{Feedforward, feedforward_init, permute_hidden, permute_hidden_traced};
pub(crate) use feedforward::Layers;
pub use forward_pass::ForwardPass;
