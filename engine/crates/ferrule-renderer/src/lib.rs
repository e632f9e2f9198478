pub mod pass;
pub mod renderer;
