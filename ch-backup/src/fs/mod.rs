pub mod digest;
pub mod walker;
