pub mod daemon;
pub mod destination;
pub mod source;
pub mod sync;
