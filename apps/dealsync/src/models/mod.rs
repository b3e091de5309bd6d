pub mod checkpoint;
pub mod deal;
