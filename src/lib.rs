#[macro_use] extern crate lazy_static;

pub mod block;
pub mod fs;
pub mod mscp;
pub mod ops;
