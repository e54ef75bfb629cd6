pub mod api;
pub mod client;
pub mod controllers;
pub mod rac;
pub mod util;
