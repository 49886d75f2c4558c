//! Request handlers for the table API.

mod rows;

pub use rows::*;
