pub mod greet;
pub mod utils;
