mod parser;
mod schema;

pub use parser::*;
pub use schema::*;
