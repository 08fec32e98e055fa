pub mod conversations;
pub mod schema;
