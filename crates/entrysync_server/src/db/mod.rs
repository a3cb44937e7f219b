mod repo;
mod schema;

pub use repo::{Commit, LogRepo};
pub use schema::init_database;
