mod loader;
mod schema;

pub use loader::{load_from_env_or_file, load_from_path, local_hostname, resolve_paths, validate};
pub use schema::*;
