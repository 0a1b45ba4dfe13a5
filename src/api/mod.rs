pub mod routes;
pub mod stream;

pub use routes::{create_router, AppState, USER_KEY_HEADER};
pub use stream::{filtered_snapshot, user_flip_stream};
