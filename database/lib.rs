mod error;
mod pool;

#[cfg(any(test, feature = "test-support"))]
pub mod test;

pub use error::*;
pub use pool::*;

pub fn new_uuid() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}
