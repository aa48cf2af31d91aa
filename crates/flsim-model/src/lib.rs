mod domain;
pub use domain::*;

mod job;
pub use job::*;

mod protocol;
pub use protocol::*;
