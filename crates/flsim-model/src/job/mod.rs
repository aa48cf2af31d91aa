mod meta;
pub use meta::{DeployMap, JobClient, JobMeta};

mod deploy;
pub use deploy::DeployArgs;
