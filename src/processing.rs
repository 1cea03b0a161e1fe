//! Turning raw protocol responses into the status we hand out.

pub mod modpack;
pub mod reconcile;
pub mod status;

pub use modpack::{ModpackInfo, ModpackMetadata, merge_modpack, read_modpack_metadata};
pub use reconcile::{QueryInfo, reconcile};
pub use status::{PlayerRef, StatusResponse, parse_status_response};
