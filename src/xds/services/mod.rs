mod ads;
mod standalone;
mod stream;

pub use ads::AdsService;
pub use standalone::{CdsService, EdsService, LdsService, RdsService};
