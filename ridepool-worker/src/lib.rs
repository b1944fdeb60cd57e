pub mod worker;

pub use worker::{anchor_pass, run_anchor_job, run_expiry_job, AnchorPass};
