pub mod auto_topup;
pub mod record_status;
pub mod subscription;
pub mod subscription_pause;
pub mod wallet;
