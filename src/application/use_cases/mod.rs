pub mod subscription;
pub mod subscription_pause;
pub mod wallet;
