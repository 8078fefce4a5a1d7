pub mod extensions;
pub mod handlers;
pub mod processor;
pub mod reply;
pub mod worker;

/// Renewal Time - T1 - time until client enters RENEWING state (0.5 * lease_time)
pub fn renewal_time(lease_time: u32) -> u32 {
    lease_time / 2
}

/// Rebinding Time - T2 - time until client enters REBINDING state (0.875 * lease_time)
pub fn rebinding_time(lease_time: u32) -> u32 {
    (u64::from(lease_time) * 7 / 8) as u32
}

pub use worker::v4_worker;
