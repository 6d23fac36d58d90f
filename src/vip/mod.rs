//! Virtual IP failover.
//!
//! Each controller and worker node runs one [`VipManager`] per role it
//! carries. The managers of a role campaign in a shared election; the leader
//! binds the role's virtual IP to its interface and releases it as soon as
//! leadership is lost:
//!
//! ```text
//! Follower ──campaign──▶ Candidate ──won──▶ Leader (VIP bound)
//!     ▲                      │                  │
//!     └──── backend error ───┘◀── leadership lost / stop (VIP released)
//! ```

pub mod interface;
pub mod manager;

pub use interface::{IpCommandInterface, NetworkInterface};
pub use manager::{VipManager, VipRole, VipSettings};
