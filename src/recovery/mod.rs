//! Guardian Recovery
//!
//! Social recovery of a user's root key. The key is split with Shamir's
//! scheme, one share sealed to each guardian. A new device opens a
//! recovery session; once K' guardians approve with signed shares, the key
//! is reconstructed and handed out once.
//!
//! ```text
//! configure ──▶ split + seal ──▶ GuardianAssignment × N
//! initiate  ──▶ RecoverySession (pending, snapshot, expiry)
//! approve   ──▶ verify signature + share digest ──▶ … ──▶ completed (root key)
//! ```

pub mod guardian;
pub mod protocol;
pub mod session;

pub use guardian::{
    approval_message, AssignmentStatus, GuardianApproval, GuardianAssignment, GuardianIdentity, GuardianKeys,
    SealedShare,
};
pub use protocol::{GuardianConfig, GuardianEntry, GuardianRecoveryProtocol, RecoveryConfig};
pub use session::{ApprovalOutcome, DeviceInfo, GuardianSnapshot, RecoverySession, RecoveryStatus};
