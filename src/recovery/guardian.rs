//! Guardian identities, sealed shares and approvals
//!
//! A root-key share never leaves the owner's device in the clear: it is
//! sealed to the guardian's X25519 key with an ephemeral Diffie-Hellman
//! exchange, HKDF-SHA256 and AES-256-GCM. To approve a recovery the
//! guardian opens its share and signs the recovery challenge, bound to the
//! share digest, with its Ed25519 key.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::codec::crypto::{self, IV_LEN, TAG_LEN};
use crate::error::{Error, Result};
use crate::sss::Share;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

// =============================================================================
// Identity
// =============================================================================

/// Public half of a guardian: who they are and how to reach them securely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianIdentity {
    pub guardian_id: String,
    /// Ed25519 key approvals are verified with
    pub verifying_key: [u8; PUBLIC_KEY_LEN],
    /// X25519 key shares are sealed to
    pub encryption_key: [u8; PUBLIC_KEY_LEN],
}

impl GuardianIdentity {
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.verifying_key).map_err(|e| {
            Error::InvalidConfig(format!(
                "guardian {} has an invalid verifying key: {}",
                self.guardian_id, e
            ))
        })
    }
}

/// Guardian-held secrets. Lives on the guardian's device.
pub struct GuardianKeys {
    guardian_id: String,
    signing: SigningKey,
    encryption: StaticSecret,
}

impl fmt::Debug for GuardianKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardianKeys")
            .field("guardian_id", &self.guardian_id)
            .finish_non_exhaustive()
    }
}

impl GuardianKeys {
    pub fn generate(guardian_id: impl Into<String>) -> Self {
        Self {
            guardian_id: guardian_id.into(),
            signing: SigningKey::generate(&mut OsRng),
            encryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn guardian_id(&self) -> &str {
        &self.guardian_id
    }

    pub fn identity(&self) -> GuardianIdentity {
        GuardianIdentity {
            guardian_id: self.guardian_id.clone(),
            verifying_key: self.signing.verifying_key().to_bytes(),
            encryption_key: PublicKey::from(&self.encryption).to_bytes(),
        }
    }

    /// Decrypt the share sealed to this guardian.
    pub fn open_share(&self, user_id: &str, assignment: &GuardianAssignment) -> Result<Share> {
        if assignment.guardian_id != self.guardian_id {
            return Err(Error::UnauthorizedGuardian {
                guardian_id: self.guardian_id.clone(),
            });
        }

        let sealed = &assignment.sealed_share;
        let shared = self
            .encryption
            .diffie_hellman(&PublicKey::from(sealed.ephemeral_public));
        let info = share_info(user_id, &assignment.guardian_id, assignment.share_index);
        let key = crypto::hkdf_sha256(shared.as_bytes(), &sealed.ephemeral_public, &info)?;

        let mut plaintext = Zeroizing::new(sealed.ciphertext.clone());
        crypto::open(&key, &sealed.iv, &info, &mut plaintext, &sealed.tag)?;
        Share::from_bytes(&plaintext)
    }

    /// Open the assignment and sign an approval for `recovery_id`.
    pub fn approve(&self, recovery_id: Uuid, user_id: &str, assignment: &GuardianAssignment) -> Result<GuardianApproval> {
        let share = self.open_share(user_id, assignment)?;
        let message = approval_message(recovery_id, user_id, &self.guardian_id, &share.digest()?);
        let signature = self.signing.sign(&message).to_bytes();
        Ok(GuardianApproval { share, signature })
    }
}

// =============================================================================
// Sealed shares and assignments
// =============================================================================

/// A share encrypted to one guardian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedShare {
    pub ephemeral_public: [u8; PUBLIC_KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedShare {
    /// Seal `share` to `guardian` for `user_id`.
    pub fn seal(user_id: &str, guardian: &GuardianIdentity, share: &Share) -> Result<Self> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(guardian.encryption_key));

        let info = share_info(user_id, &guardian.guardian_id, share.x);
        let key = crypto::hkdf_sha256(shared.as_bytes(), &ephemeral_public, &info)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut ciphertext = share.to_bytes()?;
        let tag = crypto::seal(&key, &iv, &info, &mut ciphertext)?;

        Ok(Self {
            ephemeral_public,
            iv,
            tag,
            ciphertext,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Revoked,
}

/// A guardian's custody of one root-key share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianAssignment {
    pub guardian_id: String,
    pub share_index: u8,
    pub sealed_share: SealedShare,
    /// SHA-256 of the share's canonical encoding, hex
    pub share_digest: String,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl GuardianAssignment {
    pub fn new(user_id: &str, guardian: &GuardianIdentity, share: &Share) -> Result<Self> {
        Ok(Self {
            guardian_id: guardian.guardian_id.clone(),
            share_index: share.x,
            sealed_share: SealedShare::seal(user_id, guardian, share)?,
            share_digest: share.digest()?,
            status: AssignmentStatus::Active,
            assigned_at: Utc::now(),
            revoked_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }

    pub fn revoke(&mut self) {
        self.status = AssignmentStatus::Revoked;
        self.revoked_at = Some(Utc::now());
    }
}

// =============================================================================
// Approvals
// =============================================================================

/// What a guardian submits to approve a recovery.
#[derive(Clone)]
pub struct GuardianApproval {
    /// The guardian's opened share
    pub share: Share,
    /// Ed25519 signature over [`approval_message`]
    pub signature: [u8; SIGNATURE_LEN],
}

impl fmt::Debug for GuardianApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardianApproval")
            .field("share_index", &self.share.x)
            .field("signature", &hex::encode(&self.signature[..8]))
            .finish_non_exhaustive()
    }
}

impl GuardianApproval {
    /// Check the signature against the guardian's key and the share it carries.
    pub fn verify(&self, recovery_id: Uuid, user_id: &str, guardian: &GuardianIdentity) -> Result<()> {
        let invalid = || Error::InvalidSignature {
            guardian_id: guardian.guardian_id.clone(),
        };

        let key = guardian.verifying_key().map_err(|_| invalid())?;
        let message = approval_message(recovery_id, user_id, &guardian.guardian_id, &self.share.digest()?);
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&message, &signature).map_err(|_| invalid())
    }
}

/// Bytes a guardian signs to approve a recovery.
pub fn approval_message(recovery_id: Uuid, user_id: &str, guardian_id: &str, share_digest: &str) -> Vec<u8> {
    format!(
        "shardwarden/recovery-approval/v1|{}|{}|{}|{}",
        recovery_id, user_id, guardian_id, share_digest
    )
    .into_bytes()
}

fn share_info(user_id: &str, guardian_id: &str, share_index: u8) -> Vec<u8> {
    format!("shardwarden/guardian-share/v1|{}|{}|{}", user_id, guardian_id, share_index).into_bytes()
}
