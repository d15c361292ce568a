//! Guardian Recovery Integration Tests
//!
//! Owner configures guardians, loses the device, and gets the root key back
//! through guardian approvals. Guardians run on their own "devices": they
//! only ever see their sealed assignment and their own keys.

use std::sync::Arc;

use assert_matches::assert_matches;
use shardwarden::adapters::{BroadcastEventPublisher, InMemoryStore};
use shardwarden::codec::MasterKey;
use shardwarden::domain::events::DomainEvent;
use shardwarden::domain::ports::{namespaces, StateStore};
use shardwarden::metrics::EngineMetrics;
use shardwarden::recovery::{
    ApprovalOutcome, DeviceInfo, GuardianKeys, GuardianRecoveryProtocol, RecoveryConfig, RecoverySession,
    RecoveryStatus,
};
use shardwarden::Error;
use uuid::Uuid;

struct World {
    protocol: Arc<GuardianRecoveryProtocol>,
    publisher: Arc<BroadcastEventPublisher>,
    state: StateStore,
    metrics: Arc<EngineMetrics>,
    guardians: Vec<GuardianKeys>,
    root_key: MasterKey,
}

async fn world(guardians: usize, threshold: usize) -> World {
    let publisher = Arc::new(BroadcastEventPublisher::new(64));
    let state = StateStore::new(Arc::new(InMemoryStore::new()));
    let metrics = Arc::new(EngineMetrics::new().expect("metrics"));
    let protocol = GuardianRecoveryProtocol::new(
        RecoveryConfig::default(),
        state.clone(),
        publisher.clone(),
        metrics.clone(),
    );

    let guardians: Vec<GuardianKeys> = ["alice", "bob", "carol", "dave", "erin"]
        .iter()
        .take(guardians)
        .map(|name| GuardianKeys::generate(*name))
        .collect();
    let root_key = MasterKey::generate();
    protocol
        .configure(
            "owner",
            root_key.as_bytes(),
            threshold,
            guardians.iter().map(GuardianKeys::identity).collect(),
        )
        .await
        .expect("configure");

    World {
        protocol,
        publisher,
        state,
        metrics,
        guardians,
        root_key,
    }
}

/// What a guardian's device does when asked to approve.
async fn guardian_approves(w: &World, recovery_id: Uuid, guardian: &GuardianKeys) -> shardwarden::Result<ApprovalOutcome> {
    let assignment = w.protocol.session_assignment(recovery_id, guardian.guardian_id())?;
    let approval = guardian.approve(recovery_id, "owner", &assignment)?;
    w.protocol
        .approve_recovery(recovery_id, guardian.guardian_id(), approval)
        .await
}

// =============================================================================
// Threshold
// =============================================================================

#[tokio::test]
async fn test_three_of_five_recovery() {
    let w = world(5, 3).await;
    let mut events = w.publisher.subscribe();

    let session = w
        .protocol
        .initiate_recovery("owner", DeviceInfo::new("phone-2", "Replacement phone").with_platform("ios"))
        .await
        .expect("initiate");

    let first = guardian_approves(&w, session.id, &w.guardians[4]).await.unwrap();
    assert_matches!(first, ApprovalOutcome::Pending { approvals: 1, required: 3 });
    let second = guardian_approves(&w, session.id, &w.guardians[2]).await.unwrap();
    assert_matches!(second, ApprovalOutcome::Pending { approvals: 2, required: 3 });

    // Duplicate approval does not count
    let dup = guardian_approves(&w, session.id, &w.guardians[2]).await.unwrap();
    assert_matches!(dup, ApprovalOutcome::AlreadyApproved { approvals: 2, .. });

    let third = guardian_approves(&w, session.id, &w.guardians[0]).await.unwrap();
    assert!(third.is_completed());
    let recovered = third.into_root_key().unwrap();
    assert_eq!(recovered.as_slice(), w.root_key.as_bytes());

    let types: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e: DomainEvent| e.event_type())
        .collect();
    assert_eq!(
        types,
        vec![
            "RecoveryInitiated",
            "RecoveryApproved",
            "RecoveryApproved",
            "RecoveryApproved",
            "RecoveryCompleted"
        ]
    );
    assert_eq!(w.metrics.recoveries("completed"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_complete_once() {
    let w = Arc::new(world(5, 3).await);
    let session = w
        .protocol
        .initiate_recovery("owner", DeviceInfo::new("phone-2", "Replacement phone"))
        .await
        .expect("initiate");

    // One more approver than the threshold, all at once
    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let w = Arc::clone(&w);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                guardian_approves(&w, session.id, &w.guardians[i]).await
            })
        })
        .collect();

    let mut completed = Vec::new();
    for task in tasks {
        match task.await.expect("approval task panicked") {
            Ok(ApprovalOutcome::Completed { root_key }) => completed.push(root_key),
            Ok(ApprovalOutcome::Pending { approvals, required }) => assert!(approvals < required),
            Ok(other) => panic!("unexpected outcome {:?}", other),
            Err(e) => assert_matches!(e, Error::RecoveryNotPending { .. }),
        }
    }

    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].as_slice(), w.root_key.as_bytes());

    let finished = w.protocol.session(session.id).unwrap();
    assert_eq!(finished.status, RecoveryStatus::Completed);
    assert_eq!(finished.approvals.len(), 3);
    assert!(finished.approvals.len() <= w.guardians.len());
    assert_eq!(w.metrics.recoveries("completed"), 1);
}

#[tokio::test]
async fn test_unknown_guardian_cannot_approve() {
    let w = world(3, 2).await;
    let session = w
        .protocol
        .initiate_recovery("owner", DeviceInfo::new("d", "laptop"))
        .await
        .unwrap();

    // An outsider with a self-made share and valid-looking signature
    let outsider = GuardianKeys::generate("mallory");
    assert_matches!(
        guardian_approves(&w, session.id, &outsider).await,
        Err(Error::UnauthorizedGuardian { .. })
    );

    // Mallory replays Alice's approval under her own name
    let assignment = w.protocol.session_assignment(session.id, "alice").unwrap();
    let alice_approval = w.guardians[0].approve(session.id, "owner", &assignment).unwrap();
    assert_matches!(
        w.protocol.approve_recovery(session.id, "mallory", alice_approval.clone()).await,
        Err(Error::UnauthorizedGuardian { .. })
    );

    // Alice's approval for a different session is worthless here
    let other = w
        .protocol
        .initiate_recovery("owner", DeviceInfo::new("d2", "tablet"))
        .await
        .unwrap();
    assert_matches!(
        w.protocol.approve_recovery(other.id, "alice", alice_approval).await,
        Err(Error::InvalidSignature { .. })
    );

    let untouched = w.protocol.session(session.id).unwrap();
    assert_eq!(untouched.approval_count(), 0);
    assert_eq!(untouched.status, RecoveryStatus::Pending);
}

#[tokio::test]
async fn test_guardian_with_wrong_keys_cannot_open_share() {
    let w = world(3, 2).await;
    let session = w
        .protocol
        .initiate_recovery("owner", DeviceInfo::new("d", "laptop"))
        .await
        .unwrap();

    // Same id as Bob, different key material
    let impostor = GuardianKeys::generate("bob");
    assert_matches!(
        guardian_approves(&w, session.id, &impostor).await,
        Err(Error::DecryptionFailed)
    );
}

// =============================================================================
// Expiry & Persistence
// =============================================================================

#[tokio::test]
async fn test_expired_session_rejects_approvals() {
    let publisher = Arc::new(BroadcastEventPublisher::new(16));
    let protocol = GuardianRecoveryProtocol::new(
        RecoveryConfig {
            session_ttl: std::time::Duration::from_millis(50),
            ..Default::default()
        },
        StateStore::new(Arc::new(InMemoryStore::new())),
        publisher,
        Arc::new(EngineMetrics::new().unwrap()),
    );
    let guardian = GuardianKeys::generate("alice");
    protocol
        .configure("owner", b"root key bytes", 1, vec![guardian.identity()])
        .await
        .unwrap();

    let session = protocol
        .initiate_recovery("owner", DeviceInfo::new("d", "n"))
        .await
        .unwrap();
    let assignment = protocol.session_assignment(session.id, "alice").unwrap();
    let approval = guardian.approve(session.id, "owner", &assignment).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert_matches!(
        protocol.approve_recovery(session.id, "alice", approval).await,
        Err(Error::RecoveryExpired { .. })
    );
    assert_eq!(protocol.session(session.id).unwrap().status, RecoveryStatus::Expired);
}

#[tokio::test]
async fn test_sessions_are_persisted_without_shares() {
    let w = world(3, 2).await;
    let session = w
        .protocol
        .initiate_recovery("owner", DeviceInfo::new("d", "n"))
        .await
        .unwrap();
    guardian_approves(&w, session.id, &w.guardians[1]).await.unwrap();

    let stored: RecoverySession = w
        .state
        .get(namespaces::RECOVERY_SESSIONS, &session.id.to_string())
        .await
        .unwrap()
        .expect("session persisted");
    assert_eq!(stored.approval_count(), 1);
    assert!(stored.has_approved("bob"));

    let raw = serde_json::to_string(&stored).unwrap();
    assert!(!raw.contains("\"shares\""));

    // Guardian configuration reloads into a fresh protocol instance
    let restarted = GuardianRecoveryProtocol::new(
        RecoveryConfig::default(),
        w.state.clone(),
        Arc::new(BroadcastEventPublisher::new(4)),
        w.metrics.clone(),
    );
    assert_eq!(restarted.load_configs().await.unwrap(), 1);
    let config = restarted.guardian_config("owner").unwrap();
    assert_eq!(config.active_count(), 3);
    assert_eq!(config.threshold, 2);
}

#[tokio::test]
async fn test_sweeper_task_expires_sessions() {
    let protocol = GuardianRecoveryProtocol::new(
        RecoveryConfig {
            session_ttl: std::time::Duration::from_millis(20),
            sweep_interval: std::time::Duration::from_millis(10),
            ..Default::default()
        },
        StateStore::new(Arc::new(InMemoryStore::new())),
        Arc::new(BroadcastEventPublisher::new(16)),
        Arc::new(EngineMetrics::new().unwrap()),
    );
    let guardian = GuardianKeys::generate("alice");
    protocol
        .configure("owner", b"k", 1, vec![guardian.identity()])
        .await
        .unwrap();
    let session = protocol
        .initiate_recovery("owner", DeviceInfo::new("d", "n"))
        .await
        .unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let sweeper = tokio::spawn(protocol.clone().run_expiry_sweeper(shutdown.clone()));

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while protocol.session(session.id).unwrap().status == RecoveryStatus::Pending {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was not expired");

    assert_eq!(protocol.session(session.id).unwrap().status, RecoveryStatus::Expired);
    shutdown.cancel();
    sweeper.await.unwrap();
}
