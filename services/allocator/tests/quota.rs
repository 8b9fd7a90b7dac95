//! Quota guarantees and the operator quota request flow.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_allocator::authorizer::{Acls, Entity, LocalAuthorizer, QuotaAcl};
use corral_allocator::quota::{Quota, QuotaError, QuotaInfo};
use corral_allocator::registrar::{InMemoryRegistrar, Operation, Registrar};
use corral_allocator::{Allocator, AllocatorConfig, DispatchAllocator, Filters};
use corral_resources::{Resource, Resources};
use corral_testing::fixtures::{agent, config, framework, quota, quota_request, resources};
use corral_testing::{RecordingOfferSink, TestAllocator};
use tokio::sync::Notify;

const QUOTA_ROLE: &str = "quota-role";
const NO_QUOTA_ROLE: &str = "no-quota-role";

// =============================================================================
// Allocation under quota
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_quota_role_gets_resources_until_guarantee_is_met() {
    let mut t = TestAllocator::start(config());

    let (f1, fw1) = framework(QUOTA_ROLE);
    t.add_framework(f1, &fw1);
    t.allocator.set_quota(quota(QUOTA_ROLE, "cpus:2;mem:1024")).unwrap();
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    t.add_framework(f2, &fw2);

    let (agent1, info1) = agent("agent1", "cpus:1;mem:512;disk:0");
    t.add_agent(agent1, &info1);
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info1.resources);

    // f2 has the lower share, but quota comes first.
    let (agent2, info2) = agent("agent2", "cpus:1;mem:512;disk:0");
    t.add_agent(agent2, &info2);
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info2.resources);

    // While f1 refuses agent2, its resources stay set aside for the quota.
    t.allocator
        .recover_resources(f1, agent2, info2.resources.clone(), Some(Filters::refuse_seconds(5.0)))
        .unwrap();
    t.offers.expect_none(Duration::from_millis(4500)).await;

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info2.resources);
}

#[tokio::test(start_paused = true)]
async fn test_removed_quota_no_longer_holds_resources() {
    let mut t = TestAllocator::start(config());

    let (f1, fw1) = framework(QUOTA_ROLE);
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    let (agent1, info1) = agent("agent1", "cpus:1;mem:512;disk:0");
    let (agent2, info2) = agent("agent2", "cpus:1;mem:512;disk:0");

    t.allocator.set_quota(quota(QUOTA_ROLE, "cpus:2;mem:1024")).unwrap();
    t.add_framework(f1, &fw1);
    t.add_framework(f2, &fw2);
    for (id, info) in [(agent1, &info1), (agent2, &info2)] {
        t.allocator
            .add_slave(
                id,
                info.clone(),
                info.resources.clone(),
                HashMap::from([(f1, info.resources.clone())]),
            )
            .unwrap();
    }

    t.allocator.remove_quota(QUOTA_ROLE.to_string()).unwrap();
    t.allocator
        .recover_resources(f1, agent1, info1.resources.clone(), None)
        .unwrap();

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f2);
    assert_eq!(offer.resources(), info1.resources);
}

#[tokio::test(start_paused = true)]
async fn test_frameworks_share_their_role_quota() {
    let mut t = TestAllocator::start(config());

    let (f1a, fw1a) = framework(QUOTA_ROLE);
    t.add_framework(f1a, &fw1a);
    t.allocator.set_quota(quota(QUOTA_ROLE, "cpus:4;mem:2048")).unwrap();
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    t.add_framework(f2, &fw2);

    let (agent1, info1) = agent("agent1", "cpus:1;mem:512;disk:0");
    t.add_agent(agent1, &info1);
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1a);
    assert_eq!(offer.resources(), info1.resources);

    let (f1b, fw1b) = framework(QUOTA_ROLE);
    t.add_framework(f1b, &fw1b);
    let (agent2, info2) = agent("agent2", "cpus:2;mem:1024;disk:0");
    t.add_agent(agent2, &info2);
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1b);
    assert_eq!(offer.resources(), info2.resources);

    let (agent3, info3) = agent("agent3", "cpus:1;mem:512;disk:0");
    t.add_agent(agent3, &info3);
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1a);
    assert_eq!(offer.resources(), info3.resources);

    // Declined quota resources go to the role's other framework.
    t.allocator
        .recover_resources(f1a, agent3, info3.resources.clone(), Some(Filters::refuse_seconds(5.0)))
        .unwrap();
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1b);
    assert_eq!(offer.resources(), info3.resources);
}

#[tokio::test(start_paused = true)]
async fn test_quota_allocation_is_coarse_grained() {
    let mut t = TestAllocator::start(config());

    let (f1, fw1) = framework(QUOTA_ROLE);
    t.add_framework(f1, &fw1);
    let guarantee = quota(QUOTA_ROLE, "cpus:0.5;mem:200");
    t.allocator.set_quota(guarantee.clone()).unwrap();
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    t.add_framework(f2, &fw2);

    let (agent1, info1) = agent("agent1", "cpus:1;mem:512;disk:0");
    t.add_agent(agent1, &info1);

    // The whole agent is offered even though it exceeds the guarantee.
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info1.resources);
    assert!(info1.resources.contains(&guarantee.guarantee));
}

#[tokio::test(start_paused = true)]
async fn test_free_pool_is_shared_by_drf_once_quota_is_met() {
    let mut t = TestAllocator::start(config());

    let (f1, fw1) = framework(QUOTA_ROLE);
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    let guarantee = quota(QUOTA_ROLE, "cpus:0.25;mem:128");

    t.allocator.set_quota(guarantee.clone()).unwrap();
    t.add_framework(f1, &fw1);
    t.add_framework(f2, &fw2);

    let (agent1, info1) = agent("agent1", "cpus:1;mem:512;disk:0");
    t.allocator
        .add_slave(
            agent1,
            info1.clone(),
            info1.resources.clone(),
            HashMap::from([(f1, guarantee.guarantee.clone())]),
        )
        .unwrap();

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f2);
    assert_eq!(offer.resources(), &info1.resources - &guarantee.guarantee);

    // Role shares are now 0.25 and 0.75.
    let (agent2, info2) = agent("agent2", "cpus:1;mem:512;disk:0");
    t.add_agent(agent2, &info2);

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info2.resources);
}

#[tokio::test(start_paused = true)]
async fn test_quota_prevents_starvation() {
    let mut t = TestAllocator::start(config());

    let (f1, fw1) = framework(QUOTA_ROLE);
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    t.add_framework(f1, &fw1);
    t.add_framework(f2, &fw2);

    let (agent1, info1) = agent("agent1", "cpus:1;mem:512;disk:0");
    t.allocator
        .add_slave(
            agent1,
            info1.clone(),
            info1.resources.clone(),
            HashMap::from([(f1, info1.resources.clone())]),
        )
        .unwrap();
    t.offers.expect_none(Duration::from_millis(100)).await;

    let (agent2, info2) = agent("agent2", "cpus:1;mem:512;disk:0");
    t.add_agent(agent2, &info2);
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f2);
    assert_eq!(offer.resources(), info2.resources);

    // Declining without a refusal puts f2 back at share zero, so it is
    // offered the same resources again.
    let no_refusal = Some(Filters::refuse_seconds(0.0));
    t.allocator
        .recover_resources(f2, agent2, info2.resources.clone(), no_refusal)
        .unwrap();
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f2);
    assert_eq!(offer.resources(), info2.resources);

    t.allocator
        .recover_resources(f2, agent2, info2.resources.clone(), no_refusal)
        .unwrap();
    t.allocator.set_quota(quota(QUOTA_ROLE, "cpus:2;mem:1024")).unwrap();

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info2.resources);
}

#[tokio::test(start_paused = true)]
async fn test_quota_is_held_for_roles_without_frameworks() {
    let mut t = TestAllocator::start(config());

    let (agent1, info1) = agent("agent1", "cpus:2;mem:1024;disk:0");
    let (agent2, info2) = agent("agent2", "cpus:1;mem:512;disk:0");
    t.add_agent(agent1, &info1);
    t.add_agent(agent2, &info2);
    t.allocator.set_quota(quota(QUOTA_ROLE, "cpus:2;mem:1024")).unwrap();

    let (f1, fw1) = framework(NO_QUOTA_ROLE);
    t.add_framework(f1, &fw1);

    // Offering agent1 whole would eat into the unmet guarantee.
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.offers.len(), 1);
    assert!(offer.offers.contains_key(&agent2));
    assert_eq!(offer.resources(), info2.resources);

    t.offers.expect_none(Duration::from_secs(3)).await;
}

// =============================================================================
// Operator requests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_request_set_quota_grants_and_persists() {
    let mut t = TestAllocator::start(config());

    let (agent1, info1) = agent("agent1", "cpus:2;mem:1024");
    t.add_agent(agent1, &info1);

    t.allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1;mem:512"), false, None)
        .await
        .unwrap();
    assert_eq!(
        t.registrar.quotas().await,
        vec![quota(QUOTA_ROLE, "cpus:1;mem:512")]
    );

    // A framework in another role arriving first still loses to the quota.
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    let (f1, fw1) = framework(QUOTA_ROLE);
    t.add_framework(f2, &fw2);
    t.add_framework(f1, &fw1);

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info1.resources);
}

#[tokio::test(start_paused = true)]
async fn test_request_set_quota_rejects_malformed_requests() {
    let t = TestAllocator::start(config());

    let no_role = QuotaInfo::new("", Vec::<Resource>::new());
    let err = t
        .allocator
        .request_set_quota(no_role, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Invalid(_)));

    let revocable = QuotaInfo::new(
        QUOTA_ROLE,
        [Resource::scalar("cpus", 1.0)
            .with_role(QUOTA_ROLE)
            .into_revocable()],
    );
    let err = t
        .allocator
        .request_set_quota(revocable, true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Invalid(_)));
    assert!(t.registrar.quotas().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_request_set_quota_for_unknown_role() {
    let with_roles = AllocatorConfig {
        roles: BTreeMap::from([("known".to_string(), 1.0)]),
        ..config()
    };
    let t = TestAllocator::start(with_roles);

    let err = t
        .allocator
        .request_set_quota(quota_request("unknown", "cpus:1"), true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::UnknownRole(role) if role == "unknown"));
}

#[tokio::test(start_paused = true)]
async fn test_request_set_quota_twice() {
    let t = TestAllocator::start(config());

    let request = quota_request(QUOTA_ROLE, "cpus:1");
    t.allocator
        .request_set_quota(request.clone(), true, None)
        .await
        .unwrap();
    let err = t
        .allocator
        .request_set_quota(request, true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::AlreadyExists(_)));
}

#[tokio::test(start_paused = true)]
async fn test_request_set_quota_checks_capacity_unless_forced() {
    let t = TestAllocator::start(config());

    let (agent1, info1) = agent("agent1", "cpus:1;mem:512");
    t.add_agent(agent1, &info1);

    let request = quota_request(QUOTA_ROLE, "cpus:4;mem:512");
    let err = t
        .allocator
        .request_set_quota(request.clone(), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::InsufficientCapacity));
    assert!(t.registrar.quotas().await.is_empty());

    t.allocator
        .request_set_quota(request, true, None)
        .await
        .unwrap();
    assert_eq!(t.registrar.quotas().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_check_counts_granted_quota() {
    let t = TestAllocator::start(config());

    let (agent1, info1) = agent("agent1", "cpus:4;mem:2048");
    t.add_agent(agent1, &info1);

    t.allocator
        .request_set_quota(quota_request("role1", "cpus:3;mem:1024"), false, None)
        .await
        .unwrap();
    let err = t
        .allocator
        .request_set_quota(quota_request("role2", "cpus:2;mem:512"), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::InsufficientCapacity));
}

#[tokio::test(start_paused = true)]
async fn test_request_set_quota_requires_authorization() {
    let acls = Acls {
        permissive: false,
        set_quotas: vec![QuotaAcl {
            principals: Entity::Values(vec!["ops".to_string()]),
            roles: Entity::Any,
        }],
        remove_quotas: Vec::new(),
    };
    let t = TestAllocator::start_with(
        config(),
        Arc::new(InMemoryRegistrar::new()),
        Some(Arc::new(LocalAuthorizer::new(acls))),
    );

    let request = quota_request(QUOTA_ROLE, "cpus:1");
    let err = t
        .allocator
        .request_set_quota(request.clone(), true, Some("dev".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Unauthorized { .. }));
    assert!(t.registrar.quotas().await.is_empty());

    // The refused request left nothing pending behind.
    t.allocator
        .request_set_quota(request, true, Some("ops".to_string()))
        .await
        .unwrap();

    // Nobody may remove quota.
    let err = t
        .allocator
        .request_remove_quota(QUOTA_ROLE.to_string(), Some("ops".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Unauthorized { .. }));
    assert_eq!(t.registrar.quotas().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registry_failure_stops_the_allocator() {
    let registrar = Arc::new(InMemoryRegistrar::new());
    registrar.fail_applies(true);
    let t = TestAllocator::start_with(config(), registrar, None);

    let err = t
        .allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1"), true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Persistence(_)));

    t.settle().await;
    assert!(t.allocator.metrics().await.is_err());
    let err = t
        .allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1"), true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::AllocatorStopped));
}

#[tokio::test(start_paused = true)]
async fn test_request_remove_quota() {
    let registrar = Arc::new(InMemoryRegistrar::with_quotas([quota(
        QUOTA_ROLE,
        "cpus:2;mem:1024",
    )]));
    let mut t = TestAllocator::start_with(config(), registrar, None);

    let err = t
        .allocator
        .request_remove_quota("nobody".to_string(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::NotFound(role) if role == "nobody"));

    // The recovered quota holds agent1 back from other roles.
    let (agent1, info1) = agent("agent1", "cpus:2;mem:1024;disk:0");
    let (agent2, info2) = agent("agent2", "cpus:1;mem:512;disk:0");
    t.add_agent(agent1, &info1);
    t.add_agent(agent2, &info2);
    let (f1, fw1) = framework(NO_QUOTA_ROLE);
    t.add_framework(f1, &fw1);

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info2.resources);

    t.allocator
        .request_remove_quota(QUOTA_ROLE.to_string(), None)
        .await
        .unwrap();
    assert!(t.registrar.quotas().await.is_empty());

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info1.resources);
}

#[tokio::test(start_paused = true)]
async fn test_granted_quota_rescinds_outstanding_offers() {
    let mut t = TestAllocator::start(config());

    let (agent1, info1) = agent("agent1", "cpus:2;mem:1024");
    t.add_agent(agent1, &info1);
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    t.add_framework(f2, &fw2);

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f2);

    let (f1, fw1) = framework(QUOTA_ROLE);
    t.add_framework(f1, &fw1);
    t.offers.expect_none(Duration::from_millis(100)).await;

    t.allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1;mem:512"), false, None)
        .await
        .unwrap();

    let rescissions = t.offers.rescissions();
    assert_eq!(rescissions.len(), 1);
    assert_eq!(rescissions[0].framework_id, f2);
    assert_eq!(rescissions[0].slave_id, agent1);
    assert_eq!(rescissions[0].resources, info1.resources);

    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), info1.resources);
}

#[tokio::test(start_paused = true)]
async fn test_rescission_covers_offers_made_after_usage_was_recovered() {
    let mut t = TestAllocator::start(config());

    let (f1, fw1) = framework(NO_QUOTA_ROLE);
    t.add_framework(f1, &fw1);
    let (agent1, info1) = agent("agent1", "cpus:2;mem:1024");
    let half = resources("cpus:1;mem:512");
    t.allocator
        .add_slave(
            agent1,
            info1.clone(),
            info1.resources.clone(),
            HashMap::from([(f1, half.clone())]),
        )
        .unwrap();

    let offer = t.offers.next().await;
    assert_eq!(offer.resources(), half);

    // The task holding the other half ends while the offer is outstanding.
    t.allocator
        .recover_resources(f1, agent1, half.clone(), None)
        .unwrap();
    let offer = t.offers.next().await;
    assert_eq!(offer.framework_id, f1);
    assert_eq!(offer.resources(), half);

    t.allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1;mem:512"), false, None)
        .await
        .unwrap();

    let rescissions = t.offers.rescissions();
    assert!(rescissions.iter().all(|r| r.framework_id == f1));
    let rescinded: Resources = rescissions.iter().map(|r| &r.resources).sum();
    assert_eq!(rescinded, info1.resources);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_offers_are_not_rescinded() {
    let mut t = TestAllocator::start(config());

    let (agent1, info1) = agent("agent1", "cpus:2;mem:1024");
    t.add_agent(agent1, &info1);
    let (f2, fw2) = framework(NO_QUOTA_ROLE);
    t.add_framework(f2, &fw2);

    let offer = t.offers.next().await;
    t.allocator
        .offer_accepted(f2, agent1, offer.resources())
        .unwrap();

    t.allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1;mem:512"), false, None)
        .await
        .unwrap();
    assert!(t.offers.rescissions().is_empty());
}

/// Registrar whose writes wait until the test lets them through.
struct GatedRegistrar {
    inner: InMemoryRegistrar,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Registrar for GatedRegistrar {
    async fn apply(&self, operation: Operation) -> anyhow::Result<bool> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.apply(operation).await
    }

    async fn recover(&self) -> anyhow::Result<Vec<Quota>> {
        self.inner.recover().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_changes_to_one_role_are_rejected() {
    corral_testing::init_tracing();
    let registrar = Arc::new(GatedRegistrar {
        inner: InMemoryRegistrar::with_quotas([quota(QUOTA_ROLE, "cpus:1")]),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (sink, _offers) = RecordingOfferSink::channel();
    let allocator = DispatchAllocator::initialize(config(), Arc::new(sink), registrar.clone(), None);

    let (first, (second, third)) = tokio::join!(
        allocator.request_remove_quota(QUOTA_ROLE.to_string(), None),
        async {
            registrar.entered.notified().await;
            let second = allocator
                .request_remove_quota(QUOTA_ROLE.to_string(), None)
                .await;
            let third = allocator
                .request_set_quota(quota_request(QUOTA_ROLE, "cpus:1"), true, None)
                .await;
            registrar.release.notify_one();
            (second, third)
        }
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(QuotaError::InProgress(_))));
    assert!(matches!(third, Err(QuotaError::AlreadyExists(_))));
    assert!(registrar.inner.quotas().await.is_empty());

    allocator.cease_allocation().await;
}

#[tokio::test(start_paused = true)]
async fn test_quota_error_reaches_callers_as_text() {
    let t = TestAllocator::start(config());
    let (agent1, info1) = agent("agent1", "cpus:1");
    t.add_agent(agent1, &info1);

    let err = t
        .allocator
        .request_set_quota(quota_request(QUOTA_ROLE, "cpus:8"), false, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("force flag"));
}
