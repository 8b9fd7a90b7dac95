//! Operator requests to set or remove quota.
//!
//! A request is checked against the allocator's state synchronously and
//! then marked pending, so a second request for the same role is rejected
//! right away. Authorization and the registry write run on a spawned task
//! that reports back with a completion message; the allocator only changes
//! quota once the registry has accepted the change.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::hierarchical::{Context, HierarchicalAllocatorProcess, PendingQuota};
use super::messages::{AllocatorMessage, QuotaOutcome, QuotaReply};
use crate::actors::ActorError;
use crate::authorizer::{Authorizer, QuotaAction};
use crate::quota::{capacity_heuristic, plan_rescind, Quota, QuotaError, QuotaInfo, RescindCandidate};
use crate::registrar::{Operation, Registrar};

impl HierarchicalAllocatorProcess {
    pub(super) fn request_set_quota(
        &mut self,
        info: QuotaInfo,
        force: bool,
        principal: Option<String>,
        reply: QuotaReply,
        ctx: &Context,
    ) {
        let quota = match self.admit_quota(info, force) {
            Ok(quota) => quota,
            Err(e) => {
                info!(error = %e, "Rejected quota request");
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(
            role = %quota.role,
            guarantee = %quota.guarantee,
            force,
            "Admitted quota request"
        );
        self.pending_quotas
            .insert(quota.role.clone(), PendingQuota::Set(quota.clone()));

        let authorizer = self.authorizer.clone();
        let registrar = Arc::clone(&self.registrar);
        let handle = ctx.handle().clone();
        tokio::spawn(async move {
            let operation = Operation::UpdateQuota {
                quota: quota.clone(),
            };
            let outcome = authorize_and_persist(
                authorizer,
                registrar,
                principal.as_deref(),
                QuotaAction::Set,
                operation,
            )
            .await;
            let _ = handle.send(AllocatorMessage::SetQuotaCompleted {
                quota,
                principal,
                outcome,
                reply,
            });
        });
    }

    /// Validates a request against the current state.
    fn admit_quota(&self, info: QuotaInfo, force: bool) -> Result<Quota, QuotaError> {
        let quota = Quota::try_from(info)?;

        if !self.config.roles.is_empty() && !self.config.roles.contains_key(&quota.role) {
            return Err(QuotaError::UnknownRole(quota.role));
        }
        if self.quotas.contains_key(&quota.role) || self.pending_quotas.contains_key(&quota.role) {
            return Err(QuotaError::AlreadyExists(quota.role));
        }

        if !force {
            let existing = self
                .quotas
                .values()
                .chain(self.pending_quotas.values().filter_map(PendingQuota::quota));
            let agents = self
                .slaves
                .values()
                .filter(|slave| slave.activated)
                .map(|slave| &slave.info.resources);
            capacity_heuristic(&quota, existing, agents)?;
        }

        Ok(quota)
    }

    pub(super) fn complete_set_quota(
        &mut self,
        quota: Quota,
        principal: Option<String>,
        outcome: QuotaOutcome,
        reply: QuotaReply,
        ctx: &Context,
    ) -> Result<(), ActorError> {
        self.pending_quotas.remove(&quota.role);

        match outcome {
            QuotaOutcome::Applied(true) => {
                self.set_quota(quota.clone(), ctx);
                self.rescind_for_quota(&quota);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            QuotaOutcome::Applied(false) => {
                persistence_failure(reply, "registry rejected quota update".to_string())
            }
            QuotaOutcome::PersistenceFailed(e) => persistence_failure(reply, format!("{e:#}")),
            outcome => {
                refuse(reply, outcome, principal, quota.role);
                Ok(())
            }
        }
    }

    pub(super) fn request_remove_quota(
        &mut self,
        role: String,
        principal: Option<String>,
        reply: QuotaReply,
        ctx: &Context,
    ) {
        if !self.quotas.contains_key(&role) {
            let _ = reply.send(Err(QuotaError::NotFound(role)));
            return;
        }
        if self.pending_quotas.contains_key(&role) {
            let _ = reply.send(Err(QuotaError::InProgress(role)));
            return;
        }

        info!(role = %role, "Admitted quota removal");
        self.pending_quotas.insert(role.clone(), PendingQuota::Remove);

        let authorizer = self.authorizer.clone();
        let registrar = Arc::clone(&self.registrar);
        let handle = ctx.handle().clone();
        tokio::spawn(async move {
            let operation = Operation::RemoveQuota { role: role.clone() };
            let outcome = authorize_and_persist(
                authorizer,
                registrar,
                principal.as_deref(),
                QuotaAction::Remove,
                operation,
            )
            .await;
            let _ = handle.send(AllocatorMessage::RemoveQuotaCompleted {
                role,
                principal,
                outcome,
                reply,
            });
        });
    }

    pub(super) fn complete_remove_quota(
        &mut self,
        role: String,
        principal: Option<String>,
        outcome: QuotaOutcome,
        reply: QuotaReply,
        ctx: &Context,
    ) -> Result<(), ActorError> {
        self.pending_quotas.remove(&role);

        match outcome {
            QuotaOutcome::Applied(true) => {
                self.remove_quota(&role, ctx);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            QuotaOutcome::Applied(false) => {
                persistence_failure(reply, format!("registry holds no quota for role '{role}'"))
            }
            QuotaOutcome::PersistenceFailed(e) => persistence_failure(reply, format!("{e:#}")),
            outcome => {
                refuse(reply, outcome, principal, role);
                Ok(())
            }
        }
    }

    /// Rescinds outstanding offers so the new guarantee can be met on the
    /// next pass.
    fn rescind_for_quota(&mut self, quota: &Quota) {
        let frameworks = self
            .frameworks
            .values()
            .filter(|framework| framework.active && framework.role() == quota.role)
            .count();
        let candidates: Vec<RescindCandidate> = self
            .slave_order
            .iter()
            .filter_map(|slave_id| {
                self.slaves.get(slave_id).map(|slave| RescindCandidate {
                    slave_id: *slave_id,
                    active: slave.activated,
                    offered: slave.offered.values().sum(),
                })
            })
            .collect();

        let plan = plan_rescind(&quota.guarantee, frameworks, candidates);
        if plan.rescinded.is_empty() {
            return;
        }
        info!(
            role = %quota.role,
            agents = plan.slaves.len(),
            rescinded = %plan.rescinded,
            "Rescinding offers to satisfy quota"
        );
        for slave_id in plan.slaves {
            self.rescind_offers(slave_id);
        }
    }
}

async fn authorize_and_persist(
    authorizer: Option<Arc<dyn Authorizer>>,
    registrar: Arc<dyn Registrar>,
    principal: Option<&str>,
    action: QuotaAction,
    operation: Operation,
) -> QuotaOutcome {
    if let Some(authorizer) = authorizer {
        match authorizer.authorize(principal, action, operation.role()).await {
            Ok(true) => {}
            Ok(false) => return QuotaOutcome::Denied,
            Err(e) => return QuotaOutcome::AuthorizationFailed(e),
        }
    }
    match registrar.apply(operation).await {
        Ok(changed) => QuotaOutcome::Applied(changed),
        Err(e) => QuotaOutcome::PersistenceFailed(e),
    }
}

fn refuse(reply: QuotaReply, outcome: QuotaOutcome, principal: Option<String>, role: String) {
    let err = match outcome {
        QuotaOutcome::AuthorizationFailed(e) => QuotaError::AuthorizationFailed(format!("{e:#}")),
        _ => QuotaError::Unauthorized { principal, role },
    };
    warn!(error = %err, "Quota change refused");
    let _ = reply.send(Err(err));
}

/// The registry and the allocator can no longer be trusted to agree, so the
/// allocator stops.
fn persistence_failure(reply: QuotaReply, reason: String) -> Result<(), ActorError> {
    error!(reason = %reason, "Failed to persist quota change");
    let _ = reply.send(Err(QuotaError::Persistence(reason.clone())));
    Err(ActorError::Permanent(reason))
}
