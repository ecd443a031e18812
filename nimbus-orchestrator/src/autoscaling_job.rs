use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::bus::EventType;
use nimbus_common::validate::short_id;
use nimbus_common::{CoreResult, Instance, InstanceState, ResourceStatus, ScalingGroup, ScalingPolicy};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::services::InstanceService;
use crate::store::InstanceFilter;
use crate::worker::Reconciler;

/// Below this fraction of the target a policy scales in.
pub const SCALE_IN_RATIO: f64 = 0.5;

pub struct AutoscalingReconciler {
    svc: InstanceService,
    period: Duration,
}

/// What a policy decided for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    ScaleOut(i32),
    ScaleIn(i32),
    Hold,
}

/// Applies one policy to the current desired count. The result is clamped
/// to the group's bounds; a clamp that changes nothing is a `Hold`.
pub fn decide(group: &ScalingGroup, policy: &ScalingPolicy, desired: i32, value: f64) -> PolicyDecision {
    if value > policy.target_value {
        let next = group.clamp(desired + policy.scale_out_step.max(0));
        if next > desired {
            return PolicyDecision::ScaleOut(next);
        }
    } else if value < policy.target_value * SCALE_IN_RATIO {
        let next = group.clamp(desired - policy.scale_in_step.max(0));
        if next < desired {
            return PolicyDecision::ScaleIn(next);
        }
    }
    PolicyDecision::Hold
}

impl AutoscalingReconciler {
    pub fn new(svc: InstanceService) -> Self {
        Self {
            svc,
            period: Duration::from_secs(10),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One pass as of `now`. Returns the number of groups acted on.
    pub async fn reconcile_at(&self, now: DateTime<Utc>, token: &CancellationToken) -> CoreResult<usize> {
        let mut acted = 0;
        for group in self.svc.store().list_groups().await? {
            if token.is_cancelled() {
                break;
            }
            match self.reconcile_group(&group, now).await {
                Ok(true) => acted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(group_id = %group.id, error = %e, "scaling group not reconciled"),
            }
        }
        Ok(acted)
    }

    async fn reconcile_group(&self, group: &ScalingGroup, now: DateTime<Utc>) -> CoreResult<bool> {
        let store = self.svc.store();
        let members = store.list_instances(&InstanceFilter::group(group.id)).await?;

        if group.status == ResourceStatus::Deleting {
            return self.drain(group, &members).await;
        }

        let mut acted = false;
        for failed in members.iter().filter(|m| m.state == InstanceState::Error) {
            self.svc.request_termination(failed.id).await?;
            acted = true;
        }

        let policies = store.list_policies(group.id).await?;
        let mut desired = group.clamp(group.desired);
        for policy in &policies {
            if policy.in_cooldown(now) {
                continue;
            }
            let Some(value) = store.metric_for_group(group.id, &policy.metric_type).await? else {
                continue;
            };
            let next = match decide(group, policy, desired, value) {
                PolicyDecision::ScaleOut(n) | PolicyDecision::ScaleIn(n) => n,
                PolicyDecision::Hold => continue,
            };
            tracing::info!(
                group_id = %group.id,
                policy_id = %policy.id,
                metric = %policy.metric_type,
                value,
                target = policy.target_value,
                from = desired,
                to = next,
                "scaling policy fired"
            );
            store.stamp_policy(policy.id, now).await?;
            self.svc
                .events()
                .publish(
                    EventType::ScalingAction,
                    json!({
                        "group_id": group.id,
                        "policy_id": policy.id,
                        "metric": policy.metric_type,
                        "value": value,
                        "from": desired,
                        "to": next,
                    }),
                )
                .await;
            desired = next;
            acted = true;
            break;
        }
        if desired != group.desired {
            store.set_desired(group.id, desired).await?;
        }

        let mut active: Vec<&Instance> = members.iter().filter(|m| m.state.is_active()).collect();
        let diff = desired - active.len() as i32;
        let (out_step, in_step) = step_bounds(&policies);

        if diff > 0 {
            let n = out_step.map_or(diff, |s| diff.min(s));
            for _ in 0..n {
                let name = format!("{}-{}", group.name, short_id());
                let inst = self
                    .svc
                    .create_member(name, &group.launch_template, group.vpc_id, Some(group.id), None)
                    .await?;
                tracing::info!(group_id = %group.id, instance_id = %inst.id, "scaling group member launched");
                self.svc.spawn_launch(inst.id);
            }
            acted = true;
        } else if diff < 0 {
            let n = in_step.map_or(-diff, |s| (-diff).min(s)) as usize;
            active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            for inst in active.into_iter().take(n) {
                self.svc.request_termination(inst.id).await?;
                tracing::info!(group_id = %group.id, instance_id = %inst.id, "scaling group member released");
            }
            acted = true;
        }
        Ok(acted)
    }

    /// Terminates every member, then drops the group once none is left.
    async fn drain(&self, group: &ScalingGroup, members: &[Instance]) -> CoreResult<bool> {
        let mut remaining = 0;
        for m in members.iter().filter(|m| !m.state.is_terminal()) {
            remaining += 1;
            if m.state != InstanceState::Stopping {
                self.svc.request_termination(m.id).await?;
            }
        }
        if remaining == 0 {
            self.svc.store().delete_group(group.id).await?;
            tracing::info!(group_id = %group.id, "scaling group deleted");
        }
        Ok(true)
    }
}

/// Per-tick movement bounds. Without policies the group converges in one tick.
fn step_bounds(policies: &[ScalingPolicy]) -> (Option<i32>, Option<i32>) {
    let out = policies.iter().map(|p| p.scale_out_step.max(1)).max();
    let inn = policies.iter().map(|p| p.scale_in_step.max(1)).max();
    (out, inn)
}

#[async_trait]
impl Reconciler for AutoscalingReconciler {
    fn name(&self) -> &'static str {
        "autoscaling"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        self.reconcile_at(Utc::now(), token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::LaunchTemplate;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn group(min: i32, max: i32) -> ScalingGroup {
        ScalingGroup {
            id: Uuid::new_v4(),
            name: "web".into(),
            vpc_id: None,
            min_size: min,
            max_size: max,
            desired: 2,
            launch_template: Json(LaunchTemplate::default()),
            status: ResourceStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn policy(target: f64) -> ScalingPolicy {
        ScalingPolicy {
            id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            metric_type: "cpu".into(),
            target_value: target,
            scale_out_step: 1,
            scale_in_step: 1,
            cooldown_secs: 300,
            last_fired_at: None,
        }
    }

    #[test]
    fn scale_out_above_target() {
        assert_eq!(decide(&group(1, 5), &policy(70.0), 2, 85.0), PolicyDecision::ScaleOut(3));
    }

    #[test]
    fn hold_inside_band() {
        assert_eq!(decide(&group(1, 5), &policy(70.0), 2, 50.0), PolicyDecision::Hold);
        assert_eq!(decide(&group(1, 5), &policy(70.0), 2, 70.0), PolicyDecision::Hold);
    }

    #[test]
    fn scale_in_below_half_target() {
        assert_eq!(decide(&group(1, 5), &policy(70.0), 2, 20.0), PolicyDecision::ScaleIn(1));
    }

    #[test]
    fn bounds_turn_steps_into_holds() {
        assert_eq!(decide(&group(1, 2), &policy(70.0), 2, 99.0), PolicyDecision::Hold);
        assert_eq!(decide(&group(2, 5), &policy(70.0), 2, 1.0), PolicyDecision::Hold);
    }
}
