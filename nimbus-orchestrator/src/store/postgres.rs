use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::{
    ContainerDeployment, CoreError, CoreResult, CronJob, CronTarget, DnsRecord, DnsZone,
    ElasticIp, Instance, InstanceState, InstanceStateChange, LaunchTemplate, LbAlgorithm,
    LbTarget, LoadBalancer, NewInstance, ScalingGroup, ScalingPolicy, SecurityGroup,
    SecurityRule, Snapshot, SnapshotStatus, Subnet, Volume, VolumeStatus, Vpc,
};
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{
    CronStore, DeploymentStore, DnsStore, InstanceFilter, InstancePatch, InstanceStore,
    LoadBalancerStore, MetricsSource, NetworkStore, NewDnsRecord, NewScalingGroup,
    NewScalingPolicy, ScalingStore, Store, TargetView, VolumeStore,
};

/// Postgres-backed store. Queries are built at runtime so the crate compiles
/// without a live database.
#[derive(Clone)]
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.db
    }
}

fn state_names(states: &[InstanceState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    lb_id: Uuid,
    instance_id: Uuid,
    port: i32,
    weight: i32,
    state: InstanceState,
    backend_handle: Option<String>,
    private_ip: Option<String>,
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn insert_instance(&self, new: &NewInstance) -> CoreResult<Instance> {
        let inst = sqlx::query_as::<_, Instance>(
            "INSERT INTO instances
                (id, name, image, vcpus, memory_mb, vpc_id, subnet_id, state, port_map,
                 scaling_group_id, deployment_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.image)
        .bind(new.vcpus)
        .bind(new.memory_mb)
        .bind(new.vpc_id)
        .bind(new.subnet_id)
        .bind(Json(&new.port_map))
        .bind(new.scaling_group_id)
        .bind(new.deployment_id)
        .fetch_one(&self.db)
        .await?;
        Ok(inst)
    }

    async fn get_instance(&self, id: Uuid) -> CoreResult<Option<Instance>> {
        Ok(sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> CoreResult<Vec<Instance>> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances
             WHERE ($1::uuid IS NULL OR vpc_id = $1)
               AND ($2::uuid IS NULL OR scaling_group_id = $2)
               AND ($3::uuid IS NULL OR deployment_id = $3)
               AND (cardinality($4::text[]) = 0 OR state::text = ANY($4))
             ORDER BY created_at",
        )
        .bind(filter.vpc_id)
        .bind(filter.scaling_group_id)
        .bind(filter.deployment_id)
        .bind(state_names(&filter.states))
        .fetch_all(&self.db)
        .await?)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[InstanceState],
        to: InstanceState,
        patch: &InstancePatch,
        reason: &str,
    ) -> CoreResult<Option<Instance>> {
        let mut tx = self.db.begin().await?;

        let prev: Option<InstanceState> =
            sqlx::query_scalar("SELECT state FROM instances WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(prev) = prev else {
            return Ok(None);
        };
        if !from.contains(&prev) {
            return Ok(None);
        }

        let updated = sqlx::query_as::<_, Instance>(
            "UPDATE instances
             SET state = $2,
                 backend_handle = COALESCE($3, backend_handle),
                 private_ip = COALESCE($4, private_ip),
                 error_message = COALESCE($5, error_message),
                 terminated_at = CASE WHEN $2 = 'terminated'::instance_state THEN NOW() ELSE terminated_at END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(to)
        .bind(patch.backend_handle.as_deref())
        .bind(patch.private_ip.as_deref())
        .bind(patch.error_message.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO instance_state_history (instance_id, from_state, to_state, reason)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(prev)
        .bind(to)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn set_private_ip(&self, id: Uuid, ip: &str) -> CoreResult<()> {
        sqlx::query("UPDATE instances SET private_ip = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(ip)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn set_backend_handle(&self, id: Uuid, handle: &str) -> CoreResult<()> {
        sqlx::query("UPDATE instances SET backend_handle = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(handle)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn state_history(&self, id: Uuid) -> CoreResult<Vec<InstanceStateChange>> {
        Ok(sqlx::query_as::<_, InstanceStateChange>(
            "SELECT instance_id, from_state, to_state, reason, created_at
             FROM instance_state_history WHERE instance_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> CoreResult<Vec<Instance>> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances WHERE state = 'pending' AND created_at < $1 ORDER BY created_at",
        )
        .bind(before)
        .fetch_all(&self.db)
        .await?)
    }

    async fn stale_starting(&self, before: DateTime<Utc>) -> CoreResult<Vec<Instance>> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances WHERE state = 'starting' AND updated_at < $1 ORDER BY updated_at",
        )
        .bind(before)
        .fetch_all(&self.db)
        .await?)
    }
}

#[async_trait]
impl NetworkStore for PgStore {
    async fn insert_vpc(&self, name: &str, cidr: &str) -> CoreResult<Vpc> {
        Ok(sqlx::query_as::<_, Vpc>(
            "INSERT INTO vpcs (id, name, cidr) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(cidr)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_vpc(&self, id: Uuid) -> CoreResult<Option<Vpc>> {
        Ok(sqlx::query_as::<_, Vpc>("SELECT * FROM vpcs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_vpcs(&self) -> CoreResult<Vec<Vpc>> {
        Ok(sqlx::query_as::<_, Vpc>("SELECT * FROM vpcs ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn set_vpc_network_handle(&self, id: Uuid, handle: &str) -> CoreResult<()> {
        sqlx::query("UPDATE vpcs SET network_handle = $2 WHERE id = $1")
            .bind(id)
            .bind(handle)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_vpc(&self, id: Uuid) -> CoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let busy: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM subnets WHERE vpc_id = $1)
                 OR EXISTS (SELECT 1 FROM dns_zones WHERE vpc_id = $1)
                 OR EXISTS (SELECT 1 FROM instances WHERE vpc_id = $1 AND state <> 'terminated')",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if busy {
            return Err(CoreError::Conflict("vpc still owns resources".into()));
        }
        sqlx::query("DELETE FROM security_groups WHERE vpc_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM vpcs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_subnet(&self, vpc_id: Uuid, name: &str, cidr: &str, gateway: &str) -> CoreResult<Subnet> {
        Ok(sqlx::query_as::<_, Subnet>(
            "INSERT INTO subnets (id, vpc_id, name, cidr, gateway) VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(vpc_id)
        .bind(name)
        .bind(cidr)
        .bind(gateway)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_subnet(&self, id: Uuid) -> CoreResult<Option<Subnet>> {
        Ok(sqlx::query_as::<_, Subnet>("SELECT * FROM subnets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_subnets(&self, vpc_id: Uuid) -> CoreResult<Vec<Subnet>> {
        Ok(sqlx::query_as::<_, Subnet>("SELECT * FROM subnets WHERE vpc_id = $1 ORDER BY created_at")
            .bind(vpc_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn delete_subnet(&self, id: Uuid) -> CoreResult<bool> {
        let used: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM instances WHERE subnet_id = $1 AND state <> 'terminated')",
        )
        .bind(id)
        .fetch_one(&self.db)
        .await?;
        if used {
            return Err(CoreError::Conflict("subnet still has instances".into()));
        }
        let res = sqlx::query("DELETE FROM subnets WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_security_group(&self, vpc_id: Uuid, name: &str, rules: &[SecurityRule]) -> CoreResult<SecurityGroup> {
        Ok(sqlx::query_as::<_, SecurityGroup>(
            "INSERT INTO security_groups (id, vpc_id, name, rules) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(vpc_id)
        .bind(name)
        .bind(Json(rules))
        .fetch_one(&self.db)
        .await?)
    }

    async fn list_security_groups(&self, vpc_id: Uuid) -> CoreResult<Vec<SecurityGroup>> {
        Ok(sqlx::query_as::<_, SecurityGroup>(
            "SELECT * FROM security_groups WHERE vpc_id = $1 ORDER BY created_at",
        )
        .bind(vpc_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn delete_security_group(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM security_groups WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_elastic_ip(&self, address: &str) -> CoreResult<ElasticIp> {
        Ok(sqlx::query_as::<_, ElasticIp>(
            "INSERT INTO elastic_ips (id, address, status) VALUES ($1, $2, 'allocated') RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(address)
        .fetch_one(&self.db)
        .await?)
    }

    async fn list_elastic_ips(&self) -> CoreResult<Vec<ElasticIp>> {
        Ok(sqlx::query_as::<_, ElasticIp>("SELECT * FROM elastic_ips ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn associate_elastic_ip(&self, id: Uuid, instance_id: Option<Uuid>) -> CoreResult<Option<ElasticIp>> {
        match instance_id {
            Some(iid) => {
                let updated = sqlx::query_as::<_, ElasticIp>(
                    "UPDATE elastic_ips SET instance_id = $2, status = 'associated'
                     WHERE id = $1 AND instance_id IS NULL
                     RETURNING *",
                )
                .bind(id)
                .bind(iid)
                .fetch_optional(&self.db)
                .await?;
                if updated.is_some() {
                    return Ok(updated);
                }
                let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM elastic_ips WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&self.db)
                    .await?;
                if exists {
                    Err(CoreError::Conflict("address is already associated".into()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(sqlx::query_as::<_, ElasticIp>(
                "UPDATE elastic_ips SET instance_id = NULL, status = 'allocated' WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .fetch_optional(&self.db)
            .await?),
        }
    }

    async fn delete_elastic_ip(&self, id: Uuid) -> CoreResult<bool> {
        let associated: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT instance_id FROM elastic_ips WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        match associated {
            None => Ok(false),
            Some(Some(_)) => Err(CoreError::Conflict("address is associated".into())),
            Some(None) => {
                sqlx::query("DELETE FROM elastic_ips WHERE id = $1")
                    .bind(id)
                    .execute(&self.db)
                    .await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl VolumeStore for PgStore {
    async fn insert_volume(&self, name: &str, size_gb: i32) -> CoreResult<Volume> {
        Ok(sqlx::query_as::<_, Volume>(
            "INSERT INTO volumes (id, name, size_gb, status) VALUES ($1, $2, $3, 'creating') RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(size_gb)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_volume(&self, id: Uuid) -> CoreResult<Option<Volume>> {
        Ok(sqlx::query_as::<_, Volume>("SELECT * FROM volumes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_volumes(&self) -> CoreResult<Vec<Volume>> {
        Ok(sqlx::query_as::<_, Volume>("SELECT * FROM volumes ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn update_volume(&self, id: Uuid, status: VolumeStatus, backend_path: Option<&str>) -> CoreResult<()> {
        sqlx::query("UPDATE volumes SET status = $2, backend_path = COALESCE($3, backend_path) WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(backend_path)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn attach_volume(&self, id: Uuid, instance_id: Uuid) -> CoreResult<bool> {
        let holder: Option<Option<Uuid>> = sqlx::query_scalar(
            "UPDATE volumes
             SET instance_id = COALESCE(instance_id, $2),
                 status = CASE WHEN instance_id IS NULL THEN 'in_use'::volume_status ELSE status END
             WHERE id = $1
             RETURNING instance_id",
        )
        .bind(id)
        .bind(instance_id)
        .fetch_optional(&self.db)
        .await?;
        match holder {
            None => Err(CoreError::not_found(format!("volume {id}"))),
            Some(h) => Ok(h == Some(instance_id)),
        }
    }

    async fn detach_volume(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query(
            "UPDATE volumes
             SET instance_id = NULL,
                 status = CASE WHEN status = 'in_use' THEN 'available'::volume_status ELSE status END
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn volumes_for_instance(&self, instance_id: Uuid) -> CoreResult<Vec<Volume>> {
        Ok(sqlx::query_as::<_, Volume>(
            "SELECT * FROM volumes WHERE instance_id = $1 ORDER BY created_at",
        )
        .bind(instance_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn delete_volume(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM volumes WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_snapshot(&self, volume_id: Uuid, name: &str) -> CoreResult<Snapshot> {
        Ok(sqlx::query_as::<_, Snapshot>(
            "INSERT INTO snapshots (id, volume_id, name, status) VALUES ($1, $2, $3, 'creating') RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(volume_id)
        .bind(name)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_snapshot(&self, id: Uuid) -> CoreResult<Option<Snapshot>> {
        Ok(sqlx::query_as::<_, Snapshot>("SELECT * FROM snapshots WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_snapshots(&self, volume_id: Option<Uuid>) -> CoreResult<Vec<Snapshot>> {
        Ok(sqlx::query_as::<_, Snapshot>(
            "SELECT * FROM snapshots WHERE ($1::uuid IS NULL OR volume_id = $1) ORDER BY created_at",
        )
        .bind(volume_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn update_snapshot(&self, id: Uuid, status: SnapshotStatus, backend_path: Option<&str>) -> CoreResult<()> {
        sqlx::query("UPDATE snapshots SET status = $2, backend_path = COALESCE($3, backend_path) WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(backend_path)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerStore for PgStore {
    async fn insert_lb(&self, name: &str, port: i32, algorithm: LbAlgorithm) -> CoreResult<LoadBalancer> {
        Ok(sqlx::query_as::<_, LoadBalancer>(
            "INSERT INTO load_balancers (id, name, port, algorithm, status)
             VALUES ($1, $2, $3, $4, 'active') RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(port)
        .bind(algorithm)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_lb(&self, id: Uuid) -> CoreResult<Option<LoadBalancer>> {
        Ok(sqlx::query_as::<_, LoadBalancer>("SELECT * FROM load_balancers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_lbs(&self) -> CoreResult<Vec<LoadBalancer>> {
        Ok(sqlx::query_as::<_, LoadBalancer>("SELECT * FROM load_balancers ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn set_lb_proxy(&self, id: Uuid, proxy_id: &str) -> CoreResult<()> {
        sqlx::query("UPDATE load_balancers SET proxy_id = $2 WHERE id = $1")
            .bind(id)
            .bind(proxy_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_lb_deleting(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("UPDATE load_balancers SET status = 'deleting' WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_lb(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM load_balancers WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn upsert_target(&self, target: &LbTarget) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO lb_targets (lb_id, instance_id, port, weight) VALUES ($1, $2, $3, $4)
             ON CONFLICT (lb_id, instance_id) DO UPDATE SET port = EXCLUDED.port, weight = EXCLUDED.weight",
        )
        .bind(target.lb_id)
        .bind(target.instance_id)
        .bind(target.port)
        .bind(target.weight)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn remove_target(&self, lb_id: Uuid, instance_id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM lb_targets WHERE lb_id = $1 AND instance_id = $2")
            .bind(lb_id)
            .bind(instance_id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_targets(&self, lb_id: Uuid) -> CoreResult<Vec<TargetView>> {
        let rows = sqlx::query_as::<_, TargetRow>(
            "SELECT t.lb_id, t.instance_id, t.port, t.weight, i.state, i.backend_handle, i.private_ip
             FROM lb_targets t JOIN instances i ON i.id = t.instance_id
             WHERE t.lb_id = $1
             ORDER BY i.created_at",
        )
        .bind(lb_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TargetView {
                target: LbTarget {
                    lb_id: r.lb_id,
                    instance_id: r.instance_id,
                    port: r.port,
                    weight: r.weight,
                },
                state: r.state,
                backend_handle: r.backend_handle,
                private_ip: r.private_ip,
            })
            .collect())
    }
}

#[async_trait]
impl ScalingStore for PgStore {
    async fn insert_group(&self, new: &NewScalingGroup) -> CoreResult<ScalingGroup> {
        Ok(sqlx::query_as::<_, ScalingGroup>(
            "INSERT INTO scaling_groups (id, name, vpc_id, min_size, max_size, desired, launch_template, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'active') RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(new.vpc_id)
        .bind(new.min_size)
        .bind(new.max_size)
        .bind(new.desired)
        .bind(Json(&new.launch_template))
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_group(&self, id: Uuid) -> CoreResult<Option<ScalingGroup>> {
        Ok(sqlx::query_as::<_, ScalingGroup>("SELECT * FROM scaling_groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_groups(&self) -> CoreResult<Vec<ScalingGroup>> {
        Ok(sqlx::query_as::<_, ScalingGroup>("SELECT * FROM scaling_groups ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn set_desired(&self, id: Uuid, desired: i32) -> CoreResult<()> {
        sqlx::query("UPDATE scaling_groups SET desired = $2 WHERE id = $1")
            .bind(id)
            .bind(desired)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_group_deleting(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("UPDATE scaling_groups SET status = 'deleting' WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_group(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM scaling_groups WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_policy(&self, new: &NewScalingPolicy) -> CoreResult<ScalingPolicy> {
        Ok(sqlx::query_as::<_, ScalingPolicy>(
            "INSERT INTO scaling_policies
                (id, group_id, metric_type, target_value, scale_out_step, scale_in_step, cooldown_secs)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.group_id)
        .bind(&new.metric_type)
        .bind(new.target_value)
        .bind(new.scale_out_step)
        .bind(new.scale_in_step)
        .bind(new.cooldown_secs)
        .fetch_one(&self.db)
        .await?)
    }

    async fn list_policies(&self, group_id: Uuid) -> CoreResult<Vec<ScalingPolicy>> {
        Ok(sqlx::query_as::<_, ScalingPolicy>(
            "SELECT * FROM scaling_policies WHERE group_id = $1 ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn stamp_policy(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE scaling_policies SET last_fired_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for PgStore {
    async fn record_metric(&self, instance_id: Uuid, metric_type: &str, value: f64) -> CoreResult<()> {
        sqlx::query("INSERT INTO instance_metrics (instance_id, metric_type, value) VALUES ($1, $2, $3)")
            .bind(instance_id)
            .bind(metric_type)
            .bind(value)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn metric_for_group(&self, group_id: Uuid, metric_type: &str) -> CoreResult<Option<f64>> {
        Ok(sqlx::query_scalar(
            "SELECT AVG(value) FROM (
                 SELECT DISTINCT ON (m.instance_id) m.value
                 FROM instance_metrics m
                 JOIN instances i ON i.id = m.instance_id
                 WHERE i.scaling_group_id = $1
                   AND i.state IN ('pending', 'starting', 'running')
                   AND m.metric_type = $2
                   AND m.recorded_at > NOW() - INTERVAL '5 minutes'
                 ORDER BY m.instance_id, m.recorded_at DESC
             ) latest",
        )
        .bind(group_id)
        .bind(metric_type)
        .fetch_one(&self.db)
        .await?)
    }
}

#[async_trait]
impl CronStore for PgStore {
    async fn insert_cron(&self, name: &str, schedule: &str, target: &CronTarget) -> CoreResult<CronJob> {
        Ok(sqlx::query_as::<_, CronJob>(
            "INSERT INTO cron_jobs (id, name, schedule, target) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(schedule)
        .bind(Json(target))
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_cron(&self, id: Uuid) -> CoreResult<Option<CronJob>> {
        Ok(sqlx::query_as::<_, CronJob>("SELECT * FROM cron_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_cron(&self) -> CoreResult<Vec<CronJob>> {
        Ok(sqlx::query_as::<_, CronJob>("SELECT * FROM cron_jobs ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn set_cron_paused(&self, id: Uuid, paused: bool) -> CoreResult<Option<CronJob>> {
        Ok(sqlx::query_as::<_, CronJob>("UPDATE cron_jobs SET paused = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(paused)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn stamp_cron(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE cron_jobs SET last_fired_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_cron(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM cron_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn insert_deployment(
        &self,
        name: &str,
        replicas: i32,
        template: &LaunchTemplate,
        vpc_id: Option<Uuid>,
    ) -> CoreResult<ContainerDeployment> {
        Ok(sqlx::query_as::<_, ContainerDeployment>(
            "INSERT INTO container_deployments (id, name, desired_replicas, template, vpc_id)
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(replicas)
        .bind(Json(template))
        .bind(vpc_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<ContainerDeployment>> {
        Ok(sqlx::query_as::<_, ContainerDeployment>("SELECT * FROM container_deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_deployments(&self) -> CoreResult<Vec<ContainerDeployment>> {
        Ok(sqlx::query_as::<_, ContainerDeployment>(
            "SELECT * FROM container_deployments ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?)
    }

    async fn set_desired_replicas(&self, id: Uuid, replicas: i32) -> CoreResult<Option<ContainerDeployment>> {
        Ok(sqlx::query_as::<_, ContainerDeployment>(
            "UPDATE container_deployments SET desired_replicas = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(replicas)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn set_current_replicas(&self, id: Uuid, replicas: i32) -> CoreResult<()> {
        sqlx::query("UPDATE container_deployments SET current_replicas = $2 WHERE id = $1")
            .bind(id)
            .bind(replicas)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DnsStore for PgStore {
    async fn insert_zone(&self, name: &str, vpc_id: Option<Uuid>, backend_zone_id: Option<&str>) -> CoreResult<DnsZone> {
        Ok(sqlx::query_as::<_, DnsZone>(
            "INSERT INTO dns_zones (id, name, vpc_id, backend_zone_id) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(vpc_id)
        .bind(backend_zone_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_zone(&self, id: Uuid) -> CoreResult<Option<DnsZone>> {
        Ok(sqlx::query_as::<_, DnsZone>("SELECT * FROM dns_zones WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_zones(&self) -> CoreResult<Vec<DnsZone>> {
        Ok(sqlx::query_as::<_, DnsZone>("SELECT * FROM dns_zones ORDER BY created_at")
            .fetch_all(&self.db)
            .await?)
    }

    async fn zone_for_vpc(&self, vpc_id: Uuid) -> CoreResult<Option<DnsZone>> {
        Ok(sqlx::query_as::<_, DnsZone>("SELECT * FROM dns_zones WHERE vpc_id = $1")
            .bind(vpc_id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn delete_zone(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM dns_zones WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_record(&self, new: &NewDnsRecord) -> CoreResult<DnsRecord> {
        Ok(sqlx::query_as::<_, DnsRecord>(
            "INSERT INTO dns_records (id, zone_id, name, record_type, content, ttl, auto_managed, instance_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.zone_id)
        .bind(&new.name)
        .bind(new.record_type)
        .bind(&new.content)
        .bind(new.ttl)
        .bind(new.auto_managed)
        .bind(new.instance_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn get_record(&self, id: Uuid) -> CoreResult<Option<DnsRecord>> {
        Ok(sqlx::query_as::<_, DnsRecord>("SELECT * FROM dns_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_records(&self, zone_id: Uuid) -> CoreResult<Vec<DnsRecord>> {
        Ok(sqlx::query_as::<_, DnsRecord>(
            "SELECT * FROM dns_records WHERE zone_id = $1 ORDER BY created_at",
        )
        .bind(zone_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn update_record_content(&self, id: Uuid, content: &str) -> CoreResult<()> {
        sqlx::query("UPDATE dns_records SET content = $2 WHERE id = $1")
            .bind(id)
            .bind(content)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_record(&self, id: Uuid) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM dns_records WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn auto_records(&self) -> CoreResult<Vec<DnsRecord>> {
        Ok(sqlx::query_as::<_, DnsRecord>(
            "SELECT * FROM dns_records WHERE auto_managed ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?)
    }

    async fn auto_records_for(&self, instance_id: Uuid) -> CoreResult<Vec<DnsRecord>> {
        Ok(sqlx::query_as::<_, DnsRecord>(
            "SELECT * FROM dns_records WHERE auto_managed AND instance_id = $1",
        )
        .bind(instance_id)
        .fetch_all(&self.db)
        .await?)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> CoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}
