//! Network, security group, route and load balancer configuration.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use cpi_id::{InstanceId, SecurityGroupId, SubnetId, VpcId};
use serde_json::Value;
use tracing::{info, warn};

use crate::cloud::NetworkInterfaceRequest;
use crate::context::CloudContext;
use crate::error::{CpiError, CpiResult};
use crate::properties::{AdvertisedRoute, NetworkSpec, NetworkType};

/// Network attachments resolved for a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNetworks {
    /// One interface per distinct subnet, in order of first appearance.
    pub interfaces: Vec<NetworkInterfaceRequest>,
    pub vpc_id: VpcId,
    /// Zone of the subnets.
    pub availability_zone: String,
    /// Elastic IP to associate after launch.
    pub vip: Option<IpAddr>,
}

/// Decode the orchestrator's network spec (`{name: spec}`).
pub fn parse_network_specs(networks: &Value) -> CpiResult<BTreeMap<String, NetworkSpec>> {
    serde_json::from_value(networks.clone())
        .map_err(|e| CpiError::validation(format!("Invalid network spec: {e}")))
}

#[derive(Clone)]
pub struct NetworkConfigurator {
    ctx: Arc<CloudContext>,
}

impl NetworkConfigurator {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        Self { ctx }
    }

    /// Turn network specs into interface requests.
    ///
    /// `vm_security_groups` take precedence over per-network groups, which
    /// take precedence over the configured defaults.
    pub async fn resolve(
        &self,
        specs: &BTreeMap<String, NetworkSpec>,
        vm_security_groups: &[String],
        auto_assign_public_ip: bool,
    ) -> CpiResult<ResolvedNetworks> {
        let mut missing = Vec::new();
        let mut vip = None;
        let mut order: Vec<SubnetId> = Vec::new();
        let mut interfaces: BTreeMap<SubnetId, NetworkInterfaceRequest> = BTreeMap::new();
        let mut network_groups: Vec<String> = Vec::new();

        for (name, spec) in specs {
            if spec.network_type == NetworkType::Vip {
                match spec.ip {
                    Some(ip) => vip = Some(ip),
                    None => missing.push(format!("'{name}.ip'")),
                }
                continue;
            }

            let ip = match (spec.network_type, spec.ip) {
                (NetworkType::Manual | NetworkType::Ipv6, None) => {
                    missing.push(format!("'{name}.ip'"));
                    None
                }
                (NetworkType::Ipv6, Some(IpAddr::V4(_))) => {
                    return Err(CpiError::validation(format!(
                        "Network '{name}' has type ipv6 but an IPv4 address"
                    )));
                }
                (NetworkType::Manual | NetworkType::Ipv6, ip) => ip,
                _ => None,
            };
            let Some(subnet) = spec.cloud_properties.subnet.clone() else {
                missing.push(format!("'{name}.cloud_properties.subnet'"));
                continue;
            };

            for group in &spec.cloud_properties.security_groups {
                if !network_groups.contains(group) {
                    network_groups.push(group.clone());
                }
            }

            let interface = interfaces.entry(subnet.clone()).or_insert_with(|| {
                order.push(subnet.clone());
                NetworkInterfaceRequest {
                    device_index: 0,
                    subnet_id: subnet.clone(),
                    private_ip: None,
                    ipv6_addresses: Vec::new(),
                    security_groups: Vec::new(),
                    associate_public_ip: false,
                }
            });

            match ip {
                Some(IpAddr::V4(v4)) => {
                    if interface.private_ip.is_some_and(|existing| existing != v4) {
                        return Err(CpiError::validation(format!(
                            "Network '{name}' assigns a second IPv4 address on subnet {subnet}"
                        )));
                    }
                    interface.private_ip = Some(v4);
                }
                Some(IpAddr::V6(v6)) => interface.ipv6_addresses.push(v6),
                None => {}
            }
        }

        if !missing.is_empty() {
            return Err(CpiError::validation(format!(
                "Missing network properties: {}",
                missing.join(", ")
            )));
        }
        if order.is_empty() {
            return Err(CpiError::validation(
                "At least one manual or dynamic network is required",
            ));
        }

        // All interfaces must share a VPC and zone.
        let mut placement: Option<(VpcId, String)> = None;
        for subnet_id in &order {
            let subnet = self
                .ctx
                .retry("describe_subnet", || {
                    self.ctx.compute.describe_subnet(subnet_id)
                })
                .await?
                .ok_or_else(|| CpiError::validation(format!("Subnet {subnet_id} not found")))?;
            if let Some((vpc, zone)) = &placement {
                if *vpc != subnet.vpc_id || *zone != subnet.availability_zone {
                    return Err(CpiError::validation(format!(
                        "Subnet {subnet_id} ({}, {}) does not match {vpc} in {zone}",
                        subnet.vpc_id, subnet.availability_zone
                    )));
                }
                continue;
            }
            placement = Some((subnet.vpc_id, subnet.availability_zone));
        }
        let Some((vpc_id, availability_zone)) = placement else {
            return Err(CpiError::validation("No subnets resolved"));
        };

        let requested = if !vm_security_groups.is_empty() {
            vm_security_groups
        } else if !network_groups.is_empty() {
            &network_groups[..]
        } else {
            &self.ctx.config.cloud.default_security_groups[..]
        };
        let security_groups = self.resolve_security_groups(&vpc_id, requested).await?;

        let mut ordered = Vec::with_capacity(order.len());
        for (index, subnet) in order.iter().enumerate() {
            if let Some(mut interface) = interfaces.remove(subnet) {
                interface.device_index = index as u32;
                interface.security_groups = security_groups.clone();
                interface.associate_public_ip = index == 0 && auto_assign_public_ip;
                ordered.push(interface);
            }
        }

        Ok(ResolvedNetworks {
            interfaces: ordered,
            vpc_id,
            availability_zone,
            vip,
        })
    }

    /// Resolve a list that is either all ids (`sg-...`) or all names.
    pub async fn resolve_security_groups(
        &self,
        vpc: &VpcId,
        groups: &[String],
    ) -> CpiResult<Vec<SecurityGroupId>> {
        let (ids, names): (Vec<&String>, Vec<&String>) = groups
            .iter()
            .partition(|g| g.starts_with("sg-"));

        match (ids.is_empty(), names.is_empty()) {
            (true, true) => Ok(Vec::new()),
            (false, false) => Err(CpiError::validation(format!(
                "Security groups must be all ids or all names, got: {}",
                groups.join(", ")
            ))),
            (false, true) => ids
                .into_iter()
                .map(|id| SecurityGroupId::parse(id).map_err(CpiError::from))
                .collect(),
            (true, false) => {
                let names: Vec<String> = names.into_iter().cloned().collect();
                let found = self
                    .ctx
                    .retry("find_security_groups", || {
                        self.ctx.compute.find_security_groups(vpc, &names)
                    })
                    .await?;

                let mut resolved = Vec::with_capacity(names.len());
                let mut unknown = Vec::new();
                for name in &names {
                    match found.iter().find(|g| g.name == *name) {
                        Some(group) => resolved.push(group.id.clone()),
                        None => unknown.push(name.as_str()),
                    }
                }
                if !unknown.is_empty() {
                    return Err(CpiError::validation(format!(
                        "Security groups not found in {vpc}: {}",
                        unknown.join(", ")
                    )));
                }
                Ok(resolved)
            }
        }
    }

    /// Point each advertised route at `instance`, creating or replacing it.
    pub async fn apply_routes(
        &self,
        instance: &InstanceId,
        routes: &[AdvertisedRoute],
    ) -> CpiResult<()> {
        for route in routes {
            let table = self
                .ctx
                .retry("describe_route_table", || {
                    self.ctx.compute.describe_route_table(&route.table_id)
                })
                .await?
                .ok_or_else(|| {
                    CpiError::cloud(format!("Route table {} not found", route.table_id))
                })?;

            let exists = table
                .routes
                .iter()
                .any(|r| r.destination_cidr == route.destination);

            if exists {
                self.ctx
                    .retry("replace_route", || {
                        self.ctx
                            .compute
                            .replace_route(&route.table_id, &route.destination, instance)
                    })
                    .await?;
            } else {
                self.ctx
                    .retry("create_route", || {
                        self.ctx
                            .compute
                            .create_route(&route.table_id, &route.destination, instance)
                    })
                    .await?;
            }
            info!(
                vm_id = %instance,
                table_id = %route.table_id,
                destination = %route.destination,
                replaced = exists,
                "Advertised route"
            );
        }
        Ok(())
    }

    /// Register with every load balancer and target group.
    ///
    /// All registrations are attempted; failures are reported together and
    /// successful registrations are kept.
    pub async fn register_load_balancers(
        &self,
        instance: &InstanceId,
        elbs: &[String],
        target_groups: &[String],
    ) -> CpiResult<()> {
        let mut failures = Vec::new();

        for elb in elbs {
            match self
                .ctx
                .retry("register_with_load_balancer", || {
                    self.ctx.compute.register_with_load_balancer(elb, instance)
                })
                .await
            {
                Ok(()) => info!(vm_id = %instance, elb = %elb, "Registered with load balancer"),
                Err(err) => {
                    warn!(vm_id = %instance, elb = %elb, error = %err, "Load balancer registration failed");
                    failures.push(format!("load balancer '{elb}': {err}"));
                }
            }
        }

        for group in target_groups {
            match self
                .ctx
                .retry("register_target", || {
                    self.ctx.compute.register_target(group, instance)
                })
                .await
            {
                Ok(()) => info!(vm_id = %instance, target_group = %group, "Registered with target group"),
                Err(err) => {
                    warn!(vm_id = %instance, target_group = %group, error = %err, "Target group registration failed");
                    failures.push(format!("target group '{group}': {err}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CpiError::cloud(format!(
                "VM {instance} failed to register with {}",
                failures.join("; ")
            )))
        }
    }

    /// Deregister from every load balancer and target group the instance is in.
    ///
    /// Like registration, every deregistration is attempted and failures are
    /// reported together. Memberships that are already gone are ignored.
    pub async fn deregister_load_balancers(&self, instance: &InstanceId) -> CpiResult<()> {
        let mut failures = Vec::new();

        match self
            .ctx
            .retry("load_balancers_for_instance", || {
                self.ctx.compute.load_balancers_for_instance(instance)
            })
            .await
        {
            Ok(elbs) => {
                for elb in &elbs {
                    let result = self
                        .ctx
                        .retry("deregister_from_load_balancer", || {
                            self.ctx.compute.deregister_from_load_balancer(elb, instance)
                        })
                        .await;
                    match result {
                        Ok(()) => info!(vm_id = %instance, elb = %elb, "Deregistered from load balancer"),
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            warn!(vm_id = %instance, elb = %elb, error = %err, "Load balancer deregistration failed");
                            failures.push(format!("load balancer '{elb}': {err}"));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(vm_id = %instance, error = %err, "Failed to list load balancers");
                failures.push(format!("load balancers: {err}"));
            }
        }

        match self
            .ctx
            .retry("target_groups_for_instance", || {
                self.ctx.compute.target_groups_for_instance(instance)
            })
            .await
        {
            Ok(groups) => {
                for group in &groups {
                    let result = self
                        .ctx
                        .retry("deregister_target", || {
                            self.ctx.compute.deregister_target(group, instance)
                        })
                        .await;
                    match result {
                        Ok(()) => info!(vm_id = %instance, target_group = %group, "Deregistered from target group"),
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            warn!(vm_id = %instance, target_group = %group, error = %err, "Target group deregistration failed");
                            failures.push(format!("target group '{group}': {err}"));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(vm_id = %instance, error = %err, "Failed to list target groups");
                failures.push(format!("target groups: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CpiError::cloud(format!(
                "VM {instance} failed to deregister from {}",
                failures.join("; ")
            )))
        }
    }
}
