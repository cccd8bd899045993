mod common;

use common::{Fixture, ZONE};
use cpi::cloud::{ComputeApi, InstanceState};
use cpi::context::RequestContext;
use cpi::properties::{AdvertisedRoute, DiskCloudProperties, EphemeralDisk, VmCloudProperties};
use cpi::registry::Registry;
use cpi::vm::CreatedVm;
use cpi::{CpiResult, ErrorType};
use cpi_id::{InstanceId, VolumeId};
use serde_json::{json, Value};

fn vm_props(instance_type: &str) -> VmCloudProperties {
    VmCloudProperties {
        instance_type: Some(instance_type.to_string()),
        ..Default::default()
    }
}

async fn create(
    fixture: &Fixture,
    props: &VmCloudProperties,
    networks: &Value,
    disk_locality: &[VolumeId],
) -> CpiResult<CreatedVm> {
    fixture
        .vms()
        .create_vm(
            "agent-1",
            &fixture.stemcell(),
            props,
            networks,
            disk_locality,
            &json!({"bosh": {"password": "secret"}}),
            &RequestContext {
                director_uuid: Some("director-uuid".to_string()),
                request_id: None,
            },
        )
        .await
}

#[tokio::test(start_paused = true)]
async fn create_vm_launches_and_writes_settings() {
    let fixture = Fixture::new();
    let networks = fixture.manual_network("10.0.0.10");

    let created = create(&fixture, &vm_props("m5.large"), &networks, &[])
        .await
        .unwrap();
    assert_eq!(created.networks, networks);

    let instance = fixture.cloud.instance(&created.vm_id).unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.availability_zone, ZONE);
    assert_eq!(instance.private_ip, Some("10.0.0.10".parse().unwrap()));
    assert_eq!(instance.tags["agent_id"], "agent-1");
    assert_eq!(instance.tags["director"], "director-uuid");

    let launch = fixture.cloud.last_launch().unwrap();
    assert_eq!(launch.network_interfaces.len(), 1);
    assert_eq!(
        launch.network_interfaces[0].security_groups,
        vec![fixture.security_group.clone()]
    );
    assert_eq!(launch.block_device_mappings.len(), 2);

    let settings = fixture.registry.read_settings(&created.vm_id).await.unwrap();
    assert_eq!(settings.agent_id, "agent-1");
    assert!(settings.vm.name.starts_with("vm-"));
    assert_eq!(settings.networks, networks);
    assert_eq!(settings.env, json!({"bosh": {"password": "secret"}}));
    assert_eq!(settings.disks.system, "/dev/xvda");
    assert_eq!(settings.disks.ephemeral.as_deref(), Some("/dev/sdb"));
    assert!(settings.disks.persistent.is_empty());
    assert!(settings.disks.raw_ephemeral.is_empty());
}

#[tokio::test(start_paused = true)]
async fn raw_instance_storage_settings_shape() {
    let fixture = Fixture::new();
    let props = VmCloudProperties {
        raw_instance_storage: true,
        ephemeral_disk: EphemeralDisk {
            size: Some(20480),
            ..Default::default()
        },
        ..vm_props("m3.xlarge")
    };

    let created = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap();

    let settings = fixture.registry.read_settings(&created.vm_id).await.unwrap();
    let document = serde_json::to_value(&settings).unwrap();
    assert_eq!(
        document["disks"],
        json!({
            "system": "/dev/xvda",
            "persistent": {},
            "ephemeral": "/dev/sdb",
            "raw_ephemeral": [{"path": "/dev/xvdba"}, {"path": "/dev/xvdbb"}]
        })
    );

    // The ephemeral EBS volume has the requested size.
    let instance = fixture.cloud.instance(&created.vm_id).unwrap();
    let ephemeral = instance
        .block_devices
        .iter()
        .find(|b| b.device_name == "/dev/sdb")
        .unwrap();
    assert_eq!(
        fixture.cloud.volume(&ephemeral.volume_id).unwrap().size_gib,
        20
    );
}

#[tokio::test(start_paused = true)]
async fn raw_instance_storage_on_nvme_family() {
    let fixture = Fixture::new();
    let props = VmCloudProperties {
        raw_instance_storage: true,
        ..vm_props("i3.large")
    };

    let created = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap();
    let settings = fixture.registry.read_settings(&created.vm_id).await.unwrap();
    let paths: Vec<&str> = settings
        .disks
        .raw_ephemeral
        .iter()
        .map(|d| d.path.as_str())
        .collect();
    assert_eq!(paths, ["/dev/nvme1n1"]);
}

#[tokio::test(start_paused = true)]
async fn create_vm_requires_instance_type() {
    let fixture = Fixture::new();
    let err = create(
        &fixture,
        &VmCloudProperties::default(),
        &fixture.dynamic_network(),
        &[],
    )
    .await
    .unwrap_err();

    assert_eq!(err.error_type(), ErrorType::Unknown);
    assert_eq!(err.to_string(), "Missing VM cloud properties: 'instance_type'");
    assert_eq!(fixture.cloud.call_count("run_instance"), 0);
}

#[tokio::test(start_paused = true)]
async fn create_vm_reports_missing_network_fields() {
    let fixture = Fixture::new();
    let networks = json!({
        "a": {"type": "manual", "cloud_properties": {"subnet": fixture.subnet.to_string()}},
        "b": {"type": "dynamic"}
    });

    let err = create(&fixture, &vm_props("m5.large"), &networks, &[])
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Missing network properties: 'a.ip', 'b.cloud_properties.subnet'"
    );
}

#[tokio::test(start_paused = true)]
async fn create_vm_rejects_conflicting_zones() {
    let fixture = Fixture::new();
    let props = VmCloudProperties {
        availability_zone: Some("us-east-1b".to_string()),
        ..vm_props("m5.large")
    };

    let err = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Unknown);
    assert!(err.to_string().contains("multiple availability zones"));
    assert_eq!(fixture.cloud.call_count("run_instance"), 0);
}

#[tokio::test(start_paused = true)]
async fn disk_locality_must_match_subnet_zone() {
    let fixture = Fixture::with_config(|config| {
        config.cloud.default_availability_zone = Some("us-east-1b".to_string());
    });
    let disk = fixture
        .disks()
        .create_disk(1024, &DiskCloudProperties::default(), None)
        .await
        .unwrap();

    let err = create(&fixture, &vm_props("m5.large"), &fixture.dynamic_network(), &[disk])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("us-east-1b"));
}

#[tokio::test(start_paused = true)]
async fn security_groups_by_id_and_name() {
    let fixture = Fixture::new();
    let other = fixture.cloud.add_security_group(&fixture.vpc, "web");

    let by_id = VmCloudProperties {
        security_groups: vec![other.to_string()],
        ..vm_props("m5.large")
    };
    create(&fixture, &by_id, &fixture.dynamic_network(), &[])
        .await
        .unwrap();
    let launch = fixture.cloud.last_launch().unwrap();
    assert_eq!(launch.network_interfaces[0].security_groups, vec![other.clone()]);

    let by_name = VmCloudProperties {
        security_groups: vec!["web".to_string(), "default".to_string()],
        ..vm_props("m5.large")
    };
    create(&fixture, &by_name, &fixture.dynamic_network(), &[])
        .await
        .unwrap();
    let launch = fixture.cloud.last_launch().unwrap();
    assert_eq!(
        launch.network_interfaces[0].security_groups,
        vec![other.clone(), fixture.security_group.clone()]
    );

    let mixed = VmCloudProperties {
        security_groups: vec![other.to_string(), "default".to_string()],
        ..vm_props("m5.large")
    };
    let err = create(&fixture, &mixed, &fixture.dynamic_network(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Unknown);

    let unknown = VmCloudProperties {
        security_groups: vec!["nope".to_string()],
        ..vm_props("m5.large")
    };
    let err = create(&fixture, &unknown, &fixture.dynamic_network(), &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));
}

#[tokio::test(start_paused = true)]
async fn source_dest_check_and_public_addresses() {
    let fixture = Fixture::new();
    let props = VmCloudProperties {
        source_dest_check: false,
        auto_assign_public_ip: true,
        ..vm_props("m5.large")
    };

    let created = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap();
    let instance = fixture.cloud.instance(&created.vm_id).unwrap();
    assert!(!instance.source_dest_check);
    assert!(instance.public_ip.is_some());
    assert!(fixture.cloud.last_launch().unwrap().network_interfaces[0].associate_public_ip);

    let mut networks = fixture.dynamic_network();
    networks["public"] = json!({"type": "vip", "ip": "52.1.2.3"});
    let created = create(&fixture, &vm_props("m5.large"), &networks, &[])
        .await
        .unwrap();
    let instance = fixture.cloud.instance(&created.vm_id).unwrap();
    assert_eq!(instance.public_ip, Some("52.1.2.3".parse().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn ipv6_network_adds_address_to_interface() {
    let fixture = Fixture::new();
    let mut networks = fixture.manual_network("10.0.0.20");
    networks["v6"] = json!({
        "type": "ipv6",
        "ip": "2600:1f18::10",
        "cloud_properties": {"subnet": fixture.subnet.to_string()}
    });

    create(&fixture, &vm_props("m5.large"), &networks, &[])
        .await
        .unwrap();
    let launch = fixture.cloud.last_launch().unwrap();
    assert_eq!(launch.network_interfaces.len(), 1);
    let interface = &launch.network_interfaces[0];
    assert_eq!(interface.private_ip, Some("10.0.0.20".parse().unwrap()));
    assert_eq!(
        interface.ipv6_addresses,
        vec!["2600:1f18::10".parse::<std::net::Ipv6Addr>().unwrap()]
    );
}

#[tokio::test(start_paused = true)]
async fn advertised_routes_are_upserted() {
    let fixture = Fixture::new();
    let table = fixture.cloud.add_route_table();
    let previous = InstanceId::from_sequence(900);
    fixture
        .cloud
        .create_route(&table, "10.1.0.0/16", &previous)
        .await
        .unwrap();

    let props = VmCloudProperties {
        advertised_routes: vec![
            AdvertisedRoute {
                table_id: table.clone(),
                destination: "10.1.0.0/16".to_string(),
            },
            AdvertisedRoute {
                table_id: table.clone(),
                destination: "10.2.0.0/16".to_string(),
            },
        ],
        ..vm_props("m5.large")
    };
    let created = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap();

    let routes = fixture.cloud.route_table(&table).unwrap().routes;
    assert_eq!(routes.len(), 2);
    assert!(routes
        .iter()
        .all(|r| r.instance_id.as_ref() == Some(&created.vm_id)));
    assert_eq!(fixture.cloud.call_count("replace_route"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_configuration_terminates_instance() {
    let fixture = Fixture::new();
    let props = VmCloudProperties {
        advertised_routes: vec![AdvertisedRoute {
            table_id: "rtb-00000000000000999".parse().unwrap(),
            destination: "10.1.0.0/16".to_string(),
        }],
        ..vm_props("m5.large")
    };

    let err = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::CloudError);

    let ids = fixture.cloud.instance_ids();
    assert_eq!(ids.len(), 1);
    let instance = fixture.cloud.instance(&ids[0]).unwrap();
    assert_eq!(instance.state, InstanceState::ShuttingDown);
    assert_eq!(fixture.cloud.call_count("terminate_instance"), 1);
}

#[tokio::test(start_paused = true)]
async fn load_balancer_failures_are_surfaced_without_rollback() {
    let fixture = Fixture::new();
    fixture.cloud.add_load_balancer("web");
    fixture.cloud.add_load_balancer("broken");
    fixture.cloud.add_target_group("tg");
    fixture.cloud.reject_registrations("broken");

    let props = VmCloudProperties {
        elbs: vec!["web".to_string(), "broken".to_string()],
        lb_target_groups: vec!["tg".to_string()],
        ..vm_props("m5.large")
    };
    let err = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::CloudError);
    assert!(err.to_string().contains("broken"));

    let ids = fixture.cloud.instance_ids();
    let vm = &ids[0];
    assert_eq!(
        fixture.cloud.instance(vm).unwrap().state,
        InstanceState::Running
    );
    assert_eq!(fixture.cloud.load_balancer_members("web"), vec![vm.clone()]);
    assert_eq!(fixture.cloud.target_group_members("tg"), vec![vm.clone()]);
    assert_eq!(fixture.cloud.call_count("terminate_instance"), 0);
}

#[tokio::test(start_paused = true)]
async fn delete_vm_deregisters_and_terminates() {
    let fixture = Fixture::new();
    fixture.cloud.add_load_balancer("web");
    fixture.cloud.add_target_group("tg");
    let props = VmCloudProperties {
        elbs: vec!["web".to_string()],
        lb_target_groups: vec!["tg".to_string()],
        ..vm_props("m5.large")
    };
    let vm = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap()
        .vm_id;
    let root = fixture.cloud.instance(&vm).unwrap().block_devices[0]
        .volume_id
        .clone();

    let vms = fixture.vms();
    assert!(vms.has_vm(&vm).await.unwrap());
    vms.delete_vm(&vm).await.unwrap();

    assert!(!vms.has_vm(&vm).await.unwrap());
    assert!(fixture.cloud.load_balancer_members("web").is_empty());
    assert!(fixture.cloud.target_group_members("tg").is_empty());
    assert!(fixture.cloud.volume(&root).is_none());
    assert!(fixture.registry.is_empty().await);

    let err = vms.delete_vm(&vm).await.unwrap_err();
    assert_eq!(err.error_type(), ErrorType::VmNotFound);
    assert!(!err.ok_to_retry());
}

#[tokio::test(start_paused = true)]
async fn delete_vm_terminates_despite_stuck_target_group() {
    let fixture = Fixture::new();
    fixture.cloud.add_load_balancer("web");
    fixture.cloud.add_target_group("stuck");
    let props = VmCloudProperties {
        elbs: vec!["web".to_string()],
        lb_target_groups: vec!["stuck".to_string()],
        ..vm_props("m5.large")
    };
    let vm = create(&fixture, &props, &fixture.dynamic_network(), &[])
        .await
        .unwrap()
        .vm_id;
    fixture.cloud.reject_deregistrations("stuck");

    let vms = fixture.vms();
    let err = vms.delete_vm(&vm).await.unwrap_err();
    assert_eq!(err.error_type(), ErrorType::CloudError);
    assert!(err.to_string().contains("target group 'stuck'"));

    assert!(!vms.has_vm(&vm).await.unwrap());
    assert_eq!(fixture.cloud.call_count("terminate_instance"), 1);
    assert!(fixture.cloud.load_balancer_members("web").is_empty());
    assert!(fixture.registry.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn has_vm_for_unknown_id() {
    let fixture = Fixture::new();
    assert!(!fixture
        .vms()
        .has_vm(&InstanceId::from_sequence(999))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn reboot_vm() {
    let fixture = Fixture::new();
    let vm = create(&fixture, &vm_props("m5.large"), &fixture.dynamic_network(), &[])
        .await
        .unwrap()
        .vm_id;

    fixture.vms().reboot_vm(&vm).await.unwrap();
    assert_eq!(fixture.cloud.call_count("reboot_instance"), 1);

    let err = fixture
        .vms()
        .reboot_vm(&InstanceId::from_sequence(999))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), ErrorType::VmNotFound);
}

#[tokio::test(start_paused = true)]
async fn set_vm_metadata_tags_instance_and_volumes() {
    let fixture = Fixture::new();
    let vm = create(&fixture, &vm_props("m5.large"), &fixture.dynamic_network(), &[])
        .await
        .unwrap()
        .vm_id;

    let metadata = json!({"deployment": "cf", "job": "router", "index": 1});
    fixture
        .vms()
        .set_vm_metadata(&vm, metadata.as_object().unwrap())
        .await
        .unwrap();

    let instance = fixture.cloud.instance(&vm).unwrap();
    assert_eq!(instance.tags["Name"], "router/1");
    assert_eq!(instance.tags["deployment"], "cf");
    for device in &instance.block_devices {
        let tags = fixture.cloud.volume(&device.volume_id).unwrap().tags;
        assert_eq!(tags["Name"], "router/1");
        assert_eq!(tags["index"], "1");
    }
}

#[tokio::test(start_paused = true)]
async fn get_disks_lists_root_first() {
    let fixture = Fixture::new();
    let vm = create(&fixture, &vm_props("m5.large"), &fixture.dynamic_network(), &[])
        .await
        .unwrap()
        .vm_id;
    let disk = fixture
        .disks()
        .create_disk(1024, &DiskCloudProperties::default(), Some(&vm))
        .await
        .unwrap();
    fixture.disks().attach_disk(&vm, &disk).await.unwrap();

    let instance = fixture.cloud.instance(&vm).unwrap();
    let volume_at = |device: &str| {
        instance
            .block_devices
            .iter()
            .find(|b| b.device_name == device)
            .unwrap()
            .volume_id
            .clone()
    };

    let disks = fixture.vms().get_disks(&vm).await.unwrap();
    assert_eq!(
        disks,
        vec![volume_at("/dev/xvda"), volume_at("/dev/sdb"), disk]
    );
}
