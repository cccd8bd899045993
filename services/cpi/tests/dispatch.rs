mod common;

use std::sync::Arc;

use common::Fixture;
use cpi::registry::MemoryRegistry;
use cpi::{Cpi, ErrorType, Request, Response};
use serde_json::{json, Value};

async fn call(fixture: &Fixture, request: Request) -> Response {
    fixture.cpi().dispatch(request).await
}

fn ok(response: Response) -> Value {
    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
    response.result
}

#[tokio::test]
async fn info_reports_formats_and_version() {
    let fixture = Fixture::new();
    let result = ok(call(&fixture, Request::new("info", vec![])).await);
    assert_eq!(
        result,
        json!({"stemcell_formats": ["aws-raw", "aws-light"], "api_version": 2})
    );
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let fixture = Fixture::new();
    let response = call(&fixture, Request::new("explode", vec![])).await;

    assert_eq!(response.result, Value::Null);
    let error = response.error.unwrap();
    assert_eq!(error.error_type, ErrorType::Unknown);
    assert!(error.message.starts_with("Invalid Method"));
    assert!(!error.ok_to_retry);
}

#[tokio::test]
async fn calculate_vm_cloud_properties_validation() {
    let fixture = Fixture::new();
    let response = call(
        &fixture,
        Request::new("calculate_vm_cloud_properties", vec![json!({})]),
    )
    .await;

    let error = response.error.unwrap();
    assert_eq!(error.error_type, ErrorType::Unknown);
    assert_eq!(
        error.message,
        "Missing VM cloud properties: 'cpu', 'ram', 'ephemeral_disk_size'"
    );
    assert!(!error.ok_to_retry);
    assert!(response.log.contains("Missing VM cloud properties"));

    let result = ok(call(
        &fixture,
        Request::new(
            "calculate_vm_cloud_properties",
            vec![json!({"cpu": 1, "ram": 512, "ephemeral_disk_size": 1024})],
        ),
    )
    .await);
    assert_eq!(
        result,
        json!({"instance_type": "t3.micro", "ephemeral_disk": {"size": 1024}})
    );
}

#[tokio::test]
async fn bad_arguments_are_unknown_errors() {
    let fixture = Fixture::new();

    let response = call(&fixture, Request::new("has_vm", vec![json!("vol-1234")])).await;
    assert_eq!(response.error.unwrap().error_type, ErrorType::Unknown);

    let response = call(
        &fixture,
        Request::new("create_disk", vec![json!(1024), json!({"flavor": "fast"})]),
    )
    .await;
    let error = response.error.unwrap();
    assert_eq!(error.error_type, ErrorType::Unknown);
    assert!(error.message.starts_with("Invalid disk cloud properties"));
}

#[tokio::test(start_paused = true)]
async fn full_lifecycle_over_the_wire() {
    let fixture = Fixture::new();
    let cpi = fixture.cpi();

    let stemcell = ok(cpi
        .dispatch(Request::new(
            "create_stemcell",
            vec![
                json!("/tmp/image"),
                json!({"name": "bosh-aws", "ami": {"us-east-1": fixture.image.to_string()}}),
            ],
        ))
        .await);
    assert_eq!(stemcell, json!(format!("{} light", fixture.image)));

    let networks = fixture.manual_network("10.0.0.10");
    let created = ok(cpi
        .dispatch(
            Request::new(
                "create_vm",
                vec![
                    json!("agent-1"),
                    stemcell.clone(),
                    json!({"instance_type": "m5.large"}),
                    networks.clone(),
                    json!([]),
                    json!({}),
                ],
            )
            .with_api_version(2)
            .with_director_uuid("director-uuid"),
        )
        .await);
    assert_eq!(created[1], networks);
    let vm = created[0].clone();
    assert!(vm.as_str().unwrap().starts_with("i-"));

    assert_eq!(
        ok(cpi.dispatch(Request::new("has_vm", vec![vm.clone()])).await),
        json!(true)
    );

    let disk = ok(cpi
        .dispatch(Request::new(
            "create_disk",
            vec![json!(2048), json!({}), vm.clone()],
        ))
        .await);

    let device = ok(cpi
        .dispatch(Request::new("attach_disk", vec![vm.clone(), disk.clone()]).with_api_version(2))
        .await);
    assert_eq!(device, json!("/dev/sdf"));

    let disks = ok(cpi.dispatch(Request::new("get_disks", vec![vm.clone()])).await);
    assert_eq!(disks.as_array().unwrap().len(), 3);
    assert_eq!(disks[2], disk);

    ok(cpi
        .dispatch(Request::new(
            "set_vm_metadata",
            vec![vm.clone(), json!({"job": "router", "index": 0})],
        ))
        .await);

    let snapshot = ok(cpi
        .dispatch(Request::new(
            "snapshot_disk",
            vec![disk.clone(), json!({"deployment": "cf"})],
        ))
        .await);
    assert!(snapshot.as_str().unwrap().starts_with("snap-"));
    ok(cpi
        .dispatch(Request::new("delete_snapshot", vec![snapshot]))
        .await);

    ok(cpi
        .dispatch(Request::new("resize_disk", vec![disk.clone(), json!(4096)]))
        .await);
    ok(cpi
        .dispatch(Request::new("detach_disk", vec![vm.clone(), disk.clone()]))
        .await);
    ok(cpi
        .dispatch(Request::new("delete_disk", vec![disk.clone()]))
        .await);
    assert_eq!(
        ok(cpi.dispatch(Request::new("has_disk", vec![disk])).await),
        json!(false)
    );

    ok(cpi.dispatch(Request::new("reboot_vm", vec![vm.clone()])).await);
    ok(cpi.dispatch(Request::new("delete_vm", vec![vm.clone()])).await);

    let again = cpi.dispatch(Request::new("delete_vm", vec![vm.clone()])).await;
    let error = again.error.unwrap();
    assert_eq!(error.error_type, ErrorType::VmNotFound);
    assert!(!error.ok_to_retry);
    assert!(again.log.contains("not found"));

    ok(cpi
        .dispatch(Request::new("delete_stemcell", vec![stemcell]))
        .await);
}

#[tokio::test(start_paused = true)]
async fn api_v1_results() {
    let fixture = Fixture::new();
    let cpi = fixture.cpi();

    let vm = ok(cpi
        .dispatch(Request::new(
            "create_vm",
            vec![
                json!("agent-1"),
                json!(format!("{} light", fixture.image)),
                json!({"instance_type": "m5.large"}),
                fixture.dynamic_network(),
                Value::Null,
                Value::Null,
            ],
        ))
        .await);
    assert!(vm.is_string());

    let disk = ok(cpi
        .dispatch(Request::new("create_disk", vec![json!(1024), json!({}), vm.clone()]))
        .await);
    let attached = ok(cpi
        .dispatch(Request::new("attach_disk", vec![vm, disk]))
        .await);
    assert_eq!(attached, Value::Null);
}

#[tokio::test]
async fn response_log_captures_request_events() {
    let fixture = Fixture::new();
    let request: Request = serde_json::from_value(json!({
        "method": "has_disk",
        "arguments": ["vol-00000000000000063"],
        "context": {"director_uuid": "abc", "request_id": "req-42"}
    }))
    .unwrap();

    let response = call(&fixture, request).await;
    assert_eq!(response.result, json!(false));
    assert!(response.log.contains("Handling request"));
    assert!(response.log.contains("has_disk"));

    let wire = serde_json::to_string(&response).unwrap();
    assert!(wire.starts_with(r#"{"result":false,"error":null,"log":"#));
}

#[tokio::test(start_paused = true)]
async fn attach_in_a_fresh_process_without_settings() {
    let fixture = Fixture::new();
    // Each invocation of the binary starts with an empty in-memory registry.
    let fresh = || {
        Cpi::new(
            fixture.config.clone(),
            fixture.cloud.clone(),
            Arc::new(MemoryRegistry::new()),
        )
    };

    let vm = ok(fresh()
        .dispatch(Request::new(
            "create_vm",
            vec![
                json!("agent-1"),
                json!(format!("{} light", fixture.image)),
                json!({"instance_type": "m5.large"}),
                fixture.dynamic_network(),
                json!([]),
                json!({}),
            ],
        ))
        .await);
    let disk = ok(fresh()
        .dispatch(Request::new("create_disk", vec![json!(1024), json!({}), vm.clone()]))
        .await);

    let response = fresh()
        .dispatch(Request::new("attach_disk", vec![vm.clone(), disk.clone()]).with_api_version(2))
        .await;
    assert!(response.log.contains("No registry settings"));
    assert_eq!(ok(response), json!("/dev/sdf"));

    // Retrying is idempotent and still succeeds.
    let again = ok(fresh()
        .dispatch(Request::new("attach_disk", vec![vm, disk]).with_api_version(2))
        .await);
    assert_eq!(again, json!("/dev/sdf"));
}
