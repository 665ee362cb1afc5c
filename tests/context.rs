mod test_utilities;
use rdma_transfer::{ConnectionContext, DeviceAttr, Error, QueuePairState, Resource};
use test_utilities::{mock_config, MockProvider, MOCK_GID, MOCK_QP_NUM};

const SETUP: [&str; 9] = [
    "open_device",
    "alloc_pd",
    "query_port",
    "query_gid",
    "reg_mr",
    "query_device",
    "create_cq",
    "create_srq",
    "create_qp",
];

const TEARDOWN: [&str; 6] = [
    "destroy_qp",
    "destroy_srq",
    "destroy_cq",
    "dereg_mr",
    "dealloc_pd",
    "close_device",
];

#[test]
fn open_then_close_leaks_nothing() {
    let mock = MockProvider::new();
    let ctx = ConnectionContext::open(mock.clone(), &mock_config(1024)).unwrap();
    assert_eq!(mock.calls(), SETUP);
    assert_eq!(mock.live_handles(), 6);
    assert_eq!(ctx.state(), QueuePairState::Reset);
    assert_eq!(ctx.mr_len(), 1024);

    let local = ctx.local_parameters();
    assert_eq!(local.qp_num(), MOCK_QP_NUM);
    assert_eq!(local.gid().as_raw(), &MOCK_GID);

    ctx.close().unwrap();
    assert_eq!(mock.live_handles(), 0);
    assert_eq!(mock.calls()[SETUP.len()..], TEARDOWN);
}

#[test]
fn drop_releases_like_close() {
    let mock = MockProvider::new();
    drop(ConnectionContext::open(mock.clone(), &mock_config(64)).unwrap());
    assert_eq!(mock.live_handles(), 0);
    assert_eq!(mock.calls()[SETUP.len()..], TEARDOWN);
}

#[test]
fn failed_step_releases_what_exists() {
    let mock = MockProvider::new();
    mock.fail_on("create_srq");
    let err = ConnectionContext::open(mock.clone(), &mock_config(64)).unwrap_err();
    assert!(matches!(
        err,
        Error::ResourceSetup {
            resource: Resource::SharedReceiveQueue,
            ..
        }
    ));
    assert_eq!(mock.live_handles(), 0);
    assert_eq!(
        mock.calls()[SETUP.len() - 1..],
        ["destroy_cq", "dereg_mr", "dealloc_pd", "close_device"]
    );
}

#[test]
fn failed_query_names_the_step() {
    let mock = MockProvider::new();
    mock.fail_on("query_gid");
    let err = ConnectionContext::open(mock.clone(), &mock_config(64)).unwrap_err();
    assert!(matches!(err, Error::Device { step: "query gid", .. }));
    assert_eq!(mock.live_handles(), 0);
    assert!(!mock.calls().contains(&"reg_mr"));
}

#[test]
fn unknown_device() {
    let mock = MockProvider::new();
    let config = rdma_transfer::ContextConfigBuilder::default()
        .device_name("mlx5_9")
        .mr_size(64)
        .build()
        .unwrap();
    let err = ConnectionContext::open(mock.clone(), &config).unwrap_err();
    match err {
        Error::DeviceNotFound(name) => assert_eq!(name, "mlx5_9"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(mock.calls(), ["open_device"]);
    assert_eq!(mock.live_handles(), 0);
}

#[test]
fn teardown_continues_past_failures() {
    let mock = MockProvider::new();
    let ctx = ConnectionContext::open(mock.clone(), &mock_config(64)).unwrap();
    mock.fail_on("destroy_cq");
    match ctx.close().unwrap_err() {
        Error::Teardown(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].resource, Resource::CompletionQueue);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(mock.calls()[SETUP.len()..], TEARDOWN);
    // only the completion queue is left behind
    assert_eq!(mock.live_handles(), 1);
}

#[test]
fn depths_are_clamped_to_the_device() {
    let mock = MockProvider::new();
    mock.set_device_attr(DeviceAttr {
        max_cqe: 64,
        max_srq_wr: 32,
        max_qp_wr: 16,
    });
    let config = rdma_transfer::ContextConfigBuilder::default()
        .device_name(test_utilities::MOCK_DEVICE)
        .mr_size(64)
        .qp_depth(Some(1 << 20))
        .build()
        .unwrap();
    let ctx = ConnectionContext::open(mock.clone(), &config).unwrap();
    let caps = mock.caps().unwrap();
    assert_eq!(caps.max_send_wr, 16);
    assert_eq!(caps.max_send_sge, 1);
    assert_eq!(ctx.device_attr().max_cqe, 64);
    ctx.close().unwrap();
}
