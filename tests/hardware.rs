//! Runs against a real device named by `RDMA_DEVICE`, e.g. a soft-RoCE `rxe0`.

use rdma_transfer::{ConnectionContext, ContextConfigBuilder, IbvProvider, QueuePairState};

fn device_name() -> String {
    std::env::var("RDMA_DEVICE").unwrap_or_else(|_| "rxe0".to_owned())
}

#[test]
#[ignore = "needs an RDMA capable host"]
fn open_query_and_close() {
    let config = ContextConfigBuilder::default()
        .device_name(device_name())
        .mr_size(4096)
        .build()
        .unwrap();
    let ctx = ConnectionContext::open(IbvProvider::new(), &config).unwrap();
    assert_eq!(ctx.state(), QueuePairState::Reset);
    let local = ctx.local_parameters();
    assert_ne!(local.qp_num(), 0);
    assert!(!local.gid().is_zero());
    assert!(ctx.device_attr().max_cqe > 0);
    ctx.close().unwrap();
}

#[test]
#[ignore = "needs an RDMA capable host"]
fn loopback_connect_reaches_rts() {
    let config = ContextConfigBuilder::default()
        .device_name(device_name())
        .mr_size(4096)
        .build()
        .unwrap();
    let mut a = ConnectionContext::open(IbvProvider::new(), &config).unwrap();
    let mut b = ConnectionContext::open(IbvProvider::new(), &config).unwrap();
    let (pa, pb) = (a.local_parameters(), b.local_parameters());
    a.connect(&pb).unwrap();
    b.connect(&pa).unwrap();
    assert_eq!(a.state(), QueuePairState::ReadyToSend);
    assert_eq!(b.state(), QueuePairState::ReadyToSend);
    a.close().unwrap();
    b.close().unwrap();
}
