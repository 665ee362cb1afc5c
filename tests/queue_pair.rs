mod test_utilities;
use rdma_transfer::{
    qp_access, ConnectionContext, ConnectionParameters, Error, Gid, QpTransition, QueuePairState,
    Transition, MTU,
};
use test_utilities::{mock_config, remote_parameters, MockProvider};

fn open(mock: &MockProvider) -> ConnectionContext<MockProvider> {
    ConnectionContext::open(mock.clone(), &mock_config(256)).unwrap()
}

#[test]
fn connect_walks_reset_init_rtr_rts() {
    let mock = MockProvider::new();
    let mut ctx = open(&mock);
    let remote = remote_parameters();
    ctx.connect(&remote).unwrap();
    assert_eq!(ctx.state(), QueuePairState::ReadyToSend);

    let transitions = mock.transitions();
    assert_eq!(transitions.len(), 3);
    match transitions[0] {
        QpTransition::ToInit(attr) => {
            assert_eq!(attr.port_num(), 1);
            assert_eq!(attr.pkey_index(), 0);
            assert_eq!(attr.access(), qp_access());
        }
        other => panic!("expected INIT first, got {other:?}"),
    }
    match transitions[1] {
        QpTransition::ToRtr(attr) => {
            assert_eq!(attr.dest_qp_number(), remote.qp_num());
            assert_eq!(attr.mtu(), MTU::MTU4096);
            assert_eq!(attr.min_rnr_timer(), 12);
            assert_eq!(attr.max_dest_rd_atomic(), 1);
            let ah = attr.address_handler();
            assert_eq!(ah.dest_lid(), remote.lid());
            assert_eq!(ah.is_global(), 1);
            assert_eq!(ah.grh().dgid(), remote.gid());
            assert_eq!(ah.grh().sgid_index(), 1);
            assert_eq!(ah.grh().hop_limit(), 1);
        }
        other => panic!("expected RTR second, got {other:?}"),
    }
    match transitions[2] {
        QpTransition::ToRts(attr) => {
            assert_eq!(attr.timeout(), 14);
            assert_eq!(attr.retry_cnt(), 7);
            assert_eq!(attr.rnr_retry(), 7);
            assert_eq!(attr.sq_psn(), 0);
            assert_eq!(attr.max_rd_atomic(), 1);
        }
        other => panic!("expected RTS last, got {other:?}"),
    }
}

#[test]
fn rtr_needs_a_remote_gid() {
    let mock = MockProvider::new();
    let mut ctx = open(&mock);
    ctx.modify_to_init().unwrap();
    let unknown = ConnectionParameters::new(0x22, 0, Gid::default());
    let err = ctx.modify_to_rtr(&unknown).unwrap_err();
    assert!(matches!(
        err,
        Error::TransitionRejected {
            transition: Transition::InitToRtr,
            ..
        }
    ));
    assert_eq!(ctx.state(), QueuePairState::Init);
    assert_eq!(mock.transitions().len(), 1);
}

#[test]
fn rtr_needs_a_remote_qp_number() {
    let mock = MockProvider::new();
    let mut ctx = open(&mock);
    ctx.modify_to_init().unwrap();
    let unknown = ConnectionParameters::new(0, 0, Gid::from_raw([1; 16]));
    assert!(ctx.modify_to_rtr(&unknown).is_err());
    assert_eq!(ctx.state(), QueuePairState::Init);
}

#[test]
fn transitions_cannot_skip_ahead() {
    let mock = MockProvider::new();
    let mut ctx = open(&mock);
    let err = ctx.modify_to_rts().unwrap_err();
    assert!(matches!(
        err,
        Error::TransitionRejected {
            transition: Transition::RtrToRts,
            ..
        }
    ));
    let err = ctx.modify_to_rtr(&remote_parameters()).unwrap_err();
    assert!(matches!(err, Error::TransitionRejected { .. }));
    assert_eq!(ctx.state(), QueuePairState::Reset);
    assert!(mock.transitions().is_empty());

    ctx.modify_to_init().unwrap();
    assert!(ctx.modify_to_init().is_err());
    assert_eq!(ctx.state(), QueuePairState::Init);
}

#[test]
fn failed_transition_is_named() {
    let mock = MockProvider::new();
    let mut ctx = open(&mock);
    mock.fail_on("modify_to_rtr");
    let err = ctx.connect(&remote_parameters()).unwrap_err();
    assert!(matches!(
        err,
        Error::QpTransition {
            transition: Transition::InitToRtr,
            ..
        }
    ));
    assert!(err.to_string().contains("INIT->RTR"));
    assert_eq!(ctx.state(), QueuePairState::Init);
}

#[test]
fn roce_lid_zero_is_accepted() {
    let mock = MockProvider::new();
    let mut ctx = open(&mock);
    let remote = ConnectionParameters::new(7, 0, Gid::from_raw([0xfe; 16]));
    ctx.connect(&remote).unwrap();
    assert_eq!(ctx.state(), QueuePairState::ReadyToSend);
}
