use crate::{
    access::{qp_access, AccessFlag},
    error::Transition,
    gid::Gid,
};
use derive_builder::Builder;
use enumflags2::BitFlags;
use getset::CopyGetters;
use rdma_sys::ibv_mtu;
use serde::{Deserialize, Serialize};

/// Default `port_num`
pub(crate) static DEFAULT_PORT_NUM: u8 = 1;
/// Default `gid_index`
pub(crate) static DEFAULT_GID_INDEX: u8 = 1;
/// Default `pkey_index`
pub(crate) static DEFAULT_PKEY_INDEX: u16 = 0;

/// Default `flow_label`
pub(crate) static DEFAULT_FLOW_LABEL: u32 = 0;
/// Default `hop_limit`, keeps packets inside the local subnet
pub(crate) static DEFAULT_HOP_LIMIT: u8 = 1;
/// Default `traffic_class`
pub(crate) static DEFAULT_TRAFFIC_CLASS: u8 = 0;

/// Default `service_level`
pub(crate) static DEFAULT_SERVICE_LEVEL: u8 = 0;
/// Default `src_path_bits`
pub(crate) static DEFAULT_SRC_PATH_BITS: u8 = 0;
/// Default `static_rate`
pub(crate) static DEFAULT_STATIC_RATE: u8 = 0;
/// Default `is_global`
pub(crate) static DEFAULT_IS_GLOBAL: u8 = 1;

/// Default `rq_psn`
pub(crate) static DEFAULT_RQ_PSN: u32 = 0;
/// Default `max_dest_rd_atomic`
pub(crate) static DEFAULT_MAX_DEST_RD_ATOMIC: u8 = 1;
/// Default `min_rnr_timer`, 0.64 milliseconds
pub(crate) static DEFAULT_MIN_RNR_TIMER: u8 = 12;
/// Default `mtu`
pub(crate) static DEFAULT_MTU: MTU = MTU::MTU4096;

/// Default `timeout`
pub(crate) static DEFAULT_TIMEOUT: u8 = 14;
/// Default `retry_cnt`
pub(crate) static DEFAULT_RETRY_CNT: u8 = 7;
/// Default `rnr_retry`, 7 means retry forever
pub(crate) static DEFAULT_RNR_RETRY: u8 = 7;
/// Default `sq_psn`
pub(crate) static DEFAULT_SQ_PSN: u32 = 0;
/// Default `max_rd_atomic`
pub(crate) static DEFAULT_MAX_RD_ATOMIC: u8 = 1;

/// Queue pair information exchanged out of band before INIT->RTR
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ConnectionParameters {
    /// queue pair number
    qp_num: u32,
    /// lid
    lid: u16,
    /// device gid
    gid: Gid,
}

impl ConnectionParameters {
    /// Bundle the identifiers of one endpoint
    #[inline]
    #[must_use]
    pub fn new(qp_num: u32, lid: u16, gid: Gid) -> Self {
        Self { qp_num, lid, gid }
    }

    /// Explains why these parameters cannot address a remote queue pair yet.
    ///
    /// The LID is not checked: RoCE ports report zero and route on the GID.
    #[inline]
    #[must_use]
    pub fn missing(&self) -> Option<&'static str> {
        if self.gid.is_zero() {
            Some("remote GID is unknown")
        } else if self.qp_num == 0 {
            Some("remote queue pair number is unknown")
        } else {
            None
        }
    }
}

/// Capacity requested when creating the queue pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    /// Outstanding send requests
    pub max_send_wr: u32,
    /// Outstanding receive requests, unused with an SRQ but kept for the provider
    pub max_recv_wr: u32,
    /// Scatter/gather entries per send
    pub max_send_sge: u32,
    /// Scatter/gather entries per receive
    pub max_recv_sge: u32,
}

impl QpCaps {
    /// Single-SGE capacity with `depth` outstanding requests per queue
    #[inline]
    #[must_use]
    pub fn single_sge(depth: u32) -> Self {
        Self {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// Attributes of RESET->INIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct InitAttr {
    /// The local physical port
    #[builder(default = "DEFAULT_PORT_NUM")]
    port_num: u8,
    /// Index into the partition key table
    #[builder(default = "DEFAULT_PKEY_INDEX")]
    pkey_index: u16,
    /// Remote operations the queue pair accepts
    #[builder(default = "qp_access()")]
    access: BitFlags<AccessFlag>,
}

/// Gloabel route information about remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct GlobalRouteHeader {
    /// The GID that is used to identify the destination port of the packets
    dgid: Gid,
    /// 20 bits flow hint for switches with multiple outbound paths
    #[builder(default = "DEFAULT_FLOW_LABEL")]
    flow_label: u32,
    /// An index in the port's GID table that will be used to identify the originator of the packet
    #[builder(default = "DEFAULT_GID_INDEX")]
    sgid_index: u8,
    /// The number of hops the packet may take before being discarded. 0 or 1 keeps it in the
    /// local subnet.
    #[builder(default = "DEFAULT_HOP_LIMIT")]
    hop_limit: u8,
    /// Delivery priority requested from routers
    #[builder(default = "DEFAULT_TRAFFIC_CLASS")]
    traffic_class: u8,
}

/// All of the necessary data to reach a remote destination. In connected transport modes the
/// address handler is associated with the queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct AddressHandler {
    /// Global routing header, used because `is_global` is set
    grh: GlobalRouteHeader,
    /// The LID of the remote port
    dest_lid: u16,
    /// 4 bits. The Service Level to be used
    #[builder(default = "DEFAULT_SERVICE_LEVEL")]
    service_level: u8,
    /// Source path bits, 0 means the port's base LID
    #[builder(default = "DEFAULT_SRC_PATH_BITS")]
    src_path_bits: u8,
    /// Rate limit towards the subnet
    #[builder(default = "DEFAULT_STATIC_RATE")]
    static_rate: u8,
    /// Non-zero when `grh` is valid
    #[builder(default = "DEFAULT_IS_GLOBAL")]
    is_global: u8,
    /// The local physical port that the packets will be sent from
    #[builder(default = "DEFAULT_PORT_NUM")]
    port_num: u8,
}

/// The path MTU (Maximum Transfer Unit) i.e. the maximum payload size of a packet that
/// can be transferred in the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MTU {
    /// IBV_MTU_256 - 256 bytes
    MTU256,
    /// IBV_MTU_512 - 512 bytes
    MTU512,
    /// IBV_MTU_1024 - 1024 bytes
    MTU1024,
    /// IBV_MTU_2048 - 2048 bytes
    MTU2048,
    /// IBV_MTU_4096 - 4096 bytes
    MTU4096,
}

impl From<MTU> for u32 {
    #[inline]
    fn from(mtu: MTU) -> Self {
        match mtu {
            MTU::MTU256 => ibv_mtu::IBV_MTU_256,
            MTU::MTU512 => ibv_mtu::IBV_MTU_512,
            MTU::MTU1024 => ibv_mtu::IBV_MTU_1024,
            MTU::MTU2048 => ibv_mtu::IBV_MTU_2048,
            MTU::MTU4096 => ibv_mtu::IBV_MTU_4096,
        }
    }
}

/// Attributes of INIT->RTR
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct RQAttr {
    /// Path MTU
    #[builder(default = "DEFAULT_MTU")]
    mtu: MTU,
    /// Remote destination qp number
    dest_qp_number: u32,
    /// How to reach the remote port
    address_handler: AddressHandler,
    /// A 24 bits value of the Packet Sequence Number of the received packets
    #[builder(default = "DEFAULT_RQ_PSN")]
    rq_psn: u32,
    /// Outstanding RDMA reads and atomics handled as a destination
    #[builder(default = "DEFAULT_MAX_DEST_RD_ATOMIC")]
    max_dest_rd_atomic: u8,
    /// Minimum RNR NAK Timer Field Value, 12 is 0.64 milliseconds
    #[builder(default = "DEFAULT_MIN_RNR_TIMER")]
    min_rnr_timer: u8,
}

impl RQAttr {
    /// Receive-side attributes addressing `remote` through the local `port_num`
    #[inline]
    #[must_use]
    pub fn for_remote(remote: &ConnectionParameters, port_num: u8, sgid_index: u8) -> Self {
        let grh = GlobalRouteHeader {
            dgid: remote.gid(),
            flow_label: DEFAULT_FLOW_LABEL,
            sgid_index,
            hop_limit: DEFAULT_HOP_LIMIT,
            traffic_class: DEFAULT_TRAFFIC_CLASS,
        };
        let address_handler = AddressHandler {
            grh,
            dest_lid: remote.lid(),
            service_level: DEFAULT_SERVICE_LEVEL,
            src_path_bits: DEFAULT_SRC_PATH_BITS,
            static_rate: DEFAULT_STATIC_RATE,
            is_global: DEFAULT_IS_GLOBAL,
            port_num,
        };
        Self {
            mtu: DEFAULT_MTU,
            dest_qp_number: remote.qp_num(),
            address_handler,
            rq_psn: DEFAULT_RQ_PSN,
            max_dest_rd_atomic: DEFAULT_MAX_DEST_RD_ATOMIC,
            min_rnr_timer: DEFAULT_MIN_RNR_TIMER,
        }
    }
}

/// Attributes of RTR->RTS
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct SQAttr {
    /// ACK timeout, `4.096us * 2^timeout`
    #[builder(default = "DEFAULT_TIMEOUT")]
    timeout: u8,
    /// A 3 bits value of the total number of times that the QP will try to resend the packets before
    /// reporting an error because the remote side doesn't answer in the primary path
    #[builder(default = "DEFAULT_RETRY_CNT")]
    retry_cnt: u8,
    /// A 3 bits value of the total number of times that the QP will try to resend the packets when an
    /// RNR NACK was sent by the remote QP before reporting an error. The value 7 is special and specify
    /// to retry infinite times in case of RNR.
    #[builder(default = "DEFAULT_RNR_RETRY")]
    rnr_retry: u8,
    /// A 24 bits value of the Packet Sequence Number of the sent packets for any QP.
    #[builder(default = "DEFAULT_SQ_PSN")]
    sq_psn: u32,
    /// Outstanding RDMA reads and atomics as an initiator
    #[builder(default = "DEFAULT_MAX_RD_ATOMIC")]
    max_rd_atomic: u8,
}

/// One state transition handed to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(variant_size_differences)] // short-lived, never stored in bulk
pub enum QpTransition {
    /// RESET -> INIT
    ToInit(InitAttr),
    /// INIT -> RTR
    ToRtr(RQAttr),
    /// RTR -> RTS
    ToRts(SQAttr),
}

impl QpTransition {
    /// Which transition this is
    #[inline]
    #[must_use]
    pub fn transition(&self) -> Transition {
        match *self {
            Self::ToInit(_) => Transition::ResetToInit,
            Self::ToRtr(_) => Transition::InitToRtr,
            Self::ToRts(_) => Transition::RtrToRts,
        }
    }
}

/// The state of qp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairState {
    /// IBV_QPS_RESET - Reset state
    Reset,
    /// IBV_QPS_INIT - Initialized state
    Init,
    /// IBV_QPS_RTR - Ready To Receive state
    ReadyToRecv,
    /// IBV_QPS_RTS - Ready To Send state
    ReadyToSend,
}

impl QueuePairState {
    /// The only state `transition` may start from
    #[inline]
    #[must_use]
    pub fn source_of(transition: Transition) -> Self {
        match transition {
            Transition::ResetToInit => Self::Reset,
            Transition::InitToRtr => Self::Init,
            Transition::RtrToRts => Self::ReadyToRecv,
        }
    }

    /// The state reached by `transition`
    #[inline]
    #[must_use]
    pub fn target_of(transition: Transition) -> Self {
        match transition {
            Transition::ResetToInit => Self::Init,
            Transition::InitToRtr => Self::ReadyToRecv,
            Transition::RtrToRts => Self::ReadyToSend,
        }
    }
}
