//! The completion-driven transfer protocol.
//!
//! Everything after the queue pair reaches RTS happens here, on the caller's thread, by busy
//! polling the single completion queue. Control signals and data share that queue and are told
//! apart by opcode, work request tag and immediate data.

use std::{
    collections::VecDeque,
    fmt,
    fs::File,
    io::{Read, Seek},
    path::Path,
};

use derive_builder::Builder;
use getset::CopyGetters;
use tracing::{debug, error, info, trace, warn};

use crate::{
    buffer_pool::{SlotPool, SlotUse},
    chunk::ChunkPlan,
    completion::{CompletionRecord, WcOpcode},
    context::ConnectionContext,
    error::{Error, Result},
    message::{ControlKind, ImmMessage, WorkRequestTag},
    peer_set::PeerSet,
    provider::Provider,
    queue_pair::QueuePairState,
    work_request::{RecvRequest, SendRequest},
};

/// Receives the responder waits for before it signals stop
pub const TOT_NUM_OPS: usize = 1;
/// Completions taken per poll
pub const DEFAULT_POLL_BATCH: usize = 10;
/// Upper bound of completions taken per poll
pub const MAX_POLL_BATCH: usize = 4096;
/// Slots the registered region is split into
pub const DEFAULT_SLOT_COUNT: u32 = 16;
/// Received bytes shown in debug logs
const PREVIEW_LEN: usize = 64;

/// Engine tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct EngineConfig {
    /// Number of peers expected to signal
    #[builder(default = "1")]
    peer_num: u16,
    /// Slots the registered region is split into
    #[builder(default = "DEFAULT_SLOT_COUNT")]
    slot_count: u32,
    /// Completions taken per poll
    #[builder(default = "DEFAULT_POLL_BATCH")]
    poll_batch: usize,
}

impl Default for EngineConfig {
    #[inline]
    fn default() -> Self {
        Self {
            peer_num: 1,
            slot_count: DEFAULT_SLOT_COUNT,
            poll_batch: DEFAULT_POLL_BATCH,
        }
    }
}

/// A consumed completion, after its slot was released and receives were replenished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A message arrived
    Received {
        /// Decoded immediate data, `None` for a plain send
        message: Option<ImmMessage>,
        /// Payload bytes
        len: u32,
    },
    /// One of our sends finished
    Sent(WorkRequestTag),
}

/// Counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct TransferStats {
    /// Successful receives consumed
    received: u64,
    /// Chunks posted
    chunks_sent: u64,
    /// Payload bytes posted
    bytes_sent: u64,
}

/// Bytes of a received payload worth showing, never past the slot
fn preview_len(byte_len: u32, slot_len: usize) -> usize {
    usize::try_from(byte_len)
        .unwrap_or(usize::MAX)
        .min(PREVIEW_LEN)
        .min(slot_len)
}

/// Drives one connected queue pair through the start/transfer/stop protocol
pub struct TransferEngine<'ctx, P: Provider> {
    /// The connected resources
    ctx: &'ctx mut ConnectionContext<P>,
    /// Tunables
    config: EngineConfig,
    /// Slots of the registered region
    pool: SlotPool,
    /// Checked completions not consumed yet, oldest first
    backlog: VecDeque<CompletionRecord>,
    /// Landing area of one poll
    batch: Vec<CompletionRecord>,
    /// Peers whose start signal arrived
    starts: PeerSet,
    /// Peers whose stop signal arrived
    stops_received: PeerSet,
    /// Peers whose stop send completed
    stops_acked: PeerSet,
    /// Counters
    stats: TransferStats,
}

impl<P: Provider> fmt::Debug for TransferEngine<'_, P> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .field("backlog", &self.backlog.len())
            .field("starts", &self.starts.len())
            .field("stops_received", &self.stops_received.len())
            .field("stops_acked", &self.stops_acked.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'ctx, P: Provider> TransferEngine<'ctx, P> {
    /// Take over a context whose queue pair is in RTS
    #[inline]
    pub fn new(ctx: &'ctx mut ConnectionContext<P>, config: EngineConfig) -> Result<Self> {
        if ctx.state() != QueuePairState::ReadyToSend {
            return Err(Error::Protocol(format!(
                "queue pair is {:?}, the transfer needs it ready to send",
                ctx.state()
            )));
        }
        if config.peer_num == 0 {
            return Err(Error::Config("at least one peer is required".to_owned()));
        }
        if config.poll_batch == 0 || config.poll_batch > MAX_POLL_BATCH {
            return Err(Error::Config(format!(
                "poll batch {} is outside 1..={MAX_POLL_BATCH}",
                config.poll_batch
            )));
        }
        let headroom = u32::from(config.peer_num).saturating_mul(2);
        if config.slot_count <= headroom {
            return Err(Error::Config(format!(
                "{} slots leave nothing for sends next to {headroom} posted receives",
                config.slot_count
            )));
        }
        let pool = SlotPool::new(ctx.mr_len(), config.slot_count)?;
        debug!(
            "{} slots of {} bytes for {} peer(s)",
            pool.capacity(),
            pool.slot_size(),
            config.peer_num
        );
        Ok(Self {
            ctx,
            config,
            pool,
            backlog: VecDeque::new(),
            batch: Vec::with_capacity(config.poll_batch),
            starts: PeerSet::new(config.peer_num),
            stops_received: PeerSet::new(config.peer_num),
            stops_acked: PeerSet::new(config.peer_num),
            stats: TransferStats::default(),
        })
    }

    /// Post one free slot as a receive buffer
    fn post_recv_slot(&mut self) -> Result<()> {
        let slot = self
            .pool
            .acquire(SlotUse::Recv)
            .ok_or_else(|| Error::Protocol("no free slot left for a receive".to_owned()))?;
        let sge = self.ctx.sge(self.pool.range(slot))?;
        self.ctx.post_recv(&RecvRequest {
            wr_id: WorkRequestTag::Slot(slot).into(),
            sge,
        })
    }

    /// Post `2 × peer_num` receive buffers
    #[inline]
    pub fn pre_post_receives(&mut self) -> Result<()> {
        let count = u32::from(self.config.peer_num).saturating_mul(2);
        for _ in 0..count {
            self.post_recv_slot()?;
        }
        debug!("pre-posted {} receives", count);
        Ok(())
    }

    /// Send a payload-less control signal to every peer
    fn signal_all(&mut self, kind: ControlKind) -> Result<()> {
        for peer in 0..self.config.peer_num {
            let tag = match kind {
                ControlKind::Start => WorkRequestTag::Start(peer),
                ControlKind::Stop => WorkRequestTag::Stop(peer),
            };
            let imm = ImmMessage::Control { kind, peer }.encode()?;
            self.ctx.post_send(&SendRequest::signal(tag.into(), imm))?;
        }
        Ok(())
    }

    /// Poll once into the backlog. A failed completion anywhere in the batch fails the poll.
    fn fill_backlog(&mut self) -> Result<()> {
        self.batch.clear();
        let polled = self.ctx.poll(self.config.poll_batch, &mut self.batch)?;
        if polled == 0 {
            std::hint::spin_loop();
            return Ok(());
        }
        for record in &self.batch {
            if let Err(err) = record.check() {
                error!("{}", err);
                return Err(err.into());
            }
        }
        self.backlog.extend(self.batch.drain(..));
        Ok(())
    }

    /// The oldest checked completion, spinning until there is one
    fn next_completion(&mut self) -> Result<CompletionRecord> {
        loop {
            if let Some(record) = self.backlog.pop_front() {
                return Ok(record);
            }
            self.fill_backlog()?;
        }
    }

    /// Consume one completion
    #[inline]
    pub fn next_event(&mut self) -> Result<Event> {
        let record = self.next_completion()?;
        self.dispatch(&record)
    }

    /// Bookkeeping shared by every loop: slots, receive headroom and signals
    fn dispatch(&mut self, record: &CompletionRecord) -> Result<Event> {
        match record.opcode {
            WcOpcode::Recv => {
                let Some(WorkRequestTag::Slot(slot)) = record.wr_id.tag() else {
                    return Err(Error::Protocol(format!(
                        "receive completed on non-slot wr_id {}",
                        record.wr_id
                    )));
                };
                let message = record.imm.map(ImmMessage::decode).transpose()?;
                self.log_payload(slot, record.byte_len, message);
                let _usage = self.pool.release(slot)?;
                self.post_recv_slot()?;
                self.stats.received = self.stats.received.saturating_add(1);
                if let Some(ImmMessage::Control { kind, peer }) = message {
                    match kind {
                        ControlKind::Start => {
                            let _admission = self.starts.insert(peer)?;
                        }
                        ControlKind::Stop => {
                            let _admission = self.stops_received.insert(peer)?;
                        }
                    }
                }
                Ok(Event::Received {
                    message,
                    len: record.byte_len,
                })
            }
            WcOpcode::Send => {
                let tag = record.wr_id.tag().ok_or_else(|| {
                    Error::Protocol(format!("send completed on unknown wr_id {}", record.wr_id))
                })?;
                match tag {
                    WorkRequestTag::Slot(slot) => {
                        if self.pool.release(slot)? != SlotUse::Send {
                            return Err(Error::Protocol(format!(
                                "send completed on receive slot {slot}"
                            )));
                        }
                        trace!("chunk in slot {} sent", slot);
                    }
                    WorkRequestTag::Start(peer) => debug!("start signal to peer {} sent", peer),
                    WorkRequestTag::Stop(peer) => {
                        debug!("stop signal to peer {} sent", peer);
                        let _admission = self.stops_acked.insert(peer)?;
                    }
                }
                Ok(Event::Sent(tag))
            }
            WcOpcode::Other(raw) => Err(Error::Protocol(format!(
                "unexpected completion opcode {raw} for wr_id {}",
                record.wr_id
            ))),
        }
    }

    /// Debug-log the start of a received payload
    fn log_payload(&self, slot: u32, len: u32, message: Option<ImmMessage>) {
        let range = self.pool.range(slot);
        let shown = preview_len(len, range.len());
        let bytes = self.ctx.buffer(range.start..range.start.saturating_add(shown));
        debug!(
            "received {} bytes, imm {:?}: {:?}",
            len,
            message,
            String::from_utf8_lossy(bytes)
        );
    }

    /// Responder loop A: returns once `TOT_NUM_OPS` receives succeeded
    #[inline]
    pub fn await_receives(&mut self) -> Result<usize> {
        let mut ops = 0_usize;
        while ops < TOT_NUM_OPS {
            if let Event::Received { .. } = self.next_event()? {
                ops = ops.saturating_add(1);
            }
        }
        info!("received {} message(s)", ops);
        Ok(ops)
    }

    /// Send the rendezvous signal to every peer
    #[inline]
    pub fn post_start_signals(&mut self) -> Result<()> {
        self.signal_all(ControlKind::Start)
    }

    /// Send the termination signal to every peer, tagged with the stop sentinel
    #[inline]
    pub fn post_stop_signals(&mut self) -> Result<()> {
        self.signal_all(ControlKind::Stop)
    }

    /// Responder loop B: returns once every peer's stop send completed
    #[inline]
    pub fn await_stop_acks(&mut self) -> Result<()> {
        while !self.stops_acked.is_complete() {
            let _event = self.next_event()?;
        }
        info!("stop delivered to all {} peer(s)", self.config.peer_num);
        Ok(())
    }

    /// Initiator: returns once every peer's start signal arrived
    #[inline]
    pub fn await_start_signals(&mut self) -> Result<()> {
        while !self.starts.is_complete() {
            match self.next_event()? {
                Event::Received {
                    message: Some(ImmMessage::Control { .. }),
                    ..
                }
                | Event::Sent(_) => {}
                Event::Received { message, len } => {
                    warn!("{} bytes with imm {:?} before the start signal", len, message);
                }
            }
        }
        info!("all {} peer(s) ready", self.config.peer_num);
        Ok(())
    }

    /// Initiator: returns once every peer's stop signal arrived
    #[inline]
    pub fn await_stop_signals(&mut self) -> Result<()> {
        while !self.stops_received.is_complete() {
            let _event = self.next_event()?;
        }
        info!("all {} peer(s) signalled stop", self.config.peer_num);
        Ok(())
    }

    /// A free send slot, draining completions until one comes back
    fn acquire_send_slot(&mut self) -> Result<u32> {
        loop {
            if let Some(slot) = self.pool.acquire(SlotUse::Send) {
                return Ok(slot);
            }
            let _event = self.next_event()?;
        }
    }

    /// Send the whole file to every peer, one slot-sized chunk per send.
    ///
    /// Every peer shares the one queue pair, the file is rewound per peer and chunk
    /// numbering restarts at zero.
    #[inline]
    pub fn send_file(&mut self, path: &Path) -> Result<()> {
        let io_err = |source| Error::Io {
            path: path.to_owned(),
            source,
        };
        let mut file = File::open(path).map_err(io_err)?;
        let file_size = file.metadata().map_err(io_err)?.len();
        let plan = ChunkPlan::new(file_size, self.pool.slot_size())?;
        info!(
            "sending {} ({} bytes) as {} chunk(s) to {} peer(s)",
            path.display(),
            file_size,
            plan.count(),
            self.config.peer_num
        );
        for peer in 0..self.config.peer_num {
            file.rewind().map_err(io_err)?;
            for index in 0..plan.count() {
                let len = plan.len(index);
                let seq = u32::try_from(index).map_err(|_| {
                    Error::Protocol(format!("chunk {index} overflows the sequence number"))
                })?;
                let imm = ImmMessage::Chunk { seq }.encode()?;
                let slot = self.acquire_send_slot()?;
                let start = self.pool.range(slot).start;
                let range = start..start.saturating_add(usize::try_from(len).unwrap_or(0));
                let dest = self.ctx.buffer_mut(range.clone());
                file.read_exact(dest).map_err(io_err)?;
                let sge = self.ctx.sge(range)?;
                self.ctx.post_send(&SendRequest::with_payload(
                    WorkRequestTag::Slot(slot).into(),
                    sge,
                    imm,
                ))?;
                self.stats.chunks_sent = self.stats.chunks_sent.saturating_add(1);
                self.stats.bytes_sent = self.stats.bytes_sent.saturating_add(len);
                trace!("posted chunk {} ({} bytes) for peer {}", seq, len, peer);
            }
        }
        Ok(())
    }

    /// Listener side: rendezvous, wait for data, then run the stop barrier
    #[inline]
    pub fn run_responder(&mut self) -> Result<TransferStats> {
        self.pre_post_receives()?;
        self.post_start_signals()?;
        let _ops = self.await_receives()?;
        self.post_stop_signals()?;
        self.await_stop_acks()?;
        Ok(self.stats)
    }

    /// Client side: wait for the rendezvous, send `path`, then wait for every stop
    #[inline]
    pub fn run_initiator(&mut self, path: &Path) -> Result<TransferStats> {
        self.pre_post_receives()?;
        self.await_start_signals()?;
        self.send_file(path)?;
        self.await_stop_signals()?;
        Ok(self.stats)
    }

    /// Checked completions polled but not consumed yet
    #[inline]
    #[must_use]
    pub fn pending_completions(&self) -> usize {
        self.backlog.len()
    }

    /// Counters so far
    #[inline]
    #[must_use]
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Slot bookkeeping
    #[inline]
    #[must_use]
    pub fn slots(&self) -> &SlotPool {
        &self.pool
    }

    /// Peers whose start signal arrived
    #[inline]
    #[must_use]
    pub fn starts(&self) -> &PeerSet {
        &self.starts
    }

    /// Peers whose stop signal arrived
    #[inline]
    #[must_use]
    pub fn stops_received(&self) -> &PeerSet {
        &self.stops_received
    }

    /// Peers whose stop send completed
    #[inline]
    #[must_use]
    pub fn stops_acked(&self) -> &PeerSet {
        &self.stops_acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_capped() {
        assert_eq!(preview_len(4, 4096), 4);
        assert_eq!(preview_len(64, 4096), 64);
        assert_eq!(preview_len(65, 4096), PREVIEW_LEN);
        assert_eq!(preview_len(u32::MAX, 1 << 20), PREVIEW_LEN);
        // a slot shorter than the cap bounds it instead
        assert_eq!(preview_len(1000, 16), 16);
        assert_eq!(preview_len(0, 16), 0);
    }
}
