//! Per-attachment URB engine.
//!
//! The engine owns the in-flight map for one claimed device: submits queue
//! asynchronous transfers with the OS backend, unlinks resolve the
//! cancel/complete race, and completions are surfaced as a stream in the
//! order the device finished them (which the protocol permits to differ
//! from submission order across endpoints).
//!
//! Lock discipline: the in-flight map sits behind a plain mutex and is
//! touched only in short critical sections; no await happens while it is
//! held. The OS completion pump never touches the map directly; it pushes
//! raw completions into a channel and [`Completions`] retires map entries
//! as it dequeues them.

use std::{
    collections::HashMap,
    fmt::Display,
    io,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;

use crate::wire::cmd::{Direction, IsoPacket, SubmitCmd, NO_ISO};
use crate::wire::errno;

/// Transfer error reported by the OS backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Transfer was cancelled.
    Cancelled,

    /// Endpoint in a STALL condition.
    Stall,

    /// Device disconnected.
    Disconnected,

    /// Hardware issue or protocol violation.
    Fault,

    /// The request has an invalid argument or is not supported by this OS.
    InvalidArgument,

    /// Unknown or OS-specific error.
    Unknown(u32),
}

impl TransferError {
    /// Errno-style status code carried in `RET_SUBMIT`.
    pub fn usbip_status(self) -> i32 {
        match self {
            TransferError::Cancelled => errno::ECONNRESET,
            TransferError::Stall => errno::EPIPE,
            TransferError::Disconnected => errno::ENODEV,
            TransferError::Fault => errno::EPROTO,
            TransferError::InvalidArgument => errno::EINVAL,
            TransferError::Unknown(_) => errno::EIO,
        }
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Cancelled => write!(f, "transfer was cancelled"),
            TransferError::Stall => write!(f, "endpoint stalled"),
            TransferError::Disconnected => write!(f, "device disconnected"),
            TransferError::Fault => write!(f, "hardware fault or protocol violation"),
            TransferError::InvalidArgument => write!(f, "invalid or unsupported argument"),
            TransferError::Unknown(e) => write!(f, "unknown OS error ({e:#010x})"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<TransferError> for io::Error {
    fn from(value: TransferError) -> Self {
        match value {
            TransferError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, value),
            TransferError::Stall => io::Error::new(io::ErrorKind::ConnectionReset, value),
            TransferError::Disconnected => io::Error::new(io::ErrorKind::ConnectionAborted, value),
            TransferError::InvalidArgument => io::Error::new(io::ErrorKind::InvalidInput, value),
            TransferError::Fault | TransferError::Unknown(_) => io::Error::other(value),
        }
    }
}

/// Why a submit was refused without being queued.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The endpoint's halt feature is set and has not been cleared.
    EndpointHalted,

    /// The seqnum is already in flight; the client broke the protocol.
    DuplicateSeqnum,

    /// The OS refused to queue the transfer.
    Rejected(TransferError),
}

impl SubmitError {
    /// Errno-style status code for the synthesized `RET_SUBMIT`.
    pub fn usbip_status(self) -> i32 {
        match self {
            SubmitError::EndpointHalted => errno::EPIPE,
            SubmitError::DuplicateSeqnum => errno::EINVAL,
            SubmitError::Rejected(e) => e.usbip_status(),
        }
    }
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::EndpointHalted => write!(f, "endpoint is halted"),
            SubmitError::DuplicateSeqnum => write!(f, "seqnum already in flight"),
            SubmitError::Rejected(e) => write!(f, "submit rejected: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Outcome of an unlink request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// The transfer was still pending and has been aborted; its completion
    /// will never be surfaced.
    Cancelled,

    /// The transfer already completed (or an earlier unlink claimed it);
    /// its reply has been or will be sent as `RET_SUBMIT`.
    AlreadyCompleted,

    /// The seqnum was never submitted on this attachment.
    NotFound,
}

/// Transfer type of a URB, derived from the submit header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One transfer, as handed to the OS backend.
#[derive(Clone, Debug)]
pub struct Urb {
    pub seqnum: u32,
    pub direction: Direction,
    pub endpoint: u8,
    pub transfer_type: TransferType,
    /// Setup packet; meaningful for control transfers only.
    pub setup: [u8; 8],
    /// OUT payload. Empty for IN transfers.
    pub data: Vec<u8>,
    /// Requested transfer length (the IN buffer size; equals `data.len()`
    /// for OUT).
    pub buffer_length: u32,
    pub iso_packets: Vec<IsoPacket>,
    pub start_frame: u32,
    pub interval: u32,
    pub flags: u32,
}

impl Urb {
    /// Lift a decoded submit into a URB. The transfer type is not explicit
    /// on the wire: endpoint zero is control, a packet count marks
    /// isochronous, a nonzero interval marks interrupt, anything else is
    /// bulk.
    pub fn from_submit(cmd: SubmitCmd) -> Urb {
        let transfer_type = if cmd.number_of_packets != NO_ISO {
            TransferType::Isochronous
        } else if cmd.header.ep == 0 {
            TransferType::Control
        } else if cmd.interval != 0 {
            TransferType::Interrupt
        } else {
            TransferType::Bulk
        };
        Urb {
            seqnum: cmd.header.seqnum,
            direction: cmd.header.direction,
            endpoint: cmd.header.ep as u8,
            transfer_type,
            setup: cmd.setup,
            buffer_length: cmd.transfer_buffer_length,
            data: cmd.data,
            iso_packets: cmd.iso_packets,
            start_frame: cmd.start_frame,
            interval: cmd.interval,
            flags: cmd.transfer_flags,
        }
    }
}

/// Raw completion pushed by the OS backend's completion pump.
#[derive(Debug)]
pub struct RawCompletion {
    pub seqnum: u32,
    pub status: Result<(), TransferError>,
    /// IN payload read from the device; empty for OUT.
    pub data: Vec<u8>,
    /// Bytes transferred. Equals `data.len()` for IN transfers.
    pub actual_length: u32,
    pub iso_packets: Vec<IsoPacket>,
    pub start_frame: u32,
    pub error_count: u32,
}

/// Sending side of the completion channel, handed to the backend when the
/// device is claimed.
pub type CompletionSink = mpsc::UnboundedSender<RawCompletion>;

/// Receiving side of the completion channel.
pub type RawCompletions = mpsc::UnboundedReceiver<RawCompletion>;

/// Create the completion channel connecting an OS backend to the engine.
pub fn completion_channel() -> (CompletionSink, RawCompletions) {
    mpsc::unbounded_channel()
}

/// Asynchronous transfer interface of a claimed device.
///
/// Contract: every successfully submitted transfer eventually produces
/// exactly one [`RawCompletion`] on the sink, including transfers that
/// were aborted (those complete with [`TransferError::Cancelled`]). A
/// failed `submit` produces nothing.
pub trait DeviceBackend: Send + Sync + 'static {
    /// Queue a transfer with the OS. Must not block.
    fn submit(&self, urb: &Urb) -> Result<(), TransferError>;

    /// Ask the OS to cancel a pending transfer. A no-op if the transfer
    /// already completed.
    fn abort(&self, seqnum: u32);
}

/// A completion ready to be serialized as `RET_SUBMIT`.
#[derive(Debug, Clone)]
pub struct UrbCompletion {
    pub seqnum: u32,
    pub direction: Direction,
    pub ep: u8,
    pub status: i32,
    pub actual_length: u32,
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
    pub start_frame: u32,
    pub error_count: u32,
}

struct Pending {
    direction: Direction,
    ep: u8,
    cancelled: bool,
    /// `(endpoint address, set)` when this is a SET_FEATURE/CLEAR_FEATURE
    /// of ENDPOINT_HALT; applied on successful completion.
    halt_action: Option<(u8, bool)>,
}

#[derive(Default)]
struct EngineState {
    inflight: HashMap<u32, Pending>,
    /// Halted endpoints, one bit per endpoint number, per direction.
    halted_in: u16,
    halted_out: u16,
    /// Submit high-water mark, for telling "already completed" apart from
    /// "never submitted" (wrap-aware; clients allocate seqnums
    /// monotonically).
    high_seqnum: u32,
    seen_any: bool,
}

impl EngineState {
    fn halted_bits(&mut self, direction: Direction) -> &mut u16 {
        match direction {
            Direction::In => &mut self.halted_in,
            Direction::Out => &mut self.halted_out,
        }
    }

    fn is_halted(&self, ep: u8, direction: Direction) -> bool {
        let bits = match direction {
            Direction::In => self.halted_in,
            Direction::Out => self.halted_out,
        };
        bits & (1 << ep) != 0
    }

    fn set_halted(&mut self, ep: u8, direction: Direction, halted: bool) {
        let bits = self.halted_bits(direction);
        if halted {
            *bits |= 1 << ep;
        } else {
            *bits &= !(1 << ep);
        }
    }

    fn set_halted_addr(&mut self, addr: u8, halted: bool) {
        let direction = if addr & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        self.set_halted(addr & 0x0f, direction, halted);
    }

    fn probably_submitted(&self, seqnum: u32) -> bool {
        self.seen_any && self.high_seqnum.wrapping_sub(seqnum) < 0x8000_0000
    }
}

/// Detect SET_FEATURE/CLEAR_FEATURE of ENDPOINT_HALT in a setup packet.
fn halt_action(setup: &[u8; 8]) -> Option<(u8, bool)> {
    const RECIPIENT_ENDPOINT: u8 = 0x02;
    const CLEAR_FEATURE: u8 = 0x01;
    const SET_FEATURE: u8 = 0x03;
    // wValue == 0 selects ENDPOINT_HALT; wIndex low byte is the endpoint
    // address.
    if setup[0] & 0x1f != RECIPIENT_ENDPOINT || setup[2] != 0 || setup[3] != 0 {
        return None;
    }
    match setup[1] {
        CLEAR_FEATURE => Some((setup[4], false)),
        SET_FEATURE => Some((setup[4], true)),
        _ => None,
    }
}

/// The submit/unlink side of an attachment's URB engine. Shared between
/// the session's reader task and the completion stream.
pub struct UrbEngine<B: DeviceBackend> {
    backend: B,
    state: Mutex<EngineState>,
}

/// Build an engine around a freshly claimed backend, returning the shared
/// handle and the completion stream fed from `raw`.
pub fn attach<B: DeviceBackend>(
    backend: B,
    raw: RawCompletions,
) -> (Arc<UrbEngine<B>>, Completions<B>) {
    let engine = Arc::new(UrbEngine {
        backend,
        state: Mutex::new(EngineState::default()),
    });
    let completions = Completions {
        raw,
        engine: engine.clone(),
    };
    (engine, completions)
}

impl<B: DeviceBackend> UrbEngine<B> {
    /// Queue `urb` with the OS. On `Ok`, exactly one completion or unlink
    /// reply will eventually retire the seqnum; on `Err`, the seqnum was
    /// never registered.
    pub fn submit(&self, urb: &Urb) -> Result<(), SubmitError> {
        {
            let mut st = self.state.lock().unwrap();
            if st.is_halted(urb.endpoint, urb.direction) {
                return Err(SubmitError::EndpointHalted);
            }
            if st.inflight.contains_key(&urb.seqnum) {
                return Err(SubmitError::DuplicateSeqnum);
            }
            let pending = Pending {
                direction: urb.direction,
                ep: urb.endpoint,
                cancelled: false,
                halt_action: (urb.transfer_type == TransferType::Control)
                    .then(|| halt_action(&urb.setup))
                    .flatten(),
            };
            st.inflight.insert(urb.seqnum, pending);
            st.high_seqnum = urb.seqnum;
            st.seen_any = true;
        }
        // The map entry exists before the OS sees the transfer, so a
        // completion can never miss it.
        match self.backend.submit(urb) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().unwrap().inflight.remove(&urb.seqnum);
                Err(SubmitError::Rejected(e))
            }
        }
    }

    /// Try to cancel an in-flight URB. If this returns
    /// [`UnlinkOutcome::Cancelled`], no completion for the seqnum will ever
    /// be surfaced, even if the OS reports the transfer as finished.
    pub fn unlink(&self, seqnum: u32) -> UnlinkOutcome {
        let outcome = {
            let mut st = self.state.lock().unwrap();
            match st.inflight.get_mut(&seqnum) {
                Some(p) if !p.cancelled => {
                    p.cancelled = true;
                    UnlinkOutcome::Cancelled
                }
                Some(_) => UnlinkOutcome::AlreadyCompleted,
                None => {
                    if st.probably_submitted(seqnum) {
                        UnlinkOutcome::AlreadyCompleted
                    } else {
                        UnlinkOutcome::NotFound
                    }
                }
            }
        };
        if outcome == UnlinkOutcome::Cancelled {
            self.backend.abort(seqnum);
        }
        outcome
    }

    /// Cancel every in-flight URB, suppressing all their completions. Used
    /// at session teardown.
    pub fn cancel_all(&self) {
        let seqnums: Vec<u32> = {
            let mut st = self.state.lock().unwrap();
            st.inflight
                .iter_mut()
                .map(|(&s, p)| {
                    p.cancelled = true;
                    s
                })
                .collect()
        };
        for seqnum in seqnums {
            self.backend.abort(seqnum);
        }
    }

    /// Number of URBs currently in flight (cancelled ones included until
    /// the OS retires them).
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().inflight.len()
    }
}

/// Stream of completions for the writer task, in the order the OS
/// finished them. Retires in-flight map entries and drops completions of
/// unlinked URBs.
pub struct Completions<B: DeviceBackend> {
    raw: RawCompletions,
    engine: Arc<UrbEngine<B>>,
}

impl<B: DeviceBackend> Completions<B> {
    /// Next completion that should be replied to, or `None` once the
    /// backend is gone and the channel has drained.
    pub async fn next(&mut self) -> Option<UrbCompletion> {
        while let Some(raw) = self.raw.recv().await {
            let mut st = self.engine.state.lock().unwrap();
            let Some(pending) = st.inflight.remove(&raw.seqnum) else {
                log::debug!("dropping completion for unknown seqnum {}", raw.seqnum);
                continue;
            };
            if pending.cancelled {
                continue;
            }
            match raw.status {
                Ok(()) => {
                    if let Some((addr, halted)) = pending.halt_action {
                        st.set_halted_addr(addr, halted);
                    }
                }
                Err(TransferError::Stall) => {
                    st.set_halted(pending.ep, pending.direction, true);
                }
                Err(_) => {}
            }
            drop(st);
            let status = match raw.status {
                Ok(()) => 0,
                Err(e) => e.usbip_status(),
            };
            return Some(UrbCompletion {
                seqnum: raw.seqnum,
                direction: pending.direction,
                ep: pending.ep,
                status,
                actual_length: raw.actual_length,
                data: raw.data,
                iso_packets: raw.iso_packets,
                start_frame: raw.start_frame,
                error_count: raw.error_count,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cmd::CmdHeader;

    /// Backend scripted from the test body: transfers stay pending until
    /// `complete` is called, aborts post a cancelled completion like
    /// overlapped I/O does.
    struct ManualBackend {
        sink: CompletionSink,
        pending: Mutex<HashMap<u32, ()>>,
    }

    impl ManualBackend {
        fn new(sink: CompletionSink) -> ManualBackend {
            ManualBackend {
                sink,
                pending: Mutex::new(HashMap::new()),
            }
        }
    }

    impl DeviceBackend for Arc<ManualBackend> {
        fn submit(&self, urb: &Urb) -> Result<(), TransferError> {
            self.pending.lock().unwrap().insert(urb.seqnum, ());
            Ok(())
        }

        fn abort(&self, seqnum: u32) {
            if self.pending.lock().unwrap().remove(&seqnum).is_some() {
                let _ = self.sink.send(RawCompletion {
                    seqnum,
                    status: Err(TransferError::Cancelled),
                    data: vec![],
                    actual_length: 0,
                    iso_packets: vec![],
                    start_frame: 0,
                    error_count: 0,
                });
            }
        }
    }

    impl ManualBackend {
        fn complete(&self, seqnum: u32, result: Result<Vec<u8>, TransferError>) {
            assert!(self.pending.lock().unwrap().remove(&seqnum).is_some());
            let raw = match result {
                Ok(data) => RawCompletion {
                    seqnum,
                    status: Ok(()),
                    actual_length: data.len() as u32,
                    data,
                    iso_packets: vec![],
                    start_frame: 0,
                    error_count: 0,
                },
                Err(e) => RawCompletion {
                    seqnum,
                    status: Err(e),
                    data: vec![],
                    actual_length: 0,
                    iso_packets: vec![],
                    start_frame: 0,
                    error_count: 0,
                },
            };
            self.sink.send(raw).unwrap();
        }
    }

    fn bulk_in(seqnum: u32, ep: u8) -> Urb {
        Urb {
            seqnum,
            direction: Direction::In,
            endpoint: ep,
            transfer_type: TransferType::Bulk,
            setup: [0; 8],
            data: vec![],
            buffer_length: 64,
            iso_packets: vec![],
            start_frame: 0,
            interval: 0,
            flags: 0,
        }
    }

    fn control(seqnum: u32, setup: [u8; 8], direction: Direction) -> Urb {
        Urb {
            seqnum,
            direction,
            endpoint: 0,
            transfer_type: TransferType::Control,
            setup,
            data: vec![],
            buffer_length: 0,
            iso_packets: vec![],
            start_frame: 0,
            interval: 0,
            flags: 0,
        }
    }

    fn harness() -> (
        Arc<ManualBackend>,
        Arc<UrbEngine<Arc<ManualBackend>>>,
        Completions<Arc<ManualBackend>>,
    ) {
        let (sink, raw) = completion_channel();
        let backend = Arc::new(ManualBackend::new(sink));
        let (engine, completions) = attach(backend.clone(), raw);
        (backend, engine, completions)
    }

    #[tokio::test]
    async fn submit_and_complete() {
        let (backend, engine, mut completions) = harness();
        engine.submit(&bulk_in(1, 1)).unwrap();
        assert_eq!(engine.in_flight(), 1);
        backend.complete(1, Ok(vec![0xaa; 4]));
        let c = completions.next().await.unwrap();
        assert_eq!(c.seqnum, 1);
        assert_eq!(c.status, 0);
        assert_eq!(c.actual_length, 4);
        assert_eq!(c.data, vec![0xaa; 4]);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn unlink_suppresses_completion() {
        let (backend, engine, mut completions) = harness();
        engine.submit(&bulk_in(7, 1)).unwrap();
        assert_eq!(engine.unlink(7), UnlinkOutcome::Cancelled);

        // The aborted transfer's completion must never surface; a later
        // transfer's must.
        engine.submit(&bulk_in(8, 1)).unwrap();
        backend.complete(8, Ok(vec![1]));
        let c = completions.next().await.unwrap();
        assert_eq!(c.seqnum, 8);
    }

    #[tokio::test]
    async fn unlink_after_completion_reports_already_completed() {
        let (backend, engine, mut completions) = harness();
        engine.submit(&bulk_in(3, 2)).unwrap();
        backend.complete(3, Ok(vec![]));
        assert_eq!(completions.next().await.unwrap().seqnum, 3);
        assert_eq!(engine.unlink(3), UnlinkOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn unlink_unknown_seqnum_reports_not_found() {
        let (_backend, engine, _completions) = harness();
        assert_eq!(engine.unlink(42), UnlinkOutcome::NotFound);
        engine.submit(&bulk_in(5, 1)).unwrap();
        assert_eq!(engine.unlink(100), UnlinkOutcome::NotFound);
    }

    #[tokio::test]
    async fn duplicate_seqnum_is_refused() {
        let (_backend, engine, _completions) = harness();
        engine.submit(&bulk_in(1, 1)).unwrap();
        assert_eq!(
            engine.submit(&bulk_in(1, 2)),
            Err(SubmitError::DuplicateSeqnum)
        );
    }

    #[tokio::test]
    async fn stall_halts_endpoint_until_cleared() {
        let (backend, engine, mut completions) = harness();
        engine.submit(&bulk_in(1, 3)).unwrap();
        backend.complete(1, Err(TransferError::Stall));
        let c = completions.next().await.unwrap();
        assert_eq!(c.status, errno::EPIPE);

        assert_eq!(
            engine.submit(&bulk_in(2, 3)),
            Err(SubmitError::EndpointHalted)
        );
        // Same endpoint number, other direction: unaffected.
        let mut out = bulk_in(3, 3);
        out.direction = Direction::Out;
        engine.submit(&out).unwrap();

        // CLEAR_FEATURE(ENDPOINT_HALT) for 0x83 re-opens the endpoint once
        // it completes successfully.
        let clear = control(4, [0x02, 0x01, 0, 0, 0x83, 0, 0, 0], Direction::Out);
        engine.submit(&clear).unwrap();
        backend.complete(4, Ok(vec![]));
        assert_eq!(completions.next().await.unwrap().seqnum, 4);
        engine.submit(&bulk_in(5, 3)).unwrap();
    }

    #[tokio::test]
    async fn set_feature_halts_endpoint() {
        let (backend, engine, mut completions) = harness();
        let set = control(1, [0x02, 0x03, 0, 0, 0x81, 0, 0, 0], Direction::Out);
        engine.submit(&set).unwrap();
        backend.complete(1, Ok(vec![]));
        completions.next().await.unwrap();
        assert_eq!(
            engine.submit(&bulk_in(2, 1)),
            Err(SubmitError::EndpointHalted)
        );
    }

    #[tokio::test]
    async fn cancel_all_suppresses_everything() {
        let (backend, engine, mut completions) = harness();
        for s in 1..=3 {
            engine.submit(&bulk_in(s, 1)).unwrap();
        }
        engine.cancel_all();
        // Entries retire only as the suppressed aborts drain through the
        // stream.
        assert_eq!(engine.in_flight(), 3);

        engine.submit(&bulk_in(9, 2)).unwrap();
        backend.complete(9, Ok(vec![2]));
        let c = completions.next().await.unwrap();
        assert_eq!(c.seqnum, 9);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn completions_preserve_endpoint_order() {
        let (backend, engine, mut completions) = harness();
        for s in 1..=4 {
            engine.submit(&bulk_in(s, 1)).unwrap();
        }
        for s in [2, 4, 1, 3] {
            backend.complete(s, Ok(vec![]));
        }
        let order: Vec<u32> = [
            completions.next().await.unwrap().seqnum,
            completions.next().await.unwrap().seqnum,
            completions.next().await.unwrap().seqnum,
            completions.next().await.unwrap().seqnum,
        ]
        .into();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn urb_type_derivation() {
        let header = |ep, direction| CmdHeader {
            command: crate::wire::cmd::CMD_SUBMIT,
            seqnum: 1,
            devid: 0,
            direction,
            ep,
        };
        let submit = |ep, packets, interval| SubmitCmd {
            header: header(ep, Direction::In),
            transfer_flags: 0,
            transfer_buffer_length: 0,
            start_frame: 0,
            number_of_packets: packets,
            interval,
            setup: [0; 8],
            data: vec![],
            iso_packets: vec![],
        };
        let kind = |ep, packets, interval| Urb::from_submit(submit(ep, packets, interval)).transfer_type;
        assert_eq!(kind(0, NO_ISO, 0), TransferType::Control);
        assert_eq!(kind(2, NO_ISO, 0), TransferType::Bulk);
        assert_eq!(kind(2, NO_ISO, 8), TransferType::Interrupt);
        assert_eq!(kind(2, 0, 0), TransferType::Isochronous);
    }
}
