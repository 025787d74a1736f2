//! Per-connection protocol state machine.
//!
//! A session starts in the operation phase, where the client may request
//! the device list (one-shot) or import a device. A successful import
//! claims the device, switches framing to command mode, and never goes
//! back: from then on the connection carries submits and unlinks inward
//! and replies outward until either side ends it.
//!
//! Command mode runs two tasks: the reader (this module's main loop)
//! decodes frames and drives the URB engine, and a writer task drains the
//! completion stream and the reply queue into the socket. The OS
//! completion pump feeds the engine from below. Teardown runs the same
//! sequence on every exit path: cancel outstanding URBs, retire their
//! completions silently, release the claimed device, and mark the bus id
//! detached.

use std::{io, net::SocketAddr, sync::Arc};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
};

use crate::device::ExportedDevice;
use crate::engine::{attach, completion_channel, Completions, Urb, UrbCompletion, UrbEngine};
use crate::host::DeviceHost;
use crate::registry::ShareRegistry;
use crate::wire::{
    cmd::{
        self, CmdHeader, Command, Reply, SubmitReply, UnlinkCmd, UnlinkReply, CMD_BLOCK_LEN,
        RET_SUBMIT, RET_UNLINK,
    },
    errno,
    op::{self, OpHeader, OP_HEADER_LEN},
    WireError,
};

/// State shared by every session of one server.
pub struct SessionContext<H: DeviceHost> {
    pub host: H,
    pub registry: ShareRegistry,
}

/// One TCP connection's protocol driver.
pub struct Session<H: DeviceHost> {
    ctx: Arc<SessionContext<H>>,
    peer: SocketAddr,
}

impl<H: DeviceHost> Session<H> {
    pub fn new(ctx: Arc<SessionContext<H>>, peer: SocketAddr) -> Session<H> {
        Session { ctx, peer }
    }

    /// Drive the connection to completion. Returns when the client
    /// disconnects, the protocol is violated, or `shutdown` fires.
    pub async fn run<S>(self, mut stream: S, mut shutdown: watch::Receiver<bool>) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut header = [0u8; OP_HEADER_LEN];
        tokio::select! {
            r = stream.read_exact(&mut header) => { r?; }
            _ = shutdown.changed() => return Ok(()),
        }
        let header = OpHeader::parse(&header)?;
        match header.code {
            op::OP_REQ_DEVLIST => self.devlist(stream).await,
            op::OP_REQ_IMPORT => self.import(stream, shutdown).await,
            other => {
                warn!("{}: unexpected operation {other:#06x}", self.peer);
                Err(WireError::UnexpectedCommand(other as u32).into())
            }
        }
    }

    /// Devices that are currently present *and* shared, in enumeration
    /// order.
    fn shared_devices(&self) -> Result<Vec<ExportedDevice>, crate::error::HostError> {
        Ok(self
            .ctx
            .host
            .enumerate()?
            .into_iter()
            .filter(|d| self.ctx.registry.is_shared(&d.bus_id))
            .collect())
    }

    async fn devlist<S>(self, mut stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        // Device list sessions are one-shot: reply, then close.
        let reply = match self.shared_devices() {
            Ok(devices) => {
                debug!("{}: device list, {} shared", self.peer, devices.len());
                op::encode_devlist_reply(&devices)
            }
            Err(e) => {
                warn!("{}: device list enumeration failed: {e}", self.peer);
                let mut out = Vec::new();
                OpHeader::encode(op::OP_REP_DEVLIST, op::ST_NA, &mut out);
                out
            }
        };
        stream.write_all(&reply).await?;
        stream.flush().await
    }

    async fn import<S>(
        self,
        mut stream: S,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut body = [0u8; op::BUS_ID_FIELD_LEN];
        stream.read_exact(&mut body).await?;
        let bus_id = op::parse_import_bus_id(&body)?;

        let device = match self.lookup_importable(&bus_id) {
            Ok(dev) => dev,
            Err(reason) => {
                info!("{}: import of {bus_id} refused: {reason}", self.peer);
                stream.write_all(&op::encode_import_reply(None)).await?;
                return stream.flush().await;
            }
        };

        // The attach mark is taken before the claim so that two clients
        // racing on one bus id are decided here, atomically.
        if let Err(e) = self.ctx.registry.mark_attached(&bus_id, self.peer) {
            info!("{}: import of {bus_id} refused: {e}", self.peer);
            stream.write_all(&op::encode_import_reply(None)).await?;
            return stream.flush().await;
        }

        let (sink, raw) = completion_channel();
        let backend = match self.ctx.host.claim(&device, sink).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("{}: claiming {bus_id} failed: {e}", self.peer);
                self.ctx.registry.mark_detached(&bus_id);
                stream.write_all(&op::encode_import_reply(None)).await?;
                return stream.flush().await;
            }
        };

        info!("{}: attached {bus_id}", self.peer);
        let (engine, completions) = attach(backend, raw);
        let reply_sent = async {
            stream
                .write_all(&op::encode_import_reply(Some(&device)))
                .await?;
            stream.flush().await
        }
        .await;

        // From here every exit goes through the teardown below, so the
        // attach mark and the claim are released even if the client is
        // already gone.
        let result = match reply_sent {
            Ok(()) => {
                self.command_phase(stream, &engine, completions, device.devid(), shutdown)
                    .await
            }
            Err(e) => Err(e),
        };

        // Teardown, on every exit path: cancel what is still in flight
        // (their completions are suppressed as they drain), release the
        // claim, then clear the attach mark. The claimed device is freed
        // by the last engine handle going away.
        engine.cancel_all();
        drop(engine);
        self.ctx.registry.mark_detached(&bus_id);
        info!("{}: detached {bus_id}", self.peer);
        result
    }

    fn lookup_importable(&self, bus_id: &str) -> Result<ExportedDevice, &'static str> {
        if !crate::device::is_valid_bus_id(bus_id) {
            return Err("malformed bus id");
        }
        if !self.ctx.registry.is_shared(bus_id) {
            return Err("not shared");
        }
        let devices = self
            .ctx
            .host
            .enumerate()
            .map_err(|_| "enumeration failed")?;
        devices
            .into_iter()
            .find(|d| d.bus_id == bus_id)
            .ok_or("device not present")
    }

    /// Command-mode reader loop. The writer half of the stream belongs to
    /// the spawned writer task until this returns.
    async fn command_phase<S>(
        &self,
        stream: S,
        engine: &Arc<UrbEngine<H::Backend>>,
        completions: Completions<H::Backend>,
        devid: u32,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut rd, wr) = tokio::io::split(stream);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(wr, completions, reply_rx, devid));

        let result = loop {
            let mut block = [0u8; CMD_BLOCK_LEN];
            let read = tokio::select! {
                r = rd.read_exact(&mut block) => r,
                _ = shutdown.changed() => break Ok(()),
            };
            match read {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => break Err(e),
            }
            let trailer = match cmd::trailer_len(&block) {
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            };
            let mut frame = block.to_vec();
            frame.resize(CMD_BLOCK_LEN + trailer, 0);
            if let Err(e) = rd.read_exact(&mut frame[CMD_BLOCK_LEN..]).await {
                break Err(e);
            }
            let command = match Command::decode(&frame) {
                Ok((command, _)) => command,
                Err(e) => break Err(e.into()),
            };
            match command {
                Command::Submit(sub) => {
                    let header = sub.header;
                    let urb = Urb::from_submit(sub);
                    if let Err(e) = engine.submit(&urb) {
                        debug!("seqnum {}: submit refused: {e}", header.seqnum);
                        // Synthesize the reply here; the URB was never
                        // registered.
                        let send = reply_tx.send(Reply::Submit(SubmitReply {
                            header: CmdHeader {
                                command: RET_SUBMIT,
                                seqnum: header.seqnum,
                                devid,
                                direction: header.direction,
                                ep: header.ep,
                            },
                            status: e.usbip_status(),
                            actual_length: 0,
                            start_frame: 0,
                            number_of_packets: 0,
                            error_count: 0,
                            data: vec![],
                            iso_packets: vec![],
                        }));
                        if send.is_err() {
                            break Ok(());
                        }
                    }
                }
                Command::Unlink(UnlinkCmd {
                    header,
                    unlink_seqnum,
                }) => {
                    let outcome = engine.unlink(unlink_seqnum);
                    debug!("seqnum {unlink_seqnum}: unlink -> {outcome:?}");
                    let status = match outcome {
                        crate::engine::UnlinkOutcome::Cancelled => 0,
                        _ => errno::ECONNRESET,
                    };
                    let send = reply_tx.send(Reply::Unlink(UnlinkReply {
                        header: CmdHeader {
                            command: RET_UNLINK,
                            seqnum: header.seqnum,
                            devid,
                            direction: header.direction,
                            ep: header.ep,
                        },
                        status,
                    }));
                    if send.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        // Closing the reply queue is what stops the writer.
        drop(reply_tx);
        let _ = writer.await;
        result
    }
}

fn completion_reply(completion: UrbCompletion, devid: u32) -> Reply {
    let number_of_packets = completion.iso_packets.len() as u32;
    Reply::Submit(SubmitReply {
        header: CmdHeader {
            command: RET_SUBMIT,
            seqnum: completion.seqnum,
            devid,
            direction: completion.direction,
            ep: completion.ep as u32,
        },
        status: completion.status,
        actual_length: completion.actual_length,
        start_frame: completion.start_frame,
        number_of_packets,
        error_count: completion.error_count,
        // OUT completions echo the byte count only; the payload stays on
        // the host.
        data: completion.data,
        iso_packets: completion.iso_packets,
    })
}

/// Writer task: serializes engine completions (preserving their order)
/// and queued replies onto the socket. Ends once the reader closes the
/// reply queue and the stream, or on a write error.
async fn writer_loop<B, W>(
    mut wr: W,
    mut completions: Completions<B>,
    mut replies: mpsc::UnboundedReceiver<Reply>,
    devid: u32,
) -> io::Result<()>
where
    B: crate::engine::DeviceBackend,
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let reply = tokio::select! {
            r = replies.recv() => match r {
                Some(reply) => reply,
                None => return Ok(()),
            },
            c = completions.next() => match c {
                Some(completion) => completion_reply(completion, devid),
                None => return Ok(()),
            },
        };
        buf.clear();
        reply.encode(&mut buf);
        wr.write_all(&buf).await?;
        wr.flush().await?;
    }
}
