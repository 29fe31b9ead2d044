use crate::backend::{Backend, BackendError, Reader, Writer};
use crate::negotiate::{self, Bounds, Negotiated};
use crate::packet::{ErrorCode, Packet, TransferMode};
use sna::SerialNumber;
use std::time::Duration;

#[derive(Debug, PartialEq)]
pub enum TftpError {
    /// A transfer-initiating packet arrived on a socket that already has a
    /// transfer running.
    TransferAlreadyRunning,

    /// The received packet type cannot be used to initiate a transfer.
    NotInitiatingPacket,
}

/// Why a session stopped. Distinct from the wire `ErrorCode`: a session can
/// terminate for reasons never sent to the peer (a local timeout, external
/// cancellation), and `PeerError`/`OptionsRefused` record what the peer told
/// *us*, which is not the same axis as what we told the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    Ok,
    PeerError { code: ErrorCode, msg: String },
    ProtocolViolation,
    OptionsRefused,
    Timeout,
    TooManyRetries,
    Cancelled,
    IoFailure,
    BackendUnavailable,
}

/// Bounds and retry policy a `TftpServerProto` negotiates and enforces for
/// every transfer it starts.
pub struct ProtoConfig {
    pub bounds: Bounds,
    pub max_retries: u32,
}

#[derive(Debug)]
struct TransferMeta {
    blksize: u16,
    timeout: Duration,
    retries: u32,
    max_retries: u32,
}

/// The TFTP protocol and backend-dispatch implementation, used as the
/// session factory for a TFTP server.
pub struct TftpServerProto<B: Backend> {
    backend: B,
    config: ProtoConfig,
}

#[derive(Debug)]
pub struct Response {
    p: Vec<ResponseItem>,
    advanced: bool,
}

impl Response {
    /// A response to a packet that was accepted but did not move the
    /// session forward: a duplicate ACK or DATA re-sent because the peer
    /// never saw our previous reply.
    fn not_advanced(item: impl Into<ResponseItem>) -> Self {
        Response {
            p: vec![item.into()],
            advanced: false,
        }
    }

    /// Whether the packet that produced this response moved the transfer
    /// forward (accepted new data, advanced a block, or ended the session)
    /// as opposed to being an already-seen duplicate the session ignored.
    pub fn advanced(&self) -> bool {
        self.advanced
    }
}

impl Iterator for Response {
    type Item = ResponseItem;
    fn next(&mut self) -> Option<Self::Item> {
        self.p.pop()
    }
}

impl<T> From<T> for Response
where
    T: Into<ResponseItem>,
{
    fn from(r: T) -> Self {
        Self {
            p: vec![r.into()],
            advanced: true,
        }
    }
}
impl From<Vec<ResponseItem>> for Response {
    fn from(mut v: Vec<ResponseItem>) -> Self {
        v.reverse();
        Self { p: v, advanced: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseItem {
    Packet(Packet),
    Done(TerminationReason),
}

impl<B: Backend> TftpServerProto<B> {
    /// Creates a new instance with the provided backend and configuration.
    pub fn new(backend: B, config: ProtoConfig) -> Self {
        Self { backend, config }
    }

    /// Signals the receipt of a transfer-initiating packet (either RRQ or WRQ).
    /// If a `Transfer` is returned in the first tuple member, that must be used to
    /// handle all future packets from the same client via `Transfer::rx`.
    /// If a `Transfer` is not returned, then a transfer cannot be started from the
    /// received packet.
    ///
    /// In both cases the packet contained in the `Result` should be sent back to the client.
    pub fn rx_initial(
        &mut self,
        packet: Packet,
    ) -> (Option<Transfer<B>>, Result<Packet, TftpError>) {
        let (filename, mode, options, is_read) = match packet {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, true),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, false),
            _ => return (None, Err(TftpError::NotInitiatingPacket)),
        };

        match mode {
            TransferMode::Octet | TransferMode::Netascii => {}
            TransferMode::Mail => return (None, Ok(ErrorCode::IllegalOperation.into())),
        }

        if is_read {
            let reader = match self.backend.get_reader(&filename) {
                Ok(r) => r,
                Err(e) => return (None, Ok(map_backend_err(e).into())),
            };
            let size = reader.size();
            let negotiated = negotiate::negotiate(&options, &self.config.bounds, true, size);
            let (xfer, packet) = Transfer::<B>::new_read(reader, negotiated, self.config.max_retries);
            (xfer, Ok(packet))
        } else {
            let writer = match self.backend.get_writer(&filename) {
                Ok(w) => w,
                Err(e) => return (None, Ok(map_backend_err(e).into())),
            };
            let negotiated = negotiate::negotiate(&options, &self.config.bounds, false, None);
            let (xfer, packet) = Transfer::<B>::new_write(writer, negotiated, self.config.max_retries);
            (xfer, Ok(packet))
        }
    }
}

fn map_backend_err(e: BackendError) -> ErrorCode {
    match e {
        BackendError::FileNotFound => ErrorCode::FileNotFound,
        BackendError::FileExists => ErrorCode::FileExists,
        BackendError::AccessViolation => ErrorCode::AccessViolation,
        BackendError::Unsupported => ErrorCode::IllegalOperation,
        BackendError::Io(_) => ErrorCode::Undefined,
    }
}

fn protocol_violation(msg: &str) -> Response {
    vec![
        ResponseItem::Packet(Packet::ERROR {
            code: ErrorCode::IllegalOperation,
            msg: msg.to_owned(),
        }),
        ResponseItem::Done(TerminationReason::ProtocolViolation),
    ]
    .into()
}

/// A read from the backend failed mid-transfer. Reported with the generic
/// `Undefined` code since the backend gives no finer-grained reason for a
/// read failure the way it does for a write failure (`DiskFull`).
fn io_failure_response() -> Response {
    vec![
        ResponseItem::Packet(ErrorCode::Undefined.into()),
        ResponseItem::Done(TerminationReason::IoFailure),
    ]
    .into()
}

/// The state of an ongoing transfer with one client.
#[derive(Debug)]
pub enum Transfer<B: Backend> {
    Rx(TransferRx<B::W>),
    Tx(TransferTx<B::R>),
    Complete,
}

#[derive(Debug)]
pub struct TransferRx<W: Writer> {
    writer: W,
    /// True until the first valid DATA is accepted; used only to tell an
    /// options-rejection ERROR(8) apart from an ordinary peer error.
    negotiating: bool,
    expected: SerialNumber<u16>,
    last_sent: Packet,
    meta: TransferMeta,
}

#[derive(Debug)]
pub struct TransferTx<R: Reader> {
    reader: R,
    negotiating: bool,
    block: SerialNumber<u16>,
    sent_final: bool,
    last_sent: Packet,
    meta: TransferMeta,
}

impl<B: Backend> Transfer<B> {
    fn new_read(reader: B::R, negotiated: Negotiated, max_retries: u32) -> (Option<Self>, Packet) {
        let meta = TransferMeta {
            blksize: negotiated.blksize,
            timeout: negotiated.timeout,
            retries: 0,
            max_retries,
        };

        if negotiated.accepted.is_empty() {
            let mut tx = TransferTx {
                reader,
                negotiating: false,
                block: SerialNumber(0),
                sent_final: false,
                last_sent: Packet::ACK(0), // placeholder, overwritten below
                meta,
            };
            match tx.advance_or_finish_packet() {
                Ok(packet) => (Some(Transfer::Tx(tx)), packet),
                Err(()) => (None, ErrorCode::Undefined.into()),
            }
        } else {
            let packet = Packet::OACK {
                options: negotiated.accepted,
            };
            let tx = TransferTx {
                reader,
                negotiating: true,
                block: SerialNumber(0),
                sent_final: false,
                last_sent: packet.clone(),
                meta,
            };
            (Some(Transfer::Tx(tx)), packet)
        }
    }

    fn new_write(writer: B::W, negotiated: Negotiated, max_retries: u32) -> (Option<Self>, Packet) {
        let meta = TransferMeta {
            blksize: negotiated.blksize,
            timeout: negotiated.timeout,
            retries: 0,
            max_retries,
        };
        let negotiating = !negotiated.accepted.is_empty();
        let packet = if negotiating {
            Packet::OACK {
                options: negotiated.accepted,
            }
        } else {
            Packet::ACK(0)
        };
        let rx = TransferRx {
            writer,
            negotiating,
            expected: SerialNumber(1),
            last_sent: packet.clone(),
            meta,
        };
        (Some(Transfer::Rx(rx)), packet)
    }

    /// Checks to see if the transfer has completed.
    pub fn is_done(&self) -> bool {
        matches!(*self, Transfer::Complete)
    }

    fn is_negotiating(&self) -> bool {
        match self {
            Transfer::Tx(tx) => tx.negotiating,
            Transfer::Rx(rx) => rx.negotiating,
            Transfer::Complete => false,
        }
    }

    fn cancel_io(&mut self) {
        match self {
            Transfer::Tx(tx) => tx.reader.cancel(),
            Transfer::Rx(rx) => rx.writer.cancel(),
            Transfer::Complete => {}
        }
    }

    /// Call this to indicate that the retransmit timer has expired.
    /// This may return a packet to resend or may terminate the transfer.
    pub fn timeout_expired(&mut self) -> ResponseItem {
        let result = match self {
            Transfer::Rx(rx) => rx.on_timeout(),
            Transfer::Tx(tx) => tx.on_timeout(),
            Transfer::Complete => ResponseItem::Done(TerminationReason::Ok),
        };
        if let ResponseItem::Done(_) = result {
            *self = Transfer::Complete;
        }
        result
    }

    /// Returns the timeout negotiated for this transfer, or `None` once the
    /// transfer has completed.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Transfer::Rx(TransferRx { meta, .. }) | Transfer::Tx(TransferTx { meta, .. }) => {
                Some(meta.timeout)
            }
            Transfer::Complete => None,
        }
    }

    /// Process and consume a received packet.
    /// When the first `ResponseItem::Done` is returned, the transfer is considered complete
    /// and all future calls to `rx` will also return `ResponseItem::Done`.
    ///
    /// Transfer completion can be checked via `Transfer::is_done()`.
    pub fn rx(&mut self, packet: Packet) -> Result<Response, TftpError> {
        if self.is_done() {
            return Ok(Response::not_advanced(ResponseItem::Done(
                TerminationReason::Ok,
            )));
        }

        if let Packet::ERROR { code, msg } = packet {
            let reason = if self.is_negotiating() && code == ErrorCode::OptionsRefused {
                TerminationReason::OptionsRefused
            } else {
                TerminationReason::PeerError { code, msg }
            };
            self.cancel_io();
            *self = Transfer::Complete;
            return Ok(ResponseItem::Done(reason).into());
        }

        let result = match (packet, &mut *self) {
            (Packet::ACK(ack_block), Transfer::Tx(ref mut tx)) => Ok(tx.handle_ack(ack_block)),
            (
                Packet::DATA {
                    block_num,
                    ref data,
                },
                &mut Transfer::Rx(ref mut rx),
            ) => Ok(rx.handle_data(block_num, data)),
            (Packet::RRQ { .. }, _) | (Packet::WRQ { .. }, _) => {
                return Err(TftpError::TransferAlreadyRunning)
            }
            (Packet::DATA { .. }, _) | (Packet::ACK(_), _) | (Packet::OACK { .. }, _) => {
                Ok(protocol_violation("unexpected packet for this transfer"))
            }
        };

        if let Ok(ref r) = result {
            if r.p.iter().any(|i| matches!(i, ResponseItem::Done(_))) {
                // one of the items is a terminal Done; the transfer ends
                // once the caller drains the response, so flag it now.
                *self = Transfer::Complete;
            }
        }
        result
    }
}

impl<R: Reader> TransferTx<R> {
    /// Reads the next chunk (or finishes) and returns the packet to send,
    /// updating `last_sent`/`sent_final`/`block` as a side effect. Used both
    /// from the initial (non-negotiating) send and from `handle_ack`.
    /// `Err(())` means the backend read failed; the reader has already been
    /// cancelled by the time it returns.
    fn advance_or_finish_packet(&mut self) -> Result<Packet, ()> {
        self.block += 1;
        let chunk = match self.reader.read(self.meta.blksize as usize) {
            Ok(chunk) => chunk,
            Err(_) => {
                self.reader.cancel();
                return Err(());
            }
        };
        self.sent_final = chunk.len() < self.meta.blksize as usize;
        let packet = Packet::DATA {
            block_num: self.block.0,
            data: chunk,
        };
        self.last_sent = packet.clone();
        Ok(packet)
    }

    fn handle_ack(&mut self, ack_block: u16) -> Response {
        let ack_block = SerialNumber(ack_block);

        if self.negotiating {
            if ack_block.0 != 0 {
                self.reader.cancel();
                return protocol_violation("expected ACK(0) to start negotiated transfer");
            }
            self.negotiating = false;
            self.meta.retries = 0;
            return match self.advance_or_finish_packet() {
                Ok(packet) => ResponseItem::Packet(packet).into(),
                Err(()) => io_failure_response(),
            };
        }

        if ack_block == self.block {
            self.meta.retries = 0;
            if self.sent_final {
                self.reader.finish();
                return ResponseItem::Done(TerminationReason::Ok).into();
            }
            match self.advance_or_finish_packet() {
                Ok(packet) => ResponseItem::Packet(packet).into(),
                Err(()) => io_failure_response(),
            }
        } else if ack_block + 1 == self.block {
            // retransmitted ACK for the previous block: ignore entirely,
            // don't touch the retry counter or resend anything.
            Response {
                p: vec![],
                advanced: false,
            }
        } else {
            self.reader.cancel();
            protocol_violation("ACK outside the current transfer window")
        }
    }

    fn on_timeout(&mut self) -> ResponseItem {
        if self.meta.retries >= self.meta.max_retries {
            self.reader.cancel();
            return ResponseItem::Done(TerminationReason::TooManyRetries);
        }
        self.meta.retries += 1;
        ResponseItem::Packet(self.last_sent.clone())
    }
}

impl<W: Writer> TransferRx<W> {
    fn handle_data(&mut self, block: u16, data: &[u8]) -> Response {
        self.negotiating = false;
        let block = SerialNumber(block);

        if block == self.expected {
            if self.writer.write(data).is_err() {
                self.writer.cancel();
                return vec![
                    ResponseItem::Packet(ErrorCode::DiskFull.into()),
                    ResponseItem::Done(TerminationReason::IoFailure),
                ]
                .into();
            }
            self.meta.retries = 0;
            let ack = Packet::ACK(block.0);
            self.last_sent = ack.clone();

            if data.len() < self.meta.blksize as usize {
                self.writer.finish();
                vec![
                    ResponseItem::Packet(ack),
                    ResponseItem::Done(TerminationReason::Ok),
                ]
                .into()
            } else {
                self.expected += 1;
                ResponseItem::Packet(ack).into()
            }
        } else if block + 1 == self.expected {
            // retransmitted DATA for the block we already wrote and acked:
            // re-send the ACK without writing the payload again.
            let ack = Packet::ACK(block.0);
            self.last_sent = ack.clone();
            Response::not_advanced(ResponseItem::Packet(ack))
        } else {
            self.writer.cancel();
            protocol_violation("DATA block number out of sequence")
        }
    }

    fn on_timeout(&mut self) -> ResponseItem {
        if self.meta.retries >= self.meta.max_retries {
            self.writer.cancel();
            return ResponseItem::Done(TerminationReason::TooManyRetries);
        }
        self.meta.retries += 1;
        ResponseItem::Packet(self.last_sent.clone())
    }
}
