//! Handshake, reader, writer and ping monitor for one connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tributary_core::{ErrorType, TraceContext};

use super::{Connection, ConnectionState, Direction, Queues, RemoteIdentity};
use crate::error::{CallError, ConnectionError, ProtocolError};
use crate::fragment::{CallArgs, Reassembler};
use crate::frame::{try_decode_frame, Frame, FrameType};
use crate::future::Response;
use crate::handler::InboundCall;
use crate::message::{
    decode_call_request, decode_call_response, ArgsFragment, CallRequestHead, CallResponseHead,
    CancelMessage, ClaimMessage, ErrorMessage, InitMessage, CONNECTION_ERROR_ID,
};

/// Id carried by init frames.
const HANDSHAKE_ID: u32 = 0;

/// Upper bound on flushing queued frames once the connection is closing.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Free space kept in the read buffer before each read.
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Bytes gathered into one write.
const WRITE_BATCH_BYTES: usize = 256 * 1024;

/// Run the connection until it closes: handshake, then reader and writer.
pub(super) async fn run<S>(connection: Arc<Connection>, mut stream: S, queues: Queues)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut read_buf = BytesMut::with_capacity(connection.config.read_buffer_size);

    let handshake = async {
        let outcome = match connection.direction {
            Direction::Outbound => {
                initiate_handshake(&connection, &mut stream, &mut read_buf).await
            }
            Direction::Inbound => answer_handshake(&connection, &mut stream, &mut read_buf).await,
        };
        if let Err(ConnectionError::Protocol(error)) = &outcome {
            let frame = Connection::error_frame(
                HANDSHAKE_ID,
                TraceContext::default(),
                &CallError::new(ErrorType::FatalProtocolError, error.to_string()),
            );
            let _ = write_frame(&mut stream, &frame).await;
        }
        outcome
    };
    let result = tokio::select! {
        _ = connection.shutdown.cancelled() => return,
        result = tokio::time::timeout(connection.config.handshake_timeout, handshake) => result,
    };
    match result {
        Ok(Ok(remote)) => connection.identified(remote),
        Ok(Err(error)) => {
            tracing::warn!(
                connection = connection.id,
                peer = %connection.peer_addr,
                error = %error,
                "handshake failed"
            );
            connection.fail(format!("handshake failed: {error}"));
            return;
        }
        Err(_) => {
            connection.fail(ConnectionError::HandshakeTimeout.to_string());
            return;
        }
    }

    let (reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(connection.clone(), writer, queues));
    if connection.config.ping_interval > Duration::ZERO {
        tokio::spawn(ping_monitor(connection.clone()));
    }
    read_loop(connection.clone(), reader, read_buf).await;
    let _ = writer_task.await;
}

async fn initiate_handshake<S>(
    connection: &Connection,
    stream: &mut S,
    read_buf: &mut BytesMut,
) -> Result<RemoteIdentity, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let init = InitMessage::new(&connection.local_host_port, &connection.config.process_name);
    write_frame(
        stream,
        &Frame::new(FrameType::InitRequest, HANDSHAKE_ID, init.encode()?),
    )
    .await?;

    let frame = read_frame(stream, read_buf).await?;
    match frame.frame_type {
        FrameType::InitResponse => Ok(identity(InitMessage::decode(frame.payload)?)),
        FrameType::Error => {
            let message = ErrorMessage::decode(frame.payload)?;
            Err(ConnectionError::Failed {
                reason: format!("handshake rejected: {}", message.message),
            })
        }
        frame_type => Err(ProtocolError::UnexpectedFrame {
            frame_type,
            id: frame.id,
        }
        .into()),
    }
}

async fn answer_handshake<S>(
    connection: &Connection,
    stream: &mut S,
    read_buf: &mut BytesMut,
) -> Result<RemoteIdentity, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = read_frame(stream, read_buf).await?;
    if frame.frame_type != FrameType::InitRequest {
        return Err(ProtocolError::UnexpectedFrame {
            frame_type: frame.frame_type,
            id: frame.id,
        }
        .into());
    }
    let remote = identity(InitMessage::decode(frame.payload)?);

    let init = InitMessage::new(&connection.local_host_port, &connection.config.process_name);
    write_frame(
        stream,
        &Frame::new(FrameType::InitResponse, frame.id, init.encode()?),
    )
    .await?;
    Ok(remote)
}

fn identity(init: InitMessage) -> RemoteIdentity {
    RemoteIdentity {
        host_port: init.host_port().to_string(),
        process_name: init.process_name().to_string(),
    }
}

async fn read_frame<S>(stream: &mut S, read_buf: &mut BytesMut) -> Result<Frame, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = try_decode_frame(read_buf).map_err(ProtocolError::from)? {
            return Ok(frame);
        }
        if stream.read_buf(read_buf).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
}

async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    let bytes = frame.encode().map_err(ProtocolError::from)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_loop<R>(connection: Arc<Connection>, mut reader: R, mut read_buf: BytesMut)
where
    R: AsyncRead + Unpin,
{
    let mut dispatcher = Dispatcher::new(connection.clone());
    loop {
        // Frames that arrived with the previous read, or with the handshake.
        loop {
            if connection.shutdown.is_cancelled() {
                return;
            }
            let frame = match try_decode_frame(&mut read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    dispatcher.fatal(CONNECTION_ERROR_ID, ProtocolError::from(e));
                    return;
                }
            };
            if let Err(fault) = dispatcher.dispatch(frame) {
                match fault {
                    Fault::Protocol { id, error } => dispatcher.fatal(id, error),
                    Fault::Remote(reason) => {
                        tracing::warn!(
                            connection = connection.id,
                            %reason,
                            "peer reported a fatal error"
                        );
                        connection.fail(reason);
                    }
                }
                return;
            }
        }

        read_buf.reserve(READ_CHUNK_BYTES);
        let read = tokio::select! {
            _ = connection.shutdown.cancelled() => return,
            read = reader.read_buf(&mut read_buf) => read,
        };
        match read {
            Ok(0) => {
                connection.fail("connection closed by peer");
                return;
            }
            Ok(n) => {
                tracing::trace!(
                    connection = connection.id,
                    bytes = n,
                    buffered = read_buf.len(),
                    "read"
                );
            }
            Err(e) => {
                connection.fail(format!("read failed: {e}"));
                return;
            }
        }
    }
}

async fn write_loop<W>(connection: Arc<Connection>, mut writer: W, mut queues: Queues)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        let frame = tokio::select! {
            biased;
            frame = queues.control_rx.recv() => frame,
            frame = queues.data_rx.recv() => frame,
            _ = connection.shutdown.cancelled() => break,
        };
        let Some(frame) = frame else {
            break;
        };

        buf.clear();
        if !encode_batch(&connection, &mut buf, frame, &mut queues) {
            return;
        }
        let write = write_all(&mut writer, &buf);
        tokio::pin!(write);
        let written = tokio::select! {
            written = &mut write => written,
            // A batch already started is finished, within the flush bound.
            _ = connection.shutdown.cancelled() => {
                match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut write).await {
                    Ok(written) => written,
                    Err(_) => return,
                }
            }
        };
        if let Err(e) = written {
            connection.fail(format!("write failed: {e}"));
            return;
        }
    }

    // Flush what was queued before the close, such as a final error frame.
    buf.clear();
    while let Ok(frame) = queues.control_rx.try_recv() {
        if frame.encode_into(&mut buf).is_err() {
            break;
        }
    }
    while let Ok(frame) = queues.data_rx.try_recv() {
        if frame.encode_into(&mut buf).is_err() {
            break;
        }
    }
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        if !buf.is_empty() {
            write_all(&mut writer, &buf).await?;
        }
        writer.shutdown().await
    })
    .await;
}

/// Encode `first` and whatever else is already queued, up to one batch.
fn encode_batch(
    connection: &Connection,
    buf: &mut BytesMut,
    first: Frame,
    queues: &mut Queues,
) -> bool {
    let mut next = Some(first);
    while let Some(frame) = next.take() {
        if let Err(e) = frame.encode_into(buf) {
            tracing::error!(
                connection = connection.id,
                id = frame.id,
                error = %e,
                "frame could not be encoded"
            );
            connection.fail(format!("frame could not be encoded: {e}"));
            return false;
        }
        if buf.len() >= WRITE_BATCH_BYTES {
            break;
        }
        next = queues
            .control_rx
            .try_recv()
            .ok()
            .or_else(|| queues.data_rx.try_recv().ok());
    }
    true
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

async fn ping_monitor(connection: Arc<Connection>) {
    let interval = connection.config.ping_interval;
    loop {
        tokio::select! {
            _ = connection.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match connection.ping().await {
            Ok(rtt) => tracing::trace!(connection = connection.id, ?rtt, "ping"),
            Err(error) => {
                if connection.shutdown.is_cancelled() {
                    return;
                }
                tracing::warn!(
                    connection = connection.id,
                    peer = %connection.peer_addr,
                    error = %error,
                    "ping failed, closing connection"
                );
                connection.fail(format!("ping failed: {error}"));
                return;
            }
        }
    }
}

/// Why the reader stops.
#[derive(Debug)]
enum Fault {
    /// We found a fatal protocol violation; report it, then close.
    Protocol { id: u32, error: ProtocolError },
    /// The peer sent a connection-level error.
    Remote(String),
}

struct Partial<H> {
    head: H,
    reassembler: Reassembler,
}

/// Routes decoded frames. Owned by the reader, so partial calls need no lock.
struct Dispatcher {
    connection: Arc<Connection>,
    /// Partial responses keyed by call id, with the generation of the call
    /// they belong to.
    responses: HashMap<u32, (u64, Partial<CallResponseHead>)>,
    requests: HashMap<u32, Partial<CallRequestHead>>,
}

impl Dispatcher {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            responses: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), Fault> {
        let Frame {
            frame_type,
            id,
            payload,
        } = frame;
        tracing::debug!(
            connection = self.connection.id,
            id,
            ?frame_type,
            len = payload.len(),
            "frame received"
        );
        if !self.responses.is_empty() {
            self.prune_responses();
        }

        let result = match frame_type {
            FrameType::CallRequest => self.on_call_request(id, payload),
            FrameType::CallRequestContinue => self.on_request_continue(id, payload),
            FrameType::CallResponse => self.on_call_response(id, payload),
            FrameType::CallResponseContinue => self.on_response_continue(id, payload),
            FrameType::Error => return self.on_error(id, payload),
            FrameType::Cancel => self.on_cancel(id, payload),
            FrameType::Claim => ClaimMessage::decode(payload).map(|claim| {
                tracing::debug!(id, ttl = ?claim.ttl, "claim ignored");
            }),
            FrameType::PingRequest => {
                self.connection
                    .send_control(Frame::empty(FrameType::PingResponse, id));
                Ok(())
            }
            FrameType::PingResponse => {
                self.connection.complete_ping(id);
                Ok(())
            }
            FrameType::InitRequest | FrameType::InitResponse => {
                Err(ProtocolError::UnexpectedFrame { frame_type, id })
            }
        };

        result.map_err(|error| {
            if matches!(
                frame_type,
                FrameType::CallResponse | FrameType::CallResponseContinue
            ) {
                self.responses.remove(&id);
                self.connection
                    .registry
                    .resolve(id, None, Err(CallError::from(error.clone())));
            }
            Fault::Protocol { id, error }
        })
    }

    /// Forget partial responses of calls that completed, timed out or were
    /// cancelled since their first fragment arrived.
    fn prune_responses(&mut self) {
        let registry = &self.connection.registry;
        let before = self.responses.len();
        self.responses
            .retain(|id, (generation, _)| registry.generation(*id) == Some(*generation));
        let pruned = before - self.responses.len();
        if pruned > 0 {
            tracing::debug!(
                connection = self.connection.id,
                pruned,
                "dropped partial responses of finished calls"
            );
        }
    }

    /// Report a fatal violation to the peer and close.
    fn fatal(&mut self, id: u32, error: ProtocolError) {
        tracing::error!(
            connection = self.connection.id,
            peer = %self.connection.peer_addr,
            id,
            error = %error,
            "fatal protocol error, closing connection"
        );
        self.connection.send_error(
            id,
            TraceContext::default(),
            &CallError::new(ErrorType::FatalProtocolError, error.to_string()),
        );
        self.connection.fail(format!("protocol error: {error}"));
    }

    fn on_call_response(&mut self, id: u32, payload: Bytes) -> Result<(), ProtocolError> {
        let Some(generation) = self.connection.registry.generation(id) else {
            tracing::warn!(
                connection = self.connection.id,
                id,
                "dropping response for unknown call id"
            );
            return Ok(());
        };
        let (head, fragment) = match decode_call_response(payload) {
            Ok(decoded) => decoded,
            Err(error) => return self.fail_response(id, error),
        };
        let partial = Partial {
            head,
            reassembler: Reassembler::new(fragment.checksum_type),
        };
        self.push_response(id, generation, partial, fragment)
    }

    fn on_response_continue(&mut self, id: u32, payload: Bytes) -> Result<(), ProtocolError> {
        let Some((generation, partial)) = self.responses.remove(&id) else {
            tracing::warn!(
                connection = self.connection.id,
                id,
                "dropping continuation for unknown call id"
            );
            return Ok(());
        };
        if self.connection.registry.generation(id) != Some(generation) {
            tracing::debug!(id, "dropping continuation for completed call");
            return Ok(());
        }
        let fragment = match ArgsFragment::decode_continue(payload) {
            Ok(fragment) => fragment,
            Err(error) => return self.fail_response(id, error),
        };
        self.push_response(id, generation, partial, fragment)
    }

    fn push_response(
        &mut self,
        id: u32,
        generation: u64,
        mut partial: Partial<CallResponseHead>,
        fragment: ArgsFragment,
    ) -> Result<(), ProtocolError> {
        match partial.reassembler.push(fragment) {
            Ok(Some(args)) => {
                let head = partial.head;
                let response = self
                    .connection
                    .track(Response::new(head.code, head.headers, args, head.trace));
                if !self
                    .connection
                    .registry
                    .resolve(id, Some(generation), Ok(response))
                {
                    tracing::debug!(id, "response arrived after its call completed, dropped");
                }
                Ok(())
            }
            Ok(None) => {
                self.responses.insert(id, (generation, partial));
                Ok(())
            }
            Err(error) => self.fail_response(id, error),
        }
    }

    /// Fail the call for a bad response. Fatal errors are handed back so the
    /// connection closes.
    fn fail_response(&mut self, id: u32, error: ProtocolError) -> Result<(), ProtocolError> {
        if error.is_fatal() {
            return Err(error);
        }
        tracing::warn!(connection = self.connection.id, id, error = %error, "response rejected");
        self.connection
            .registry
            .resolve(id, None, Err(CallError::from(error)));
        Ok(())
    }

    fn on_call_request(&mut self, id: u32, payload: Bytes) -> Result<(), ProtocolError> {
        if self.requests.contains_key(&id) || self.connection.registry.has_inbound(id) {
            return Err(ProtocolError::UnexpectedFrame {
                frame_type: FrameType::CallRequest,
                id,
            });
        }
        let (head, fragment) = match decode_call_request(payload) {
            Ok(decoded) => decoded,
            Err(error) => return self.reject_request(id, TraceContext::default(), error),
        };
        if self.connection.state() != ConnectionState::Identified {
            self.connection.send_error(
                id,
                head.trace,
                &CallError::new(ErrorType::Declined, "connection is closing"),
            );
            return Ok(());
        }
        let partial = Partial {
            reassembler: Reassembler::new(fragment.checksum_type),
            head,
        };
        self.push_request(id, partial, fragment)
    }

    fn on_request_continue(&mut self, id: u32, payload: Bytes) -> Result<(), ProtocolError> {
        let Some(partial) = self.requests.remove(&id) else {
            tracing::warn!(
                connection = self.connection.id,
                id,
                "dropping continuation for unknown request id"
            );
            return Ok(());
        };
        let fragment = match ArgsFragment::decode_continue(payload) {
            Ok(fragment) => fragment,
            Err(error) => return self.reject_request(id, partial.head.trace, error),
        };
        self.push_request(id, partial, fragment)
    }

    fn push_request(
        &mut self,
        id: u32,
        mut partial: Partial<CallRequestHead>,
        fragment: ArgsFragment,
    ) -> Result<(), ProtocolError> {
        match partial.reassembler.push(fragment) {
            Ok(Some(args)) => {
                self.start_handler(id, partial.head, args);
                Ok(())
            }
            Ok(None) => {
                self.requests.insert(id, partial);
                Ok(())
            }
            Err(error) => self.reject_request(id, partial.head.trace, error),
        }
    }

    /// Answer a bad request with an error frame. Fatal errors are handed back
    /// so the connection closes.
    fn reject_request(
        &mut self,
        id: u32,
        trace: TraceContext,
        error: ProtocolError,
    ) -> Result<(), ProtocolError> {
        if error.is_fatal() {
            return Err(error);
        }
        tracing::warn!(connection = self.connection.id, id, error = %error, "request rejected");
        self.connection.send_error(id, trace, &CallError::from(error));
        Ok(())
    }

    fn start_handler(&mut self, id: u32, head: CallRequestHead, args: CallArgs) {
        let connection = &self.connection;
        let trace = head.trace;
        let ttl = head.ttl;
        let method = args.arg1.clone();

        let handler = match connection.handlers.find(&head.service, &method) {
            Ok(handler) => handler,
            Err(error) => {
                tracing::warn!(
                    id,
                    service = %head.service,
                    method = %String::from_utf8_lossy(&method),
                    "no handler for call"
                );
                connection.send_error(id, trace, &error);
                return;
            }
        };

        let call = InboundCall {
            service: head.service,
            headers: head.headers,
            trace,
            ttl,
            args,
            remote_host_port: connection.remote_host_port(),
        };
        let handler_task =
            tokio::spawn(async move { tokio::time::timeout(ttl, handler.handle(call)).await });
        if !connection.registry.register_inbound(id, handler_task.abort_handle()) {
            return;
        }

        let connection = connection.clone();
        tokio::spawn(async move {
            let outcome = match handler_task.await {
                Ok(Ok(result)) => result.map_err(CallError::from),
                Ok(Err(_elapsed)) => Err(CallError::timeout(format!(
                    "handler did not finish within {ttl:?}"
                ))),
                Err(join_error) if join_error.is_panic() => {
                    tracing::error!(connection = connection.id, id, "handler panicked");
                    Err(CallError::new(ErrorType::UnexpectedError, "handler panicked"))
                }
                // Aborted by a cancel or by the connection closing.
                Err(_) => return,
            };
            let _reply = connection.begin_reply();
            if connection.registry.finish_inbound(id) {
                connection.send_reply(id, method, trace, outcome).await;
            }
        });
    }

    fn on_error(&mut self, id: u32, payload: Bytes) -> Result<(), Fault> {
        let message =
            ErrorMessage::decode(payload).map_err(|error| Fault::Protocol { id, error })?;
        let error = CallError::new(message.error_type, message.message);
        self.responses.remove(&id);

        if id == CONNECTION_ERROR_ID || message.error_type.closes_connection() {
            self.connection.registry.resolve(id, None, Err(error.clone()));
            return Err(Fault::Remote(format!("peer reported {error}")));
        }
        if !self.connection.registry.resolve(id, None, Err(error)) {
            tracing::warn!(
                connection = self.connection.id,
                id,
                "dropping error for unknown call id"
            );
        }
        Ok(())
    }

    fn on_cancel(&mut self, id: u32, payload: Bytes) -> Result<(), ProtocolError> {
        let cancel = CancelMessage::decode(payload)?;
        self.requests.remove(&id);
        if self.connection.registry.cancel_inbound(id) {
            tracing::debug!(id, why = %cancel.why, "inbound call cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tributary_core::HostPort;

    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::fragment::{encode_call, CallHead, CallMessage, ChecksumType};
    use crate::future::{FutureState, ResponseFuture};
    use crate::handler::HandlerRegistry;
    use crate::headers::TransportHeaders;
    use crate::message::ResponseCode;

    fn identified() -> (Arc<Connection>, Queues) {
        Connection::new(
            Direction::Outbound,
            "127.0.0.1:1".to_string(),
            ConnectionState::Identified,
            ConnectionConfig::default(),
            HostPort::EPHEMERAL.to_string(),
            Arc::new(HandlerRegistry::new()),
        )
    }

    /// Response frames for `id`, split across several fragments.
    fn fragmented_response(id: u32) -> Vec<Frame> {
        let message = CallMessage {
            head: CallHead::Response(CallResponseHead {
                code: ResponseCode::Ok,
                trace: TraceContext::default(),
                headers: TransportHeaders::new(),
            }),
            checksum_type: ChecksumType::Crc32C,
            args: CallArgs::new("get", "", vec![7u8; 300]),
        };
        let frames = encode_call(id, &message, 128).expect("encode");
        assert!(frames.len() > 1);
        frames
    }

    #[tokio::test]
    async fn test_partial_response_dropped_after_cancel() {
        let (connection, _queues) = identified();
        let mut dispatcher = Dispatcher::new(connection.clone());
        let future = ResponseFuture::new();
        let id = connection
            .registry
            .register(future.clone(), Duration::from_secs(60))
            .expect("register");

        let mut frames = fragmented_response(id).into_iter();
        dispatcher
            .dispatch(frames.next().expect("first"))
            .expect("first fragment");
        assert_eq!(dispatcher.responses.len(), 1);

        assert!(connection.registry.remove(id));
        dispatcher
            .dispatch(Frame::empty(FrameType::PingResponse, 1))
            .expect("unrelated frame");
        assert!(dispatcher.responses.is_empty());

        for frame in frames {
            dispatcher.dispatch(frame).expect("late fragment");
        }
        assert!(dispatcher.responses.is_empty());
        assert_eq!(connection.retained_responses(), 0);
        assert_eq!(future.state(), FutureState::Pending);
    }

    #[tokio::test]
    async fn test_partial_response_dropped_after_timeout() {
        let (connection, _queues) = identified();
        let mut dispatcher = Dispatcher::new(connection.clone());
        let future = ResponseFuture::new();
        let id = connection
            .registry
            .register(future.clone(), Duration::from_millis(20))
            .expect("register");

        let frames = fragmented_response(id);
        dispatcher
            .dispatch(frames[0].clone())
            .expect("first fragment");
        assert_eq!(dispatcher.responses.len(), 1);

        let err = future.get().await.expect_err("timed out");
        assert_eq!(err.error_type(), ErrorType::Timeout);
        dispatcher
            .dispatch(Frame::empty(FrameType::PingResponse, 1))
            .expect("unrelated frame");
        assert!(dispatcher.responses.is_empty());
    }

    #[tokio::test]
    async fn test_fragmented_response_completes_its_call() {
        let (connection, _queues) = identified();
        let mut dispatcher = Dispatcher::new(connection.clone());
        let future = ResponseFuture::new();
        let id = connection
            .registry
            .register(future.clone(), Duration::from_secs(60))
            .expect("register");

        for frame in fragmented_response(id) {
            dispatcher.dispatch(frame).expect("fragment");
        }
        assert!(dispatcher.responses.is_empty());
        let response = future.get().await.expect("response");
        assert_eq!(response.arg3().len(), 300);
    }
}
