//! The per-connection state machine.
//!
//! The teacher splits a connection into a separately-owned reader
//! (`read.rs::ReadStream`) and writer (`write.rs::Writer`), joined only
//! by an mpsc channel and whatever `split.rs` glues together. Here a
//! single task owns the transport end to end, driven by one
//! `tokio::select!` loop. That single-task-per-session structure is also
//! what gives each client the "only one worker touches this session at a
//! time" guarantee without an explicit lock: tokio never polls a task on
//! two threads at once.

use crate::codec::{encode_frame, Decoded, Decoder};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::{is_valid_close_code, Frame, OpCode};
use crate::handshake::{self, HandshakeOutcome};
use crate::manager::{ClientId, Handler, Outbound, SessionManager};
use crate::message::{Assembled, Assembler};
use crate::transport::Transport;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{self, Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Open,
    ClosingLocal,
    ClosingRemote,
    Closed,
}

const READ_CHUNK: usize = 8 * 1024;
static PING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Drives one accepted connection from the HTTP upgrade through to close.
/// Returns once the transport is fully shut down; the caller (`server.rs`)
/// is expected to have already spawned this as its own task.
pub async fn run(
    mut transport: Transport,
    config: Arc<WebSocketConfig>,
    manager: SessionManager,
    handler: Arc<dyn Handler>,
) {
    let peer_addr = match transport.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };

    let mut state = SessionState::Connecting;
    let mut inbound = BytesMut::with_capacity(READ_CHUNK);

    let handshake_deadline = Instant::now() + Duration::from_secs(config.handshake_timeout_secs);
    let request = loop {
        match handshake::parse_request(&inbound) {
            Ok(Some((request, consumed))) => {
                inbound.advance(consumed);
                break request;
            }
            Ok(None) => {}
            Err(_) => return,
        }

        let mut buf = [0u8; READ_CHUNK];
        let read = time::timeout_at(handshake_deadline, transport.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return,
            Ok(Ok(n)) => inbound.extend_from_slice(&buf[..n]),
        }
    };

    let subprotocols = config.subprotocols.clone();
    let outcome = handshake::respond(&request, move |offered| {
        offered.iter().find(|p| subprotocols.iter().any(|s| s == *p)).map(|s| s.to_string())
    });

    let response = match outcome {
        HandshakeOutcome::Rejected { response, .. } => {
            let _ = transport.write_all(&response).await;
            let _ = transport.shutdown().await;
            return;
        }
        HandshakeOutcome::Accepted { response, .. } => response,
    };
    if transport.write_all(&response).await.is_err() {
        return;
    }
    state = SessionState::Open;

    let (client_id, mut outbound_rx) = manager.register(peer_addr);
    handler.on_connect(client_id, &manager);

    let decoder = Decoder::new(config.max_frame_size);
    let mut assembler = Assembler::new(config.max_message_size);

    let mut ping_interval = time::interval(Duration::from_secs(config.ping_interval_secs));
    ping_interval.tick().await; // first tick fires immediately; discard it
    let mut pong_deadline: Option<Instant> = None;
    let mut close_deadline: Option<Instant> = None;
    let mut last_ping_payload: [u8; 8] = [0; 8];

    let (mut disconnect_code, mut disconnect_reason) = (1006u16, String::from("abnormal closure"));

    loop {
        if state == SessionState::Closed {
            break;
        }

        tokio::select! {
            read_result = transport.read_buf(&mut inbound) => {
                match read_result {
                    Ok(0) => {
                        disconnect_code = 1006;
                        disconnect_reason = "connection closed without a close frame".into();
                        break;
                    }
                    Ok(n) => {
                        manager.record_bytes_received(n);
                    }
                    Err(_) => {
                        disconnect_code = 1006;
                        disconnect_reason = "transport read error".into();
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frames(frames)) => {
                        manager.record_message_sent();
                        for frame in frames.iter() {
                            let encoded = encode_frame(frame);
                            manager.record_bytes_sent(encoded.len());
                            if transport.write_all(&encoded).await.is_err() {
                                disconnect_code = 1006;
                                disconnect_reason = "transport write error".into();
                                state = SessionState::Closed;
                                break;
                            }
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        let _ = send_close(&mut transport, code, &reason).await;
                        disconnect_code = code;
                        disconnect_reason = reason;
                        state = SessionState::ClosingLocal;
                        close_deadline = Some(Instant::now() + Duration::from_secs(config.close_timeout_secs));
                    }
                    None => {
                        disconnect_code = 1011;
                        disconnect_reason = "internal channel closed".into();
                        break;
                    }
                }
            }
            _ = ping_interval.tick(), if state == SessionState::Open => {
                let n = PING_COUNTER.fetch_add(1, Ordering::Relaxed);
                last_ping_payload = n.to_be_bytes();
                let frame = Frame::ping(last_ping_payload.to_vec());
                let encoded = encode_frame(&frame);
                if transport.write_all(&encoded).await.is_err() {
                    disconnect_code = 1006;
                    disconnect_reason = "transport write error".into();
                    break;
                }
                pong_deadline = Some(Instant::now() + Duration::from_secs(config.pong_timeout_secs));
            }
            _ = sleep_until_opt(pong_deadline) => {
                disconnect_code = 1001;
                disconnect_reason = "pong not received in time".into();
                break;
            }
            _ = sleep_until_opt(close_deadline) => {
                state = SessionState::Closed;
            }
        }

        if state == SessionState::Closed {
            break;
        }

        // Drain any complete frames the read branch appended to `inbound`.
        loop {
            match decoder.decode_frame(&mut inbound) {
                Ok(Decoded::Frame(frame)) => {
                    match handle_frame(
                        frame,
                        &mut assembler,
                        &mut transport,
                        client_id,
                        &manager,
                        handler.as_ref(),
                        &mut last_ping_payload,
                        &mut pong_deadline,
                    )
                    .await
                    {
                        Ok(None) => {}
                        Ok(Some((code, reason))) => {
                            disconnect_code = code;
                            disconnect_reason = reason;
                            state = SessionState::ClosingRemote;
                        }
                        Err(err) => {
                            let code = err.close_code();
                            let _ = send_close(&mut transport, code, &err.to_string()).await;
                            disconnect_code = code;
                            disconnect_reason = err.to_string();
                            state = SessionState::Closed;
                        }
                    }
                }
                Ok(Decoded::NeedMoreData) => break,
                Err(err) => {
                    let code = err.close_code();
                    let _ = send_close(&mut transport, code, &err.to_string()).await;
                    disconnect_code = code;
                    disconnect_reason = err.to_string();
                    state = SessionState::Closed;
                    break;
                }
            }
            if state == SessionState::Closed {
                break;
            }
        }

        if state == SessionState::ClosingRemote && close_deadline.is_none() {
            state = SessionState::Closed;
        }
    }

    manager.unregister(client_id);
    handler.on_disconnect(client_id, disconnect_code, disconnect_reason, &manager);
    let _ = transport.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    frame: Frame,
    assembler: &mut Assembler,
    transport: &mut Transport,
    client_id: ClientId,
    manager: &SessionManager,
    handler: &dyn Handler,
    last_ping_payload: &mut [u8; 8],
    pong_deadline: &mut Option<Instant>,
) -> Result<Option<(u16, String)>, Error> {
    match assembler.push(frame)? {
        Assembled::Message(message) => {
            manager.record_message_received();
            handler.on_message(client_id, message, manager);
            Ok(None)
        }
        Assembled::Incomplete => Ok(None),
        Assembled::Control(control) => match control.opcode {
            OpCode::Ping => {
                let pong = Frame::pong(control.payload);
                transport.write_all(&encode_frame(&pong)).await?;
                Ok(None)
            }
            OpCode::Pong => {
                if control.payload.as_slice() == last_ping_payload.as_slice() {
                    *pong_deadline = None;
                }
                Ok(None)
            }
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&control.payload)?;
                let echoed = Frame::close(control.payload);
                transport.write_all(&encode_frame(&echoed)).await?;
                Ok(Some((code, reason)))
            }
            _ => unreachable!("only control opcodes reach this branch"),
        },
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), Error> {
    if payload.is_empty() {
        return Ok((1005, String::new()));
    }
    if payload.len() < 2 {
        return Err(Error::Protocol("close frame payload must be empty or at least 2 bytes".into()));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !is_valid_close_code(code) {
        return Err(Error::Protocol(format!("invalid close code {code}")));
    }
    let reason = String::from_utf8(payload[2..].to_vec())?;
    Ok((code, reason))
}

async fn send_close(transport: &mut Transport, code: u16, reason: &str) -> Result<(), Error> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    let frame = Frame::close(payload);
    transport.write_all(&encode_frame(&frame)).await?;
    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}
