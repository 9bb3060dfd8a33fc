//! Async glue between a [`quinn::Connection`] and a [`Session`].
//!
//! Each stream gets a small read pump that forwards bytes into a channel;
//! the driver task owns the session, turns the crank after every delivery,
//! and writes whatever the engine wants to send back onto the QUIC streams.

use std::collections::HashMap;

use bytes::Bytes;
use log::{debug, trace};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Event, Http3Error, Session};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("protocol error: {0}")]
    Protocol(#[from] Http3Error),
}

fn stream_index(id: quinn::StreamId) -> u64 {
    u64::from(quinn::VarInt::from(id))
}

/// Drives one HTTP/3 session over one QUIC connection until the connection
/// dies or the session hits a connection-fatal protocol error (which closes
/// the connection with the matching application error code).
///
/// Application-targeted events are forwarded on `app`; the HTTP state
/// machine reacts by arming transaction VIOs via the session it shares.
pub async fn drive(
    conn: quinn::Connection,
    mut session: Session,
    app: mpsc::Sender<Event>,
) -> Result<(), DriverError> {
    let (tx, mut rx) = mpsc::channel::<(u64, Bytes, bool)>(64);

    // The session's own unidirectional streams: control, QPACK encoder,
    // QPACK decoder.
    let mut sends: HashMap<u64, quinn::SendStream> = HashMap::new();
    let mut local_ids = [0u64; 3];
    for slot in &mut local_ids {
        let send = conn.open_uni().await?;
        *slot = stream_index(send.id());
        sends.insert(*slot, send);
    }
    session.start(local_ids[0], local_ids[1], local_ids[2]);

    loop {
        // Drain the engine: deliver app events, flush wire bytes.
        let events = match session.process_events() {
            Ok(events) => events,
            Err(err) => {
                debug!(target: "h3", "closing connection: {}", err);
                conn.close(
                    quinn::VarInt::from_u64(err.code.code()).expect("error codes fit a varint"),
                    err.reason.as_bytes(),
                );
                return Err(err.into());
            }
        };
        for event in events {
            if app.send(event).await.is_err() {
                // The application went away; nothing left to drive.
                return Ok(());
            }
        }

        for (id, chain, fin) in session.outgoing() {
            if let Some(send) = sends.get_mut(&id) {
                let bytes = chain.to_bytes();
                trace!(target: "h3", "[{}] sending {} bytes, fin={}", id, bytes.len(), fin);
                send.write_all(&bytes).await?;
                if fin {
                    send.finish().await.ok();
                    sends.remove(&id);
                }
            }
        }

        tokio::select! {
            res = conn.accept_uni() => {
                let recv = res?;
                let id = stream_index(recv.id());
                trace!(target: "h3", "[{}] unidirectional stream accepted", id);
                tokio::spawn(recv_pump(recv, id, tx.clone()));
            }
            res = conn.accept_bi() => {
                let (send, recv) = res?;
                let id = stream_index(send.id());
                trace!(target: "h3", "[{}] request stream accepted", id);
                sends.insert(id, send);
                session.new_transaction(id);
                tokio::spawn(recv_pump(recv, id, tx.clone()));
            }
            delivery = rx.recv() => {
                let Some((id, data, fin)) = delivery else { return Ok(()) };
                session.on_stream_recv(id, &data, fin);
            }
        }
    }
}

/// Copies one stream's inbound bytes into the driver's delivery channel.
async fn recv_pump(mut recv: quinn::RecvStream, id: u64, tx: mpsc::Sender<(u64, Bytes, bool)>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(n)) => {
                if tx
                    .send((id, Bytes::copy_from_slice(&buf[..n]), false))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send((id, Bytes::new(), true)).await;
                return;
            }
            Err(err) => {
                trace!(target: "h3", "[{}] read error: {}", id, err);
                return;
            }
        }
    }
}
