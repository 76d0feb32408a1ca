use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::session::SessionRegistry;

/// RTP header byte offset of the SSRC field (4 bytes, big-endian).
const SSRC_OFFSET: usize = 8;
/// Minimum datagram length to safely read the SSRC field.
const MIN_RTP_HEADER_LEN: usize = SSRC_OFFSET + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Binds a UDP socket on `port` and forwards every datagram it receives to
/// the matching session's track group, keyed by the SSRC at header offset 8.
/// Runs until the process exits: a read error here means the bound socket
/// is broken, which is unrecoverable for this process.
pub async fn run(
    kind: TrackKind,
    port: u16,
    buffer_size: usize,
    registry: Arc<SessionRegistry>,
) -> ! {
    let addr = format!("0.0.0.0:{port}");
    let socket = UdpSocket::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind ingress socket {addr}: {e}"));

    tracing::info!(?kind, %addr, "ingress listener bound");

    let mut buf = vec![0u8; buffer_size.max(MIN_RTP_HEADER_LEN)];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(?kind, "ingress socket read failed: {e}");
                std::process::exit(1);
            }
        };

        if n < MIN_RTP_HEADER_LEN {
            continue;
        }

        let ssrc = ssrc_of(&buf[..n]);
        let Some(session) = registry.get(ssrc) else {
            continue;
        };

        match kind {
            TrackKind::Video => session.tracks.write_video(&buf[..n]).await,
            TrackKind::Audio => session.tracks.write_audio(&buf[..n]).await,
        }
    }
}

fn ssrc_of(datagram: &[u8]) -> u32 {
    u32::from_be_bytes([
        datagram[SSRC_OFFSET],
        datagram[SSRC_OFFSET + 1],
        datagram[SSRC_OFFSET + 2],
        datagram[SSRC_OFFSET + 3],
    ])
}
